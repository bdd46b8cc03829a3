//! Full-stack video quality runner

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fullstack_quality::harness::{cases, FullStackTest};
use fullstack_quality::Config;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "FULLSTACK_CONFIG")]
    config: Option<PathBuf>,

    /// Cases to run, all of them when omitted
    #[arg(long, value_delimiter = ',')]
    case: Vec<String>,

    /// List the known cases and exit
    #[arg(long)]
    list: bool,

    /// Overrides every case's duration
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Directory holding the .yuv resources
    #[arg(long)]
    resources: Option<PathBuf>,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fullstack_quality=info"));
    let console = fmt::layer()
        .with_timer(fmt::time::uptime())
        .with_thread_names(true);
    let registry = tracing_subscriber::registry().with(filter).with(console);

    #[cfg(feature = "profiling")]
    registry.with(tracing_tracy::TracyLayer::default()).init();
    #[cfg(not(feature = "profiling"))]
    registry.init();
}

fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    let args = Args::parse();

    if args.list {
        for (name, params) in cases::all() {
            println!("{name:<42} {}", params.test_label);
        }
        return Ok(());
    }

    // Load configuration
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(dir) = args.resources {
        config.resources.dir = dir;
    }
    if let Some(duration_secs) = args.duration_secs {
        config.test.duration_secs = Some(duration_secs);
    }
    fullstack_quality::CONFIG.store(Arc::new(config));

    let names: Vec<String> = if args.case.is_empty() {
        cases::NAMES.iter().map(|n| n.to_string()).collect()
    } else {
        args.case
    };

    info!("Full-stack runner launching {} cases", names.len());

    let mut failed = Vec::new();
    for name in &names {
        let params = cases::find(name)?;
        match FullStackTest::new().run(&params) {
            Ok(report) => info!(
                "{name} passed: {} frames, psnr {:.2} dB, ssim {:.4}",
                report.frames_processed,
                report.results.psnr.mean(),
                report.results.ssim.mean()
            ),
            Err(e) => {
                error!("{name} failed: {e}");
                failed.push(name.as_str());
            }
        }
    }

    if !failed.is_empty() {
        return Err(eyre!("{} of {} cases failed: {}", failed.len(), names.len(), failed.join(", ")));
    }
    info!("All cases passed");
    Ok(())
}
