pub mod analyzer;
pub mod call;
pub mod capture;
pub mod clock;
pub mod codec;
pub mod error;
pub mod harness;
pub mod net;
pub mod quality;
pub mod rtp;
pub mod utils;

use std::path::{Path, PathBuf};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::info;

pub use error::{Error, Result};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Environment overrides look like `FULLSTACK__ANALYZER__RESERVED_CORES=2`.
pub const ENV_PREFIX: &str = "FULLSTACK";

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub analyzer: AnalyzerSettings,
    pub resources: ResourceSettings,
    pub test: TestSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerSettings {
    /// Cores left to the call itself when sizing the comparison pool.
    pub reserved_cores: usize,
    pub max_comparison_threads: usize,
    /// Overrides the core based pool size.
    pub comparison_threads: Option<usize>,
    pub stats_polling_interval_ms: u64,
    pub wait_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSettings {
    /// Directory holding the `.yuv` clips and slides.
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestSettings {
    /// Replaces every case's own duration when set.
    pub duration_secs: Option<u64>,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            reserved_cores: 4,
            max_comparison_threads: 8,
            comparison_threads: None,
            stats_polling_interval_ms: 1_000,
            wait_timeout_ms: 30_000,
        }
    }
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("resources"),
        }
    }
}

impl Config {
    /// Layers defaults, then the optional TOML file, then `FULLSTACK__*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            info!("Loading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_without_file() {
        let config = Config::load(None).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.analyzer.wait_timeout_ms, 30_000);
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[analyzer]\nreserved_cores = 2\ncomparison_threads = 3\n\n[resources]\ndir = \"/data/clips\""
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.analyzer.reserved_cores, 2);
        assert_eq!(config.analyzer.comparison_threads, Some(3));
        assert_eq!(config.analyzer.max_comparison_threads, 8);
        assert_eq!(config.resources.dir, PathBuf::from("/data/clips"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = Config::load(Some(Path::new("/nonexistent/fullstack.toml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
