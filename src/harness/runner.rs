//! Builds the loopback call around a [`VideoAnalyzer`] and runs one case

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::analyzer::{AnalyzerConfig, AnalyzerReport, VideoAnalyzer};
use crate::call::receive_stream::{ReceiveStreamConfig, VideoReceiveStream};
use crate::call::send_stream::{SendStreamConfig, VideoSendStream};
use crate::capture::{FrameGenerator, FrameGeneratorCapturer, ScrollingGenerator, YuvFileGenerator};
use crate::clock::{Clock, RealTimeClock};
use crate::codec::{VideoEncoderConfig, VideoStream};
use crate::error::Result;
use crate::net::DirectTransport;
use crate::quality::{FrameMetric, I420Metric};
use crate::{utils, Config, CONFIG};

use super::params::{ContentMode, FullStackTestParams};

pub const SLIDES: [&str; 4] = [
    "web_screenshot_1850_1110",
    "presentation_1850_1110",
    "photo_1850_1110",
    "difficult_photo_1850_1110",
];
pub const SLIDE_WIDTH: u32 = 1850;
pub const SLIDE_HEIGHT: u32 = 1110;
/// Static slides change every this many seconds.
const SLIDE_DISPLAY_SECS: u32 = 10;
const SCROLL_TIME_MS: i64 = 2_000;
const PAUSE_TIME_MS: i64 = 8_000;

pub struct FullStackTest {
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    metric: Arc<dyn FrameMetric>,
    generator: Option<Box<dyn FrameGenerator>>,
}

impl Default for FullStackTest {
    fn default() -> Self {
        Self::new()
    }
}

impl FullStackTest {
    /// Real-time clock, I420 metrics and the current global configuration.
    pub fn new() -> Self {
        Self {
            config: CONFIG.load_full(),
            clock: Arc::new(RealTimeClock),
            metric: Arc::new(I420Metric),
            generator: None,
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn with_metric(mut self, metric: Arc<dyn FrameMetric>) -> Self {
        self.metric = metric;
        self
    }

    /// Replaces the file backed source. The generator must produce frames of
    /// the clip size.
    pub fn with_generator(mut self, generator: Box<dyn FrameGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn run(mut self, params: &FullStackTestParams) -> Result<AnalyzerReport> {
        let params = match self.config.test.duration_secs {
            Some(duration_secs) => params.clone().with_duration(duration_secs),
            None => params.clone(),
        };
        params.validate()?;
        let codec = params.codec_type()?;

        let stream = VideoStream {
            width: params.clip.width,
            height: params.clip.height,
            max_framerate: params.clip.fps,
            min_bitrate_bps: params.min_bitrate_bps,
            target_bitrate_bps: params.target_bitrate_bps,
            max_bitrate_bps: params.max_bitrate_bps,
            ..VideoStream::default()
        };
        let mut encoder_config = VideoEncoderConfig::new(codec, stream);
        if params.mode.is_screenshare() {
            encoder_config = encoder_config.screenshare();
        }
        encoder_config.validate()?;

        let generator = match self.generator.take() {
            Some(generator) => generator,
            None => self.create_generator(&params)?,
        };

        info!(
            "Running {} ({} {}x{}@{}, {:?}) for {} s over {:?}",
            params.test_label,
            codec,
            params.clip.width,
            params.clip.height,
            params.clip.fps,
            params.mode,
            params.duration_secs,
            params.link
        );

        let clock = self.clock.clone();
        let send_transport = Arc::new(DirectTransport::new("send", params.link, clock.clone())?);
        let recv_transport = Arc::new(DirectTransport::new("recv", params.link, clock.clone())?);

        let analyzer = Arc::new(VideoAnalyzer::new(
            AnalyzerConfig::new(&params.test_label, params.frames_to_process(), &self.config),
            clock.clone(),
            self.metric.clone(),
        )?);

        let send_stream = Arc::new(VideoSendStream::new(
            SendStreamConfig::new(encoder_config),
            clock.clone(),
            analyzer.clone(),
            Some(analyzer.clone()),
        )?);
        let receive_stream = Arc::new(VideoReceiveStream::new(
            ReceiveStreamConfig::new(codec),
            clock.clone(),
            recv_transport.clone(),
            analyzer.clone(),
        ));

        // sender -> analyzer -> send link -> analyzer -> receiver, RTCP back
        // over the receive link
        analyzer.set_transport(send_transport.clone());
        analyzer.set_receiver(receive_stream.clone());
        analyzer.set_input(send_stream.clone());
        analyzer.set_send_stats(send_stream.clone());
        send_transport.set_receiver(analyzer.clone());
        recv_transport.set_receiver(send_stream.clone());

        let mut capturer =
            FrameGeneratorCapturer::new(clock, analyzer.clone(), generator, params.clip.fps)?;

        let outcome = (|| -> Result<AnalyzerReport> {
            receive_stream.start()?;
            send_stream.start()?;
            capturer.start()?;
            Ok(analyzer.wait()?)
        })();

        capturer.stop();
        send_transport.stop_sending();
        recv_transport.stop_sending();
        send_stream.stop();
        receive_stream.stop();
        analyzer.shutdown();

        info!(
            "{}: {} frames captured, {} decoded, {} retransmissions",
            params.test_label,
            capturer.frames_captured(),
            receive_stream.frames_decoded(),
            send_stream.retransmissions()
        );

        let report = outcome?;
        let delay = &report.results.total_delay_incl_network;
        info!(
            "{}: total delay {:.1} ms mean, {:.0}..{:.0} ms",
            params.test_label,
            delay.mean(),
            delay.min().unwrap_or_default(),
            delay.max().unwrap_or_default()
        );
        if let Err(e) = report.check_thresholds(params.avg_psnr_threshold, params.avg_ssim_threshold) {
            warn!("{e}");
            return Err(e);
        }
        Ok(report)
    }

    fn create_generator(&self, params: &FullStackTestParams) -> Result<Box<dyn FrameGenerator>> {
        let clip = &params.clip;
        let dir = self.config.resources.dir.as_path();
        let generator: Box<dyn FrameGenerator> = match params.mode {
            ContentMode::RealTime => {
                let path = utils::resource_path(dir, &clip.name, "yuv")?;
                Box::new(YuvFileGenerator::open(&[path], clip.width, clip.height, 1)?)
            }
            ContentMode::ScreenshareStatic => Box::new(YuvFileGenerator::open(
                &slide_paths(dir)?,
                SLIDE_WIDTH,
                SLIDE_HEIGHT,
                SLIDE_DISPLAY_SECS * clip.fps,
            )?),
            ContentMode::ScreenshareScrolling => Box::new(ScrollingGenerator::from_files(
                self.clock.clone(),
                &slide_paths(dir)?,
                SLIDE_WIDTH,
                SLIDE_HEIGHT,
                clip.width,
                clip.height,
                SCROLL_TIME_MS,
                PAUSE_TIME_MS,
            )?),
        };
        Ok(generator)
    }
}

fn slide_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    SLIDES
        .iter()
        .map(|name| utils::resource_path(dir, name, "yuv"))
        .collect()
}
