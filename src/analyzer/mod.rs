//! End-to-end video quality analyzer.
//!
//! [`VideoAnalyzer`] sits on every edge of the loopback call: it taps the
//! captured frames, the outgoing and incoming RTP, the encoder output and the
//! rendered frames. Captured frames are kept as references until the
//! receiver renders the matching frame (or a later one, which makes the
//! reference a dropped frame). The resulting pairs are scored on a pool of
//! comparison workers and aggregated into [`AnalyzerReport`].

pub mod event;
pub mod poller;
pub mod queue;
pub mod registry;
pub mod report;
pub mod stats;
pub mod worker;

pub use event::{Event, ResetMode};
pub use queue::{ComparisonState, Scores};
pub use registry::{FrameComparison, FrameRegistry};
pub use report::{AnalyzerReport, AnalyzerResults};
pub use stats::Statistics;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::call::{EncodedFrameObserver, Renderer, SendStatsProvider};
use crate::capture::{CaptureInput, Frame};
use crate::clock::Clock;
use crate::codec::EncodedImage;
use crate::error::Result;
use crate::net::{DeliveryStatus, MediaType, PacketReceiver, Transport};
use crate::quality::FrameMetric;
use crate::rtp::{self, RtpHeader, VIDEO_CLOCK_KHZ};
use crate::utils;
use crate::Config;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AnalyzerError {
    #[error(
        "analyzer stalled while waiting for test to finish: \
         {frames_processed} of {frames_to_process} frames processed"
    )]
    Stalled {
        frames_processed: u64,
        frames_to_process: u64,
    },
}

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub test_label: String,
    pub frames_to_process: u64,
    pub comparison_threads: usize,
    pub stats_polling_interval: Duration,
    /// `wait()` checks for progress once per tick.
    pub wait_timeout: Duration,
}

impl AnalyzerConfig {
    pub fn new(test_label: &str, frames_to_process: u64, config: &Config) -> Self {
        let analyzer = &config.analyzer;
        let comparison_threads = analyzer.comparison_threads.unwrap_or_else(|| {
            utils::comparison_threads(
                utils::available_cores(),
                analyzer.reserved_cores,
                analyzer.max_comparison_threads,
            )
        });
        Self {
            test_label: test_label.to_string(),
            frames_to_process,
            comparison_threads: comparison_threads.max(1),
            stats_polling_interval: Duration::from_millis(analyzer.stats_polling_interval_ms),
            wait_timeout: Duration::from_millis(analyzer.wait_timeout_ms),
        }
    }
}

struct Shared {
    test_label: String,
    frames_to_process: u64,
    clock: Arc<dyn Clock>,
    metric: Arc<dyn FrameMetric>,
    capture: Mutex<FrameRegistry>,
    comparisons: Mutex<ComparisonState>,
    /// Auto-reset; set per queued comparison, broadcast when no more work
    /// will come.
    wake: Event,
    /// Manual-reset; set when the budget is processed or on shutdown.
    done: Event,
    shutdown: AtomicBool,
    input: RwLock<Option<Arc<dyn CaptureInput>>>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    receiver: RwLock<Option<Arc<dyn PacketReceiver>>>,
    send_stats: RwLock<Option<Arc<dyn SendStatsProvider>>>,
}

impl Shared {
    fn report(&self) -> AnalyzerReport {
        let state = self.comparisons.lock();
        AnalyzerReport {
            test_label: self.test_label.clone(),
            frames_to_process: self.frames_to_process,
            frames_processed: state.frames_processed(),
            results: *state.results(),
        }
    }
}

pub struct VideoAnalyzer {
    shared: Arc<Shared>,
    wait_timeout: Duration,
    workers: Mutex<Vec<JoinHandle<()>>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl VideoAnalyzer {
    /// Starts the comparison workers and the stats poller. Downstream
    /// collaborators are attached afterwards with the `set_*` methods.
    pub fn new(
        config: AnalyzerConfig,
        clock: Arc<dyn Clock>,
        metric: Arc<dyn FrameMetric>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            test_label: config.test_label.clone(),
            frames_to_process: config.frames_to_process,
            clock,
            metric,
            capture: Mutex::new(FrameRegistry::new()),
            comparisons: Mutex::new(ComparisonState::new(config.frames_to_process)),
            wake: Event::auto_reset(),
            done: Event::manual_reset(),
            shutdown: AtomicBool::new(false),
            input: RwLock::new(None),
            transport: RwLock::new(None),
            receiver: RwLock::new(None),
            send_stats: RwLock::new(None),
        });

        info!(
            "Analyzing {} frames for {} with {} comparison threads",
            config.frames_to_process, config.test_label, config.comparison_threads
        );

        let analyzer = Self {
            shared: shared.clone(),
            wait_timeout: config.wait_timeout,
            workers: Mutex::new(Vec::with_capacity(config.comparison_threads)),
            poller: Mutex::new(None),
        };

        if config.frames_to_process == 0 {
            shared.report().print();
            shared.done.set();
            shared.wake.broadcast();
        }

        for index in 0..config.comparison_threads {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name("Analyzer".into())
                .spawn(move || worker::run(shared, index))?;
            analyzer.workers.lock().push(handle);
        }

        let interval = config.stats_polling_interval;
        let handle = thread::Builder::new()
            .name("StatsPoller".into())
            .spawn(move || poller::run(shared, interval))?;
        *analyzer.poller.lock() = Some(handle);

        Ok(analyzer)
    }

    pub fn set_input(&self, input: Arc<dyn CaptureInput>) {
        *self.shared.input.write() = Some(input);
    }

    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        *self.shared.transport.write() = Some(transport);
    }

    pub fn set_receiver(&self, receiver: Arc<dyn PacketReceiver>) {
        *self.shared.receiver.write() = Some(receiver);
    }

    pub fn set_send_stats(&self, source: Arc<dyn SendStatsProvider>) {
        *self.shared.send_stats.write() = Some(source);
    }

    pub fn frames_processed(&self) -> u64 {
        self.shared.comparisons.lock().frames_processed()
    }

    pub fn is_done(&self) -> bool {
        self.shared.done.is_set()
    }

    pub fn report(&self) -> AnalyzerReport {
        self.shared.report()
    }

    /// Blocks until every budgeted frame is processed. Each timeout tick must
    /// show more processed frames than the previous one, the first tick only
    /// sets the baseline.
    pub fn wait(&self) -> std::result::Result<AnalyzerReport, AnalyzerError> {
        let mut last_processed: Option<u64> = None;
        let mut ticks = 0u64;
        while !self.shared.done.wait(self.wait_timeout) {
            let (processed, recorded) = {
                let comparisons = self.shared.comparisons.lock();
                (comparisons.frames_processed(), comparisons.frames_recorded())
            };
            ticks += 1;
            info!(
                "Still comparing frames: {processed} of {} processed, {recorded} taken",
                self.shared.frames_to_process
            );

            if let Some(last) = last_processed {
                if processed <= last {
                    error!("No progress since the previous check");
                    return Err(AnalyzerError::Stalled {
                        frames_processed: processed,
                        frames_to_process: self.shared.frames_to_process,
                    });
                }
            }
            last_processed = Some(processed);
        }
        if ticks > 0 {
            info!("Analysis complete after {ticks} progress checks");
        }

        self.shared.done.set();
        self.join_poller();
        Ok(self.report())
    }

    /// Releases every thread and detaches downstream collaborators.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.done.set();
        self.shared.wake.broadcast();

        self.shared.input.write().take();
        self.shared.transport.write().take();
        self.shared.receiver.write().take();
        self.shared.send_stats.write().take();

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                warn!("Comparison worker panicked");
            }
        }
        self.join_poller();
    }

    fn join_poller(&self) {
        if let Some(handle) = self.poller.lock().take() {
            if handle.join().is_err() {
                warn!("Stats poller panicked");
            }
        }
    }

    fn parse_timestamp(packet: &[u8]) -> Option<u32> {
        if rtp::is_rtcp(packet) {
            return None;
        }
        match RtpHeader::parse(packet) {
            Ok((header, _, _)) => Some(header.timestamp),
            Err(e) => {
                debug!("Unparsable RTP packet: {e}");
                None
            }
        }
    }
}

impl Drop for VideoAnalyzer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl CaptureInput for VideoAnalyzer {
    fn incoming_captured_frame(&self, frame: &Frame) {
        let mut reference = frame.clone();
        reference.rtp_timestamp = (frame.ntp_time_ms as u32).wrapping_mul(VIDEO_CLOCK_KHZ);
        self.shared.capture.lock().on_captured(reference);

        let input = self.shared.input.read().clone();
        if let Some(input) = input {
            input.incoming_captured_frame(frame);
        }
    }
}

impl Transport for VideoAnalyzer {
    fn send_rtp(&self, packet: Bytes) -> bool {
        if let Some(ts) = Self::parse_timestamp(&packet) {
            let now = self.shared.clock.now_ntp_ms();
            self.shared.capture.lock().on_sent(ts, now);
        }
        let transport = self.shared.transport.read().clone();
        transport.is_some_and(|t| t.send_rtp(packet))
    }

    fn send_rtcp(&self, packet: Bytes) -> bool {
        let transport = self.shared.transport.read().clone();
        transport.is_some_and(|t| t.send_rtcp(packet))
    }
}

impl PacketReceiver for VideoAnalyzer {
    fn deliver_packet(&self, media: MediaType, packet: Bytes) -> DeliveryStatus {
        if let Some(ts) = Self::parse_timestamp(&packet) {
            let now = self.shared.clock.now_ntp_ms();
            self.shared.capture.lock().on_received(ts, now);
        }
        let receiver = self.shared.receiver.read().clone();
        match receiver {
            Some(receiver) => receiver.deliver_packet(media, packet),
            None => DeliveryStatus::PacketError,
        }
    }
}

impl EncodedFrameObserver for VideoAnalyzer {
    fn on_encoded_frame(&self, image: &EncodedImage) {
        self.shared
            .comparisons
            .lock()
            .add_encoded_frame_size(image.len());
    }
}

impl Renderer for VideoAnalyzer {
    fn render_frame(&self, frame: &Frame) {
        let render_time_ms = self.shared.clock.now_ntp_ms();
        let mut registry = self.shared.capture.lock();
        let comparisons = registry.on_rendered(frame, render_time_ms);

        let mut state = self.shared.comparisons.lock();
        for comparison in comparisons {
            if state.enqueue(comparison) {
                self.shared.wake.set();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicI64;
    use std::time::Instant;

    use bytes::Bytes;

    use super::*;
    use crate::quality::I420Metric;
    use crate::rtp::RtpPacket;

    const DELTA: u32 = 1_234_567;

    struct FakeClock(AtomicI64);

    impl Clock for FakeClock {
        fn now_ntp_ms(&self) -> i64 {
            self.0.fetch_add(1, Ordering::Relaxed)
        }

        fn time_ms(&self) -> i64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    /// Blocks PSNR until released so tests can observe lock freedom.
    struct GatedMetric {
        gate: Event,
        entered: Event,
    }

    impl FrameMetric for GatedMetric {
        fn psnr(&self, reference: &Frame, test: &Frame) -> f64 {
            self.entered.set();
            self.gate.wait(Duration::from_secs(10));
            I420Metric.psnr(reference, test)
        }

        fn ssim(&self, reference: &Frame, test: &Frame) -> f64 {
            I420Metric.ssim(reference, test)
        }
    }

    fn config(frames: u64, threads: usize) -> AnalyzerConfig {
        AnalyzerConfig {
            test_label: "unit".into(),
            frames_to_process: frames,
            comparison_threads: threads,
            stats_polling_interval: Duration::from_millis(20),
            wait_timeout: Duration::from_millis(200),
        }
    }

    fn analyzer(frames: u64, metric: Arc<dyn FrameMetric>) -> VideoAnalyzer {
        let clock = Arc::new(FakeClock(AtomicI64::new(1_000)));
        VideoAnalyzer::new(config(frames, 2), clock, metric).unwrap()
    }

    fn frame(ntp: i64) -> Frame {
        let mut frame = Frame::solid(32, 32, (ntp % 200) as u8, 128, 128);
        frame.ntp_time_ms = ntp;
        frame
    }

    fn rtp(capture_ntp: i64) -> Bytes {
        RtpPacket::new(
            RtpHeader {
                payload_type: 124,
                timestamp: (capture_ntp as u32 * 90).wrapping_add(DELTA),
                ..Default::default()
            },
            Bytes::from_static(&[0x10]),
        )
        .marshal()
    }

    /// Runs one frame through every tap of the analyzer.
    fn loop_frame(analyzer: &VideoAnalyzer, ntp: i64, render: bool) {
        analyzer.incoming_captured_frame(&frame(ntp));
        analyzer.send_rtp(rtp(ntp));
        analyzer.deliver_packet(MediaType::Video, rtp(ntp));
        if render {
            let mut rendered = frame(ntp);
            rendered.rtp_timestamp = (ntp as u32 * 90).wrapping_add(DELTA);
            analyzer.render_frame(&rendered);
        }
    }

    #[test]
    fn identical_frames_report_max_quality() {
        let analyzer = analyzer(3, Arc::new(I420Metric));
        for i in 0..3 {
            loop_frame(&analyzer, 100 + 33 * i, true);
        }
        let report = analyzer.wait().unwrap();
        analyzer.shutdown();

        assert_eq!(report.frames_processed, 3);
        assert_eq!(report.results.dropped_frames, 0);
        assert_eq!(report.results.psnr.mean(), crate::quality::MAX_PSNR);
        assert!(report.results.ssim.mean() > 0.999);
        assert_eq!(report.results.sender_time.count(), 3);
        assert_eq!(report.results.time_between_rendered_frames.count(), 2);
    }

    #[test]
    fn unrendered_frames_count_as_dropped() {
        let analyzer = analyzer(4, Arc::new(I420Metric));
        loop_frame(&analyzer, 100, true);
        loop_frame(&analyzer, 133, false);
        loop_frame(&analyzer, 166, false);
        loop_frame(&analyzer, 200, true);
        let report = analyzer.wait().unwrap();
        analyzer.shutdown();

        assert_eq!(report.results.dropped_frames, 2);
        assert_eq!(report.results.total_delay_incl_network.count(), 2);
        assert_eq!(report.results.psnr.count(), 4);
    }

    #[test]
    fn single_frame_budget_finishes_after_one_render() {
        let analyzer = analyzer(1, Arc::new(I420Metric));
        loop_frame(&analyzer, 100, true);
        loop_frame(&analyzer, 133, true);
        let report = analyzer.wait().unwrap();
        analyzer.shutdown();
        assert_eq!(report.frames_processed, 1);
        assert_eq!(report.results.psnr.count(), 1);
    }

    #[test]
    fn zero_budget_is_done_immediately() {
        let analyzer = analyzer(0, Arc::new(I420Metric));
        assert!(analyzer.is_done());
        let report = analyzer.wait().unwrap();
        analyzer.shutdown();
        assert_eq!(report.results.psnr.count(), 0);
        assert_eq!(report.results.psnr.mean(), 0.0);
    }

    #[test]
    fn stall_is_reported_within_two_ticks() {
        let analyzer = analyzer(5, Arc::new(I420Metric));
        loop_frame(&analyzer, 100, true);

        let started = Instant::now();
        let err = analyzer.wait().unwrap_err();
        analyzer.shutdown();

        assert_eq!(
            err,
            AnalyzerError::Stalled {
                frames_processed: 1,
                frames_to_process: 5
            }
        );
        assert!(started.elapsed() < Duration::from_millis(200 * 3));
    }

    #[test]
    fn slow_metric_does_not_block_callbacks() {
        let metric = Arc::new(GatedMetric {
            gate: Event::manual_reset(),
            entered: Event::manual_reset(),
        });
        let analyzer = analyzer(3, metric.clone());
        loop_frame(&analyzer, 100, true);
        assert!(metric.entered.wait(Duration::from_secs(2)));

        // a worker is parked inside PSNR; every tap must still go through
        let started = Instant::now();
        loop_frame(&analyzer, 133, true);
        loop_frame(&analyzer, 166, true);
        analyzer.on_encoded_frame(&crate::codec::EncodedImage {
            data: Bytes::from_static(&[0; 10]),
            frame_type: crate::codec::FrameType::Delta,
            width: 32,
            height: 32,
            rtp_timestamp: 0,
            capture_time_ms: 0,
            picture_id: 0,
            temporal_idx: 0,
            qp: 0,
        });
        assert!(started.elapsed() < Duration::from_secs(1));

        metric.gate.set();
        let report = analyzer.wait().unwrap();
        analyzer.shutdown();
        assert_eq!(report.frames_processed, 3);
        assert_eq!(report.results.encoded_frame_size.count(), 1);
    }

    #[test]
    fn forwards_to_attached_collaborators() {
        #[derive(Default)]
        struct Sink(Mutex<usize>);

        impl Transport for Sink {
            fn send_rtp(&self, _packet: Bytes) -> bool {
                *self.0.lock() += 1;
                true
            }

            fn send_rtcp(&self, _packet: Bytes) -> bool {
                *self.0.lock() += 1;
                true
            }
        }

        let analyzer = analyzer(1, Arc::new(I420Metric));
        assert!(!analyzer.send_rtcp(Bytes::from_static(b"x")));

        let sink = Arc::new(Sink::default());
        analyzer.set_transport(sink.clone());
        analyzer.incoming_captured_frame(&frame(100));
        assert!(analyzer.send_rtp(rtp(100)));
        assert!(analyzer.send_rtcp(Bytes::from_static(b"x")));
        assert_eq!(*sink.0.lock(), 2);

        analyzer.shutdown();
        assert!(!analyzer.send_rtp(rtp(100)));
    }
}
