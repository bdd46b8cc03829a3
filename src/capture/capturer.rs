//! Paced capture thread feeding a generator into the pipeline

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::capture::generator::FrameGenerator;
use crate::capture::CaptureInput;
use crate::clock::Clock;
use crate::error::{Error, Result};

/// Pulls frames from a generator at a fixed rate, stamps the capture time
/// and hands them to a [`CaptureInput`].
pub struct FrameGeneratorCapturer {
    clock: Arc<dyn Clock>,
    input: Arc<dyn CaptureInput>,
    generator: Option<Box<dyn FrameGenerator>>,
    fps: u32,
    running: Arc<AtomicBool>,
    frames_captured: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl FrameGeneratorCapturer {
    pub fn new(
        clock: Arc<dyn Clock>,
        input: Arc<dyn CaptureInput>,
        generator: Box<dyn FrameGenerator>,
        fps: u32,
    ) -> Result<Self> {
        if fps == 0 {
            return Err(Error::InvalidParams("capture rate must be positive".into()));
        }
        Ok(Self {
            clock,
            input,
            generator: Some(generator),
            fps,
            running: Arc::new(AtomicBool::new(false)),
            frames_captured: Arc::new(AtomicU64::new(0)),
            handle: None,
        })
    }

    pub fn start(&mut self) -> Result<()> {
        let Some(mut generator) = self.generator.take() else {
            warn!("Capturer already started");
            return Ok(());
        };

        let clock = self.clock.clone();
        let input = self.input.clone();
        let running = self.running.clone();
        let frames_captured = self.frames_captured.clone();
        let interval = Duration::from_secs(1) / self.fps;

        running.store(true, Ordering::Release);
        info!("Starting capture at {} fps", self.fps);

        let handle = thread::Builder::new()
            .name("Capturer".into())
            .spawn(move || {
                let start = Instant::now();
                let mut ticks: u32 = 0;
                let mut last_ntp_ms: Option<i64> = None;
                while running.load(Ordering::Acquire) {
                    let mut frame = generator.next_frame();
                    // Capture stamps map to RTP timestamps and must not repeat.
                    let now_ms = clock.now_ntp_ms();
                    frame.ntp_time_ms = last_ntp_ms.map_or(now_ms, |last| now_ms.max(last + 1));
                    last_ntp_ms = Some(frame.ntp_time_ms);
                    input.incoming_captured_frame(&frame);
                    frames_captured.fetch_add(1, Ordering::Relaxed);

                    ticks = ticks.wrapping_add(1);
                    let now = Instant::now();
                    let mut deadline = start + interval * ticks;
                    if deadline <= now {
                        // Resume on the next slot instead of bursting the missed ones.
                        let slot = ((now - start).as_nanos() / interval.as_nanos()) as u32 + 1;
                        debug!(
                            "Capture running {:?} behind, skipping {} frames",
                            now - deadline,
                            slot - ticks
                        );
                        ticks = slot;
                        deadline = start + interval * ticks;
                    }
                    thread::sleep(deadline.saturating_duration_since(Instant::now()));
                }
            })?;

        self.handle = Some(handle);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Capture thread panicked");
            }
            info!(
                "Capturer stopped after {} frames",
                self.frames_captured.load(Ordering::Relaxed)
            );
        }
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured.load(Ordering::Relaxed)
    }
}

impl Drop for FrameGeneratorCapturer {
    fn drop(&mut self) {
        self.stop();
    }
}
