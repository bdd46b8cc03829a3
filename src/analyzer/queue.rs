//! Comparison queue, progress counters and the accumulators they feed

use std::collections::VecDeque;

use super::registry::FrameComparison;
use super::report::AnalyzerResults;
use crate::call::SendStreamStats;

/// PSNR and SSIM of one comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scores {
    pub psnr: f64,
    pub ssim: f64,
}

/// State guarded by the comparison lock.
///
/// `frames_recorded` counts comparisons taken by workers and
/// `frames_processed` those whose results were accumulated; both stop at
/// `frames_to_process`.
#[derive(Debug)]
pub struct ComparisonState {
    frames_to_process: u64,
    comparisons: VecDeque<FrameComparison>,
    frames_enqueued: u64,
    frames_recorded: u64,
    frames_processed: u64,
    last_render_time_ms: Option<i64>,
    results: AnalyzerResults,
}

impl ComparisonState {
    pub fn new(frames_to_process: u64) -> Self {
        Self {
            frames_to_process,
            comparisons: VecDeque::new(),
            frames_enqueued: 0,
            frames_recorded: 0,
            frames_processed: 0,
            last_render_time_ms: None,
            results: AnalyzerResults::default(),
        }
    }

    pub fn frames_to_process(&self) -> u64 {
        self.frames_to_process
    }

    pub fn frames_recorded(&self) -> u64 {
        self.frames_recorded
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    pub fn queued(&self) -> usize {
        self.comparisons.len()
    }

    pub fn all_recorded(&self) -> bool {
        self.frames_recorded >= self.frames_to_process
    }

    pub fn all_processed(&self) -> bool {
        self.frames_processed >= self.frames_to_process
    }

    pub fn results(&self) -> &AnalyzerResults {
        &self.results
    }

    /// Queues a comparison unless the budget is already covered. Returns
    /// whether it was queued.
    pub fn enqueue(&mut self, comparison: FrameComparison) -> bool {
        if self.frames_enqueued >= self.frames_to_process {
            return false;
        }
        self.frames_enqueued += 1;
        self.comparisons.push_back(comparison);
        true
    }

    /// Takes the next comparison and counts it as recorded.
    pub fn pop(&mut self) -> Option<FrameComparison> {
        if self.all_recorded() {
            return None;
        }
        let comparison = self.comparisons.pop_front()?;
        self.frames_recorded += 1;
        debug_assert!(self.frames_recorded <= self.frames_to_process);
        Some(comparison)
    }

    /// Accumulates one finished comparison. Returns true for the last frame
    /// of the budget.
    pub fn frame_processed(&mut self, comparison: &FrameComparison, scores: Option<Scores>) -> bool {
        let r = &mut self.results;
        if let Some(scores) = scores {
            r.psnr.add_sample(scores.psnr);
            r.ssim.add_sample(scores.ssim);
        }

        if comparison.dropped {
            r.dropped_frames += 1;
        } else {
            if let Some(last) = self.last_render_time_ms {
                r.time_between_rendered_frames
                    .add_sample((comparison.render_time_ms - last) as f64);
            }
            self.last_render_time_ms = Some(comparison.render_time_ms);

            let input_time_ms = comparison.reference.ntp_time_ms;
            if let Some(send) = comparison.send_time_ms {
                r.sender_time.add_sample((send - input_time_ms) as f64);
            }
            if let Some(recv) = comparison.recv_time_ms {
                r.receiver_time
                    .add_sample((comparison.render_time_ms - recv) as f64);
            }
            r.total_delay_incl_network
                .add_sample((comparison.render_time_ms - input_time_ms) as f64);
        }

        self.frames_processed += 1;
        assert!(
            self.frames_processed <= self.frames_to_process,
            "processed more frames than budgeted"
        );
        self.frames_processed == self.frames_to_process
    }

    pub fn add_encoded_frame_size(&mut self, bytes: usize) {
        if !self.all_recorded() {
            self.results.encoded_frame_size.add_sample(bytes as f64);
        }
    }

    pub fn add_send_stats(&mut self, stats: &SendStreamStats) {
        let r = &mut self.results;
        r.encode_frame_rate.add_sample(stats.encode_frame_rate as f64);
        r.encode_time.add_sample(stats.avg_encode_time_ms as f64);
        r.encode_usage_percent
            .add_sample(stats.encode_usage_percent as f64);
        r.media_bitrate.add_sample(stats.media_bitrate_bps as f64);
    }
}
