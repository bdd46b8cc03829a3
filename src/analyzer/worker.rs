//! Comparison workers: pull a pair off the queue, score it without holding
//! any lock, then fold the result into the accumulators

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::queue::Scores;
use super::Shared;

/// Longest an idle worker sleeps before re-checking the queue.
pub const IDLE_WAIT: Duration = Duration::from_secs(1);

pub(super) fn run(shared: Arc<Shared>, index: usize) {
    debug!("Comparison worker {index} started");
    while !shared.shutdown.load(Ordering::Acquire) {
        let popped = {
            let mut state = shared.comparisons.lock();
            if state.all_recorded() {
                drop(state);
                shared.wake.broadcast();
                break;
            }
            state.pop()
        };

        let Some(comparison) = popped else {
            shared.wake.wait(IDLE_WAIT);
            continue;
        };

        let started = Instant::now();
        let scores = comparison.render.as_ref().map(|render| Scores {
            psnr: shared.metric.psnr(&comparison.reference, render),
            ssim: shared.metric.ssim(&comparison.reference, render),
        });
        metrics::histogram!("analyzer_comparison_ms")
            .record(started.elapsed().as_secs_f64() * 1_000.0);
        if comparison.dropped {
            metrics::counter!("analyzer_dropped_frames").increment(1);
        }

        let finished = {
            let mut state = shared.comparisons.lock();
            state.frame_processed(&comparison, scores)
        };

        if finished {
            info!("All {} frames processed", shared.frames_to_process);
            shared.report().print();
            shared.done.set();
            shared.wake.broadcast();
            break;
        }
    }
    debug!("Comparison worker {index} exiting");
}
