//! Samples the sender's encoder statistics while the test runs

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::Shared;

pub(super) fn run(shared: Arc<Shared>, interval: Duration) {
    debug!("Stats poller started, every {interval:?}");
    // done is manual-reset, so a successful wait leaves it set for everyone
    // else waiting on it
    while !shared.done.wait(interval) {
        let Some(source) = shared.send_stats.read().clone() else {
            trace!("No send stream attached yet");
            continue;
        };
        let stats = source.send_stats();
        trace!("Send stats {stats:?}");
        shared.comparisons.lock().add_send_stats(&stats);
    }
    debug!("Stats poller exiting");
}
