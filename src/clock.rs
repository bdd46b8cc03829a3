//! Wall-clock and monotonic time sources shared by every pipeline stage

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

/// Milliseconds between the NTP epoch (1900) and the Unix epoch (1970).
pub const NTP_UNIX_OFFSET_MS: i64 = 2_208_988_800_000;

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

pub trait Clock: Send + Sync {
    /// Wall clock in NTP milliseconds. Sender and receiver share it, so
    /// differences between stages are latencies.
    fn now_ntp_ms(&self) -> i64;

    /// Monotonic milliseconds, only meaningful as differences.
    fn time_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RealTimeClock;

impl Clock for RealTimeClock {
    fn now_ntp_ms(&self) -> i64 {
        let since_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        since_unix + NTP_UNIX_OFFSET_MS
    }

    fn time_ms(&self) -> i64 {
        PROCESS_START.elapsed().as_millis() as i64
    }
}
