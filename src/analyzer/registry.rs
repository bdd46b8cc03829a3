//! Correlates captured reference frames with send, receive and render events

use std::collections::{HashMap, VecDeque};

use tracing::{debug, trace};

use crate::capture::Frame;
use crate::rtp::is_newer_timestamp;

/// A reference frame paired with what the receiver showed for it.
#[derive(Debug, Clone)]
pub struct FrameComparison {
    pub reference: Frame,
    /// `None` for a dropped frame when nothing has been rendered yet.
    pub render: Option<Frame>,
    pub dropped: bool,
    pub send_time_ms: Option<i64>,
    pub recv_time_ms: Option<i64>,
    pub render_time_ms: i64,
}

/// State guarded by the capture lock.
///
/// Timestamps in `send_times`, `recv_times` and the capture queue are all in
/// the capture domain: `ntp_time_ms * 90`. Sender timestamps are mapped into
/// it by subtracting `rtp_timestamp_delta`, which is learned from the first
/// packet sent.
#[derive(Debug, Default)]
pub struct FrameRegistry {
    capture_queue: VecDeque<Frame>,
    send_times: HashMap<u32, i64>,
    recv_times: HashMap<u32, i64>,
    first_send_frame: Option<Frame>,
    rtp_timestamp_delta: Option<u32>,
    last_rendered_frame: Option<Frame>,
    last_promoted: Option<u32>,
}

impl FrameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rtp_timestamp_delta(&self) -> Option<u32> {
        self.rtp_timestamp_delta
    }

    pub fn pending_captures(&self) -> usize {
        self.capture_queue.len()
    }

    /// `reference` must already carry its capture-domain timestamp.
    pub fn on_captured(&mut self, reference: Frame) {
        if let Some(back) = self.capture_queue.back() {
            debug_assert!(
                is_newer_timestamp(reference.rtp_timestamp, back.rtp_timestamp),
                "captured frames out of order: {} after {}",
                reference.rtp_timestamp,
                back.rtp_timestamp
            );
        }
        if self.rtp_timestamp_delta.is_none() && self.first_send_frame.is_none() {
            self.first_send_frame = Some(reference.clone());
        }
        self.capture_queue.push_back(reference);
    }

    pub fn on_sent(&mut self, rtp_timestamp: u32, now_ntp_ms: i64) {
        if self.rtp_timestamp_delta.is_none() {
            let Some(first) = self.first_send_frame.take() else {
                debug!("Packet sent before any frame was captured");
                return;
            };
            let delta = rtp_timestamp.wrapping_sub(first.rtp_timestamp);
            debug!("RTP timestamp delta {delta}");
            self.rtp_timestamp_delta = Some(delta);
        }
        if let Some(ts) = self.normalize(rtp_timestamp) {
            self.send_times.insert(ts, now_ntp_ms);
        }
    }

    pub fn on_received(&mut self, rtp_timestamp: u32, now_ntp_ms: i64) {
        if let Some(ts) = self.normalize(rtp_timestamp) {
            self.recv_times.insert(ts, now_ntp_ms);
        }
    }

    /// Pairs a rendered frame with its reference. Every capture older than
    /// the rendered one becomes a dropped comparison against the previously
    /// rendered frame. Returns the comparisons in capture order.
    ///
    /// Panics when the capture queue does not contain the rendered frame's
    /// reference: the streams have lost sync.
    pub fn on_rendered(&mut self, rendered: &Frame, render_time_ms: i64) -> Vec<FrameComparison> {
        let delta = self
            .rtp_timestamp_delta
            .unwrap_or_else(|| panic!("frame {} rendered before any packet was sent", rendered.rtp_timestamp));
        let send_ts = rendered.rtp_timestamp.wrapping_sub(delta);

        let mut comparisons = Vec::new();
        while let Some(front) = self.capture_queue.front() {
            if !is_newer_timestamp(send_ts, front.rtp_timestamp) {
                break;
            }
            let Some(reference) = self.capture_queue.pop_front() else {
                break;
            };
            trace!("Frame {} dropped", reference.rtp_timestamp);
            let render = self.last_rendered_frame.clone();
            comparisons.push(self.promote(reference, render, true, render_time_ms));
        }

        let reference = self.capture_queue.pop_front();
        assert_eq!(
            reference.as_ref().map(|f| f.rtp_timestamp),
            Some(send_ts),
            "rendered frame has no matching reference, streams desynchronized"
        );
        if let Some(reference) = reference {
            comparisons.push(self.promote(reference, Some(rendered.clone()), false, render_time_ms));
        }

        self.last_rendered_frame = Some(rendered.clone());
        comparisons
    }

    fn normalize(&self, rtp_timestamp: u32) -> Option<u32> {
        let ts = rtp_timestamp.wrapping_sub(self.rtp_timestamp_delta?);
        let late = self
            .last_promoted
            .is_some_and(|promoted| !is_newer_timestamp(ts, promoted));
        if late {
            trace!("Ignoring timing for already compared frame {ts}");
            return None;
        }
        Some(ts)
    }

    fn promote(
        &mut self,
        reference: Frame,
        render: Option<Frame>,
        dropped: bool,
        render_time_ms: i64,
    ) -> FrameComparison {
        let ts = reference.rtp_timestamp;
        self.last_promoted = Some(ts);
        FrameComparison {
            send_time_ms: self.send_times.remove(&ts),
            recv_time_ms: self.recv_times.remove(&ts),
            reference,
            render,
            dropped,
            render_time_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELTA: u32 = 5_000;

    fn captured(ts: u32) -> Frame {
        let mut frame = Frame::solid(16, 16, ts as u8, 128, 128);
        frame.rtp_timestamp = ts;
        frame.ntp_time_ms = ts as i64 / 90;
        frame
    }

    fn rendered(ts: u32) -> Frame {
        let mut frame = captured(ts);
        frame.rtp_timestamp = ts.wrapping_add(DELTA);
        frame
    }

    fn registry_with(timestamps: &[u32]) -> FrameRegistry {
        let mut registry = FrameRegistry::new();
        for &ts in timestamps {
            registry.on_captured(captured(ts));
        }
        registry.on_sent(timestamps[0] + DELTA, 10);
        registry
    }

    #[test]
    fn delta_is_learned_once_from_first_packet() {
        let mut registry = registry_with(&[900, 1_800]);
        assert_eq!(registry.rtp_timestamp_delta(), Some(DELTA));

        registry.on_sent(1_800 + DELTA + 7, 20);
        assert_eq!(registry.rtp_timestamp_delta(), Some(DELTA));
    }

    #[test]
    fn pairs_rendered_frame_with_timing() {
        let mut registry = registry_with(&[900]);
        registry.on_received(900 + DELTA, 30);

        let comparisons = registry.on_rendered(&rendered(900), 50);
        assert_eq!(comparisons.len(), 1);
        let c = &comparisons[0];
        assert!(!c.dropped);
        assert_eq!(c.reference.rtp_timestamp, 900);
        assert_eq!(c.send_time_ms, Some(10));
        assert_eq!(c.recv_time_ms, Some(30));
        assert_eq!(c.render_time_ms, 50);
        assert_eq!(registry.pending_captures(), 0);
    }

    #[test]
    fn skipped_captures_become_dropped_in_order() {
        let mut registry = registry_with(&[900, 1_800, 2_700, 3_600]);
        registry.on_rendered(&rendered(900), 50);

        let comparisons = registry.on_rendered(&rendered(3_600), 90);
        let summary: Vec<(u32, bool)> = comparisons
            .iter()
            .map(|c| (c.reference.rtp_timestamp, c.dropped))
            .collect();
        assert_eq!(summary, vec![(1_800, true), (2_700, true), (3_600, false)]);

        // dropped frames are compared against the last rendered frame
        let stand_in = comparisons[0].render.as_ref().unwrap();
        assert_eq!(stand_in.rtp_timestamp, 900 + DELTA);
    }

    #[test]
    fn dropped_before_first_render_has_no_stand_in() {
        let mut registry = registry_with(&[900, 1_800]);
        let comparisons = registry.on_rendered(&rendered(1_800), 50);
        assert!(comparisons[0].dropped);
        assert!(comparisons[0].render.is_none());
    }

    #[test]
    fn missing_timing_stays_none() {
        let mut registry = registry_with(&[900, 1_800]);
        registry.on_rendered(&rendered(900), 50);
        let comparisons = registry.on_rendered(&rendered(1_800), 80);
        assert_eq!(comparisons[0].send_time_ms, None);
        assert_eq!(comparisons[0].recv_time_ms, None);
    }

    #[test]
    fn late_packets_after_promotion_are_ignored() {
        let mut registry = registry_with(&[900, 1_800]);
        registry.on_rendered(&rendered(900), 50);

        // retransmission of the compared frame arrives afterwards
        registry.on_received(900 + DELTA, 60);
        registry.on_sent(900 + DELTA, 60);
        assert!(registry.send_times.is_empty());
        assert!(registry.recv_times.is_empty());
    }

    #[test]
    fn timestamps_wrap() {
        let start = u32::MAX - 1_000;
        let mut registry = FrameRegistry::new();
        registry.on_captured(captured(start));
        registry.on_captured(captured(start.wrapping_add(3_000)));
        registry.on_sent(start.wrapping_add(DELTA), 10);

        let comparisons = registry.on_rendered(&rendered(start.wrapping_add(3_000)), 20);
        assert_eq!(comparisons.len(), 2);
        assert!(comparisons[0].dropped);
        assert!(!comparisons[1].dropped);
    }

    #[test]
    #[should_panic(expected = "desynchronized")]
    fn unknown_rendered_frame_panics() {
        let mut registry = registry_with(&[900]);
        registry.on_rendered(&rendered(1_000), 50);
    }
}
