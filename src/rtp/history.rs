//! Bounded history of sent RTP packets for NACK retransmission

use bytes::Bytes;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

struct StoredPacket {
    sequence_number: u16,
    sent_at_ms: i64,
    packet: Bytes,
}

/// Ring buffer of recently sent packets. The oldest entry is overwritten
/// when full, and entries older than `history_ms` are culled on access.
pub struct PacketHistory {
    ring: HeapRb<StoredPacket>,
    history_ms: i64,
    overwritten: u64,
}

impl PacketHistory {
    pub fn new(capacity: usize, history_ms: i64) -> Self {
        Self {
            ring: HeapRb::new(capacity.max(1)),
            history_ms,
            overwritten: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.history_ms > 0
    }

    pub fn put(&mut self, sequence_number: u16, packet: Bytes, now_ms: i64) {
        if !self.is_enabled() {
            return;
        }
        self.cull(now_ms);
        let evicted = self.ring.push_overwrite(StoredPacket {
            sequence_number,
            sent_at_ms: now_ms,
            packet,
        });
        if evicted.is_some() {
            self.overwritten += 1;
        }
    }

    /// The stored packet, if still within the history window.
    pub fn get(&mut self, sequence_number: u16, now_ms: i64) -> Option<Bytes> {
        self.cull(now_ms);
        self.ring
            .iter()
            .find(|p| p.sequence_number == sequence_number)
            .map(|p| p.packet.clone())
    }

    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Packets evicted because the ring was full rather than expired.
    pub fn overwritten(&self) -> u64 {
        self.overwritten
    }

    fn cull(&mut self, now_ms: i64) {
        while let Some(oldest) = self.ring.try_peek() {
            if now_ms - oldest.sent_at_ms <= self.history_ms {
                break;
            }
            self.ring.try_pop();
        }
    }
}
