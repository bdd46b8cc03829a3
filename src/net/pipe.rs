//! Emulated bottleneck link: capacity queue, random loss, delay and jitter

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam::utils::CachePadded;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Link profile. Zero means "unlimited" for the queue length and capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub queue_length_packets: usize,
    pub queue_delay_ms: i64,
    pub delay_standard_deviation_ms: i64,
    pub link_capacity_kbps: u32,
    pub loss_percent: u32,
}

#[derive(Debug)]
struct NetworkPacket {
    data: Bytes,
    send_time_ms: i64,
    arrival_time_ms: i64,
}

#[derive(Debug, Default)]
pub struct PipeStats {
    pub sent_packets: AtomicU64,
    pub dropped_packets: AtomicU64,
    pub lost_packets: AtomicU64,
    pub total_delay_ms: AtomicU64,
}

impl PipeStats {
    pub fn average_delay_ms(&self) -> u64 {
        let sent = self.sent_packets.load(Ordering::Relaxed);
        if sent == 0 {
            return 0;
        }
        self.total_delay_ms.load(Ordering::Relaxed) / sent
    }
}

/// Packets first wait for their turn on the capacity-limited link, may be
/// lost when they leave it, then sit in a delay line. The delay line never
/// reorders packets.
pub struct FakeNetworkPipe {
    config: LinkConfig,
    capacity_link: VecDeque<NetworkPacket>,
    delay_link: VecDeque<NetworkPacket>,
    rng: StdRng,
    stats: Arc<CachePadded<PipeStats>>,
}

impl FakeNetworkPipe {
    pub fn new(config: LinkConfig) -> Self {
        Self::with_seed(config, rand::random())
    }

    pub fn with_seed(config: LinkConfig, seed: u64) -> Self {
        Self {
            config,
            capacity_link: VecDeque::new(),
            delay_link: VecDeque::new(),
            rng: StdRng::seed_from_u64(seed),
            stats: Arc::new(CachePadded::new(PipeStats::default())),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<CachePadded<PipeStats>> {
        self.stats.clone()
    }

    pub fn send_packet(&mut self, data: Bytes, now_ms: i64) {
        if self.config.queue_length_packets > 0
            && self.capacity_link.len() >= self.config.queue_length_packets
        {
            self.stats.dropped_packets.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("network_pipe_dropped_packets").increment(1);
            return;
        }

        let capacity_delay_ms = match self.config.link_capacity_kbps {
            0 => 0,
            kbps => (data.len() as i64 * 8) / kbps as i64,
        };
        let network_start_ms = self
            .capacity_link
            .back()
            .map_or(now_ms, |last| last.arrival_time_ms.max(now_ms));

        self.capacity_link.push_back(NetworkPacket {
            data,
            send_time_ms: now_ms,
            arrival_time_ms: network_start_ms + capacity_delay_ms,
        });
    }

    /// Moves packets along the link and returns those that have arrived.
    pub fn process(&mut self, now_ms: i64) -> Vec<Bytes> {
        while self
            .capacity_link
            .front()
            .is_some_and(|p| now_ms >= p.arrival_time_ms)
        {
            let Some(mut packet) = self.capacity_link.pop_front() else {
                break;
            };
            if self.rng.random_range(0..100) < self.config.loss_percent {
                self.stats.lost_packets.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let mut extra_delay = self.sample_delay();
            if let Some(last) = self.delay_link.back() {
                extra_delay = extra_delay.max(last.arrival_time_ms - packet.arrival_time_ms);
            }
            packet.arrival_time_ms += extra_delay;
            self.delay_link.push_back(packet);
        }

        let mut arrived = Vec::new();
        while self
            .delay_link
            .front()
            .is_some_and(|p| now_ms >= p.arrival_time_ms)
        {
            let Some(packet) = self.delay_link.pop_front() else {
                break;
            };
            self.stats.sent_packets.fetch_add(1, Ordering::Relaxed);
            self.stats
                .total_delay_ms
                .fetch_add((now_ms - packet.send_time_ms).max(0) as u64, Ordering::Relaxed);
            arrived.push(packet.data);
        }
        arrived
    }

    /// Milliseconds until `process` has something to do, `None` when empty.
    pub fn time_until_next_process(&self, now_ms: i64) -> Option<i64> {
        let next = [self.capacity_link.front(), self.delay_link.front()]
            .into_iter()
            .flatten()
            .map(|p| p.arrival_time_ms)
            .min()?;
        Some((next - now_ms).max(0))
    }

    pub fn queued_packets(&self) -> usize {
        self.capacity_link.len() + self.delay_link.len()
    }

    fn sample_delay(&mut self) -> i64 {
        let mean = self.config.queue_delay_ms as f64;
        let stddev = self.config.delay_standard_deviation_ms as f64;
        if stddev <= 0.0 {
            return self.config.queue_delay_ms.max(0);
        }
        // Box-Muller
        let u1: f64 = self.rng.random_range(f64::EPSILON..1.0);
        let u2: f64 = self.rng.random();
        let normal = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        (mean + stddev * normal).round().max(0.0) as i64
    }
}
