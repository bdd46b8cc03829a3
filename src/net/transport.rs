//! Transport that pushes packets through a [`FakeNetworkPipe`] on its own
//! delivery thread

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::utils::CachePadded;
use flume::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::pipe::{FakeNetworkPipe, LinkConfig, PipeStats};
use super::{MediaType, PacketReceiver, Transport};
use crate::clock::Clock;
use crate::error::Result;

const IDLE_WAIT: Duration = Duration::from_millis(100);

type ReceiverSlot = Arc<RwLock<Option<Arc<dyn PacketReceiver>>>>;

pub struct DirectTransport {
    name: String,
    tx: Sender<Bytes>,
    receiver: ReceiverSlot,
    running: Arc<AtomicBool>,
    stats: Arc<CachePadded<PipeStats>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DirectTransport {
    pub fn new(name: &str, link: LinkConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::with_pipe(name, FakeNetworkPipe::new(link), clock)
    }

    pub fn with_pipe(name: &str, pipe: FakeNetworkPipe, clock: Arc<dyn Clock>) -> Result<Self> {
        let (tx, rx) = flume::unbounded::<Bytes>();
        let receiver: ReceiverSlot = Arc::new(RwLock::new(None));
        let running = Arc::new(AtomicBool::new(true));
        let stats = pipe.stats();

        info!("{}: link {:?}", name, pipe.config());

        let handle = {
            let receiver = receiver.clone();
            let running = running.clone();
            thread::Builder::new()
                .name(format!("{name}-transport"))
                .spawn(move || deliver_loop(pipe, rx, receiver, running, clock))?
        };

        Ok(Self {
            name: name.to_string(),
            tx,
            receiver,
            running,
            stats,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn set_receiver(&self, receiver: Arc<dyn PacketReceiver>) {
        *self.receiver.write() = Some(receiver);
    }

    pub fn stats(&self) -> &PipeStats {
        &self.stats
    }

    /// Stops the delivery thread. Queued packets are discarded and the
    /// receiver is released.
    pub fn stop_sending(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("{}: delivery thread panicked", self.name);
            }
            info!(
                "{}: stopped, {} delivered, {} lost, {} dropped at queue, avg delay {} ms",
                self.name,
                self.stats.sent_packets.load(Ordering::Relaxed),
                self.stats.lost_packets.load(Ordering::Relaxed),
                self.stats.dropped_packets.load(Ordering::Relaxed),
                self.stats.average_delay_ms(),
            );
        }
        self.receiver.write().take();
    }

    fn enqueue(&self, packet: Bytes) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        self.tx.send(packet).is_ok()
    }
}

impl Transport for DirectTransport {
    fn send_rtp(&self, packet: Bytes) -> bool {
        self.enqueue(packet)
    }

    fn send_rtcp(&self, packet: Bytes) -> bool {
        self.enqueue(packet)
    }
}

impl Drop for DirectTransport {
    fn drop(&mut self) {
        self.stop_sending();
    }
}

fn deliver_loop(
    mut pipe: FakeNetworkPipe,
    rx: Receiver<Bytes>,
    receiver: ReceiverSlot,
    running: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
) {
    while running.load(Ordering::Acquire) {
        let wait = pipe
            .time_until_next_process(clock.time_ms())
            .map_or(IDLE_WAIT, |ms| Duration::from_millis(ms as u64));

        match rx.recv_timeout(wait) {
            Ok(packet) => {
                pipe.send_packet(packet, clock.time_ms());
                for packet in rx.try_iter() {
                    pipe.send_packet(packet, clock.time_ms());
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let arrived = pipe.process(clock.time_ms());
        if arrived.is_empty() {
            continue;
        }
        let Some(target) = receiver.read().clone() else {
            debug!("No receiver attached, discarding {} packets", arrived.len());
            continue;
        };
        for packet in arrived {
            target.deliver_packet(MediaType::Any, packet);
        }
    }
}
