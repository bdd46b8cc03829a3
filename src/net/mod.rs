//! Packet plumbing between the send side, the emulated link and the receive
//! side

pub mod pipe;
pub mod transport;

pub use pipe::{FakeNetworkPipe, LinkConfig, PipeStats};
pub use transport::DirectTransport;

use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Any,
    Audio,
    Video,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Ok,
    UnknownSsrc,
    PacketError,
}

/// Outgoing side of a stream. Returns false when the packet was not accepted.
pub trait Transport: Send + Sync {
    fn send_rtp(&self, packet: Bytes) -> bool;
    fn send_rtcp(&self, packet: Bytes) -> bool;
}

/// Incoming side: anything that accepts raw packets from the network.
pub trait PacketReceiver: Send + Sync {
    fn deliver_packet(&self, media: MediaType, packet: Bytes) -> DeliveryStatus;
}
