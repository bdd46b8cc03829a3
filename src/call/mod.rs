//! Loopback send and receive video streams

pub mod receive_stream;
pub mod send_stream;

pub use receive_stream::{ReceiveStreamConfig, VideoReceiveStream};
pub use send_stream::{SendStreamConfig, VideoSendStream};

use serde::{Deserialize, Serialize};

use crate::capture::Frame;
use crate::codec::EncodedImage;

/// Payload type of the video stream.
pub const VIDEO_PAYLOAD_TYPE: u8 = 124;
pub const RTX_PAYLOAD_TYPE: u8 = 98;
pub const SEND_SSRC: u32 = 0x00C0_FFED;
pub const RTX_SSRC: u32 = 0x0BAD_CAFD;
pub const RECEIVER_LOCAL_SSRC: u32 = 0x0012_3456;
pub const NACK_HISTORY_MS: i64 = 1_000;
pub const MAX_PAYLOAD_SIZE: usize = 1_200;

/// Payload descriptor bit marking the first packet of a frame.
pub(crate) const START_OF_FRAME: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtxConfig {
    pub ssrc: u32,
    pub payload_type: u8,
}

/// Final stage of the receive pipeline.
pub trait Renderer: Send + Sync {
    fn render_frame(&self, frame: &Frame);
}

/// Sees every encoded frame before it is packetized.
pub trait EncodedFrameObserver: Send + Sync {
    fn on_encoded_frame(&self, image: &EncodedImage);
}

/// Encoder side statistics over the last second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendStreamStats {
    pub encode_frame_rate: u32,
    pub avg_encode_time_ms: u32,
    pub encode_usage_percent: u32,
    pub media_bitrate_bps: u32,
}

pub trait SendStatsProvider: Send + Sync {
    fn send_stats(&self) -> SendStreamStats;
}
