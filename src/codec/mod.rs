//! Video codec seam and the block codec used to drive the pipeline

pub mod block;
pub mod settings;

pub use block::{BlockDecoder, BlockEncoder};
pub use settings::{ContentType, VideoEncoderConfig, VideoStream};

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture::Frame;
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodecType {
    #[serde(rename = "VP8")]
    Vp8,
    #[serde(rename = "VP9")]
    Vp9,
}

impl VideoCodecType {
    pub fn payload_name(&self) -> &'static str {
        match self {
            VideoCodecType::Vp8 => "VP8",
            VideoCodecType::Vp9 => "VP9",
        }
    }

    fn tag(&self) -> u8 {
        match self {
            VideoCodecType::Vp8 => 8,
            VideoCodecType::Vp9 => 9,
        }
    }
}

impl fmt::Display for VideoCodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.payload_name())
    }
}

impl FromStr for VideoCodecType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "VP8" => Ok(VideoCodecType::Vp8),
            "VP9" => Ok(VideoCodecType::Vp9),
            other => Err(Error::UnsupportedCodec(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Key,
    Delta,
}

/// Output of an encoder for one input frame.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub data: Bytes,
    pub frame_type: FrameType,
    pub width: u32,
    pub height: u32,
    pub rtp_timestamp: u32,
    pub capture_time_ms: i64,
    pub picture_id: u16,
    pub temporal_idx: u8,
    pub qp: u8,
}

impl EncodedImage {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("bitstream truncated: need {needed} bytes, have {got}")]
    Truncated { needed: usize, got: usize },

    #[error("bitstream produced by {got}, decoder expects {expected}")]
    WrongCodec {
        expected: VideoCodecType,
        got: u8,
    },

    #[error("delta frame without a reference")]
    MissingReference,

    #[error("picture id gap: expected {expected}, got {got}")]
    PictureIdGap { expected: u16, got: u16 },

    #[error("frame is {got_width}x{got_height}, configured for {width}x{height}")]
    SizeMismatch {
        width: u32,
        height: u32,
        got_width: u32,
        got_height: u32,
    },
}

pub trait VideoEncoder: Send {
    /// Encodes one frame. `Ok(None)` means the rate controller dropped it.
    fn encode(
        &mut self,
        frame: &Frame,
        frame_type: FrameType,
    ) -> Result<Option<EncodedImage>, CodecError>;

    fn set_rates(&mut self, target_bitrate_bps: u32, framerate: u32);

    fn implementation_name(&self) -> &'static str;
}

pub trait VideoDecoder: Send {
    fn decode(&mut self, payload: &[u8]) -> Result<Frame, CodecError>;

    /// Forgets the reference; the next frame must be a keyframe.
    fn reset(&mut self);
}

pub fn create_encoder(config: &VideoEncoderConfig) -> crate::error::Result<Box<dyn VideoEncoder>> {
    config.validate()?;
    Ok(Box::new(BlockEncoder::new(config)))
}

pub fn create_decoder(codec: VideoCodecType) -> Box<dyn VideoDecoder> {
    Box::new(BlockDecoder::new(codec))
}
