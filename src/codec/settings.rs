use serde::{Deserialize, Serialize};

use super::VideoCodecType;
use crate::error::{Error, Result};

/// Frames between forced keyframes when nothing else asks for one.
pub const DEFAULT_KEY_FRAME_INTERVAL: u32 = 3_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    #[default]
    Realtime,
    Screen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoStream {
    pub width: u32,
    pub height: u32,
    pub max_framerate: u32,
    pub min_bitrate_bps: u32,
    pub target_bitrate_bps: u32,
    pub max_bitrate_bps: u32,
    /// Upper bound of the quantizer shift, 0..=7.
    pub max_qp: u8,
    pub temporal_layer_thresholds_bps: Vec<u32>,
}

impl Default for VideoStream {
    fn default() -> Self {
        Self {
            width: 320,
            height: 180,
            max_framerate: 30,
            min_bitrate_bps: 30_000,
            target_bitrate_bps: 300_000,
            max_bitrate_bps: 2_000_000,
            max_qp: 7,
            temporal_layer_thresholds_bps: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoEncoderConfig {
    pub codec: VideoCodecType,
    pub streams: Vec<VideoStream>,
    pub content_type: ContentType,
    pub number_of_temporal_layers: u8,
    pub frame_dropping: bool,
    pub key_frame_interval: u32,
}

impl VideoEncoderConfig {
    pub fn new(codec: VideoCodecType, stream: VideoStream) -> Self {
        Self {
            codec,
            streams: vec![stream],
            content_type: ContentType::Realtime,
            number_of_temporal_layers: 1,
            frame_dropping: true,
            key_frame_interval: DEFAULT_KEY_FRAME_INTERVAL,
        }
    }

    /// Screen content: no frame dropping, two temporal layers split at the
    /// target bitrate.
    pub fn screenshare(mut self) -> Self {
        self.content_type = ContentType::Screen;
        self.frame_dropping = false;
        self.number_of_temporal_layers = 2;
        for stream in &mut self.streams {
            stream.temporal_layer_thresholds_bps = vec![stream.target_bitrate_bps];
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidEncoderConfig(msg));

        if self.streams.is_empty() {
            return invalid("no streams configured".into());
        }
        if !(1..=4).contains(&self.number_of_temporal_layers) {
            return invalid(format!(
                "{} temporal layers, expected 1..=4",
                self.number_of_temporal_layers
            ));
        }
        for (i, s) in self.streams.iter().enumerate() {
            if s.width == 0 || s.height == 0 {
                return invalid(format!("stream {i}: empty resolution {}x{}", s.width, s.height));
            }
            if s.width > u16::MAX as u32 || s.height > u16::MAX as u32 {
                return invalid(format!("stream {i}: resolution {}x{} too large", s.width, s.height));
            }
            if s.max_framerate == 0 {
                return invalid(format!("stream {i}: zero framerate"));
            }
            if s.min_bitrate_bps == 0
                || s.min_bitrate_bps > s.target_bitrate_bps
                || s.target_bitrate_bps > s.max_bitrate_bps
            {
                return invalid(format!(
                    "stream {i}: bitrates must satisfy 0 < min {} <= target {} <= max {}",
                    s.min_bitrate_bps, s.target_bitrate_bps, s.max_bitrate_bps
                ));
            }
            if s.max_qp > 7 {
                return invalid(format!("stream {i}: max_qp {} above 7", s.max_qp));
            }
            let thresholds = &s.temporal_layer_thresholds_bps;
            if !thresholds.is_empty()
                && thresholds.len() != self.number_of_temporal_layers as usize - 1
            {
                return invalid(format!(
                    "stream {i}: {} layer thresholds for {} temporal layers",
                    thresholds.len(),
                    self.number_of_temporal_layers
                ));
            }
            if thresholds.windows(2).any(|w| w[0] >= w[1]) {
                return invalid(format!("stream {i}: layer thresholds not increasing"));
            }
        }
        Ok(())
    }
}
