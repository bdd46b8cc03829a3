use serde::{Deserialize, Serialize};

use crate::codec::VideoCodecType;
use crate::error::{Error, Result};
use crate::net::LinkConfig;

/// Default length of a run.
pub const DEFAULT_DURATION_SECS: u64 = 60;

/// Source clip. `name` doubles as the resource file stem for real-time video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clip {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Clip {
    pub fn new(name: &str, width: u32, height: u32, fps: u32) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            fps,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentMode {
    #[default]
    RealTime,
    ScreenshareStatic,
    ScreenshareScrolling,
}

impl ContentMode {
    pub fn is_screenshare(self) -> bool {
        !matches!(self, ContentMode::RealTime)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullStackTestParams {
    pub test_label: String,
    pub clip: Clip,
    #[serde(default)]
    pub mode: ContentMode,
    pub min_bitrate_bps: u32,
    pub target_bitrate_bps: u32,
    pub max_bitrate_bps: u32,
    #[serde(default)]
    pub avg_psnr_threshold: f64,
    #[serde(default)]
    pub avg_ssim_threshold: f64,
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
    /// Payload name, `"VP8"` or `"VP9"`.
    pub codec: String,
    #[serde(default)]
    pub link: LinkConfig,
}

fn default_duration_secs() -> u64 {
    DEFAULT_DURATION_SECS
}

impl FullStackTestParams {
    /// Number of captured frames the analyzer compares.
    pub fn frames_to_process(&self) -> u64 {
        self.duration_secs * self.clip.fps as u64
    }

    pub fn codec_type(&self) -> Result<VideoCodecType> {
        self.codec.parse()
    }

    pub fn with_duration(mut self, duration_secs: u64) -> Self {
        self.duration_secs = duration_secs;
        self
    }

    /// Cheap sanity checks, run before anything is built.
    pub fn validate(&self) -> Result<()> {
        if self.clip.width == 0 || self.clip.height == 0 || self.clip.fps == 0 {
            return Err(Error::InvalidParams(format!(
                "{}: clip {} is {}x{}@{}",
                self.test_label, self.clip.name, self.clip.width, self.clip.height, self.clip.fps
            )));
        }
        if self.link.loss_percent > 100 {
            return Err(Error::InvalidParams(format!(
                "{}: loss of {}%",
                self.test_label, self.link.loss_percent
            )));
        }
        Ok(())
    }
}
