use std::path::PathBuf;

use thiserror::Error;

use crate::analyzer::AnalyzerError;
use crate::codec::CodecError;
use crate::rtp::RtpError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("codec not supported: {0:?}")]
    UnsupportedCodec(String),

    #[error("invalid encoder configuration: {0}")]
    InvalidEncoderConfig(String),

    #[error("invalid test parameters: {0}")]
    InvalidParams(String),

    #[error("resource not found: {}", .0.display())]
    ResourceNotFound(PathBuf),

    #[error(
        "{}: size {len} is not a multiple of the {frame_size} byte frame size",
        .path.display()
    )]
    InvalidYuvFile {
        path: PathBuf,
        len: u64,
        frame_size: usize,
    },

    #[error("unknown test case {0:?}")]
    UnknownTestCase(String),

    #[error("{label}: {metric} mean {mean:.4} is not above threshold {threshold:.4}")]
    QualityBelowThreshold {
        label: String,
        metric: &'static str,
        mean: f64,
        threshold: f64,
    },

    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),

    #[error(transparent)]
    Rtp(#[from] RtpError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
