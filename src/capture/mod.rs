pub mod capturer;
pub mod frame;
pub mod generator;

pub use capturer::FrameGeneratorCapturer;
pub use frame::Frame;
pub use generator::{FrameGenerator, ScrollingGenerator, SquareGenerator, YuvFileGenerator};

/// Sink for freshly captured raw frames.
pub trait CaptureInput: Send + Sync {
    fn incoming_captured_frame(&self, frame: &Frame);
}
