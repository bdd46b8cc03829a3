//! Full-stack test driver: a loopback call with an emulated link, measured
//! end to end by the analyzer.

pub mod cases;
pub mod params;
pub mod runner;

pub use params::{Clip, ContentMode, FullStackTestParams};
pub use runner::FullStackTest;
