//! Frame decode, resampling, and batched inference: components B, C, D, E.

pub mod detector;
pub mod engine;
pub mod resampler;
pub mod source;

pub use detector::MultiStreamDetector;
pub use engine::{DetectionModel, InferenceEngine};
pub use resampler::run_resampler;
pub use source::{open_frame_source, run_opened_frame_source};
