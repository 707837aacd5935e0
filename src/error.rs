//! Error taxonomy for the accident pipeline.
//!
//! Fatal errors (source/model cannot be opened) propagate to the
//! coordinator and are reported to whatever started the session.
//! Transient errors are swallowed at the nearest component boundary so
//! the pipeline stays live; they are logged via `tracing` instead.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("failed to initialize frame source for camera '{camera_id}': {reason}")]
    FatalInit { camera_id: String, reason: String },

    #[error("failed to load inference model from '{path}': {reason}")]
    ModelLoad { path: String, reason: String },

    #[error("inference error: {0}")]
    Inference(String),
}

pub type AppResult<T> = std::result::Result<T, AppError>;

/// A mid-stream read failure. Never fatal: a file source treats it as
/// end of stream, a live source logs it and retries. Not part of
/// `AppError` because it is never propagated — components observe it
/// locally and decide EOF-vs-retry themselves rather than bubbling a
/// typed error up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientRead {
    Eof,
    RetryAfter,
}
