//! Error types for the engine.

use std::path::PathBuf;

use thiserror::Error;

/// Errors returned to callers of engine operations.
///
/// Subprocess failures never surface here; they degrade the broadcast and
/// are reported through state and warnings instead.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The requested fallback video does not exist.
    #[error("Video not found: {}", .0.display())]
    VideoNotFound(PathBuf),
}

/// A producer wrote something that is not an FLV stream.
#[derive(Debug, Error)]
pub enum FlvError {
    #[error("Missing FLV signature")]
    BadSignature,

    #[error("FLV header length {0} is below the minimum of 9")]
    BadHeaderLength(usize),
}
