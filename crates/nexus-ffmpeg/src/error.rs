//! Error types for the ffmpeg module.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while running ffprobe.
#[derive(Debug, Error)]
pub enum FfmpegError {
    /// ffprobe could not be spawned.
    #[error("Failed to run ffprobe: {0}")]
    Spawn(#[from] std::io::Error),

    /// ffprobe did not finish in time.
    #[error("ffprobe timed out after {0:?}")]
    Timeout(Duration),

    /// ffprobe exited with a non-zero status.
    #[error("ffprobe exited with code {0:?}")]
    ExitStatus(Option<i32>),

    /// ffprobe output was not valid JSON.
    #[error("Malformed ffprobe output: {0}")]
    Json(#[from] serde_json::Error),

    /// No usable video stream was reported.
    #[error("No usable video stream")]
    NoVideoStream,
}
