//! Error types for the process module.

use thiserror::Error;

/// Errors that can occur while launching or talking to a subprocess.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The OS refused to spawn the program.
    #[error("Failed to spawn {label}: {source}")]
    Spawn {
        label: String,
        #[source]
        source: std::io::Error,
    },

    /// A pipe requested in the spec was not available after spawn.
    #[error("{label}: {pipe} pipe unavailable")]
    MissingPipe { label: String, pipe: &'static str },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
