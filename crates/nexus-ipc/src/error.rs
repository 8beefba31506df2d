//! Error types for message parsing.

use thiserror::Error;

/// Errors raised while interpreting relay messages and settings values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IpcError {
    /// Resolution string is not "WIDTHxHEIGHT".
    #[error("Invalid resolution: {0:?}")]
    InvalidResolution(String),
}
