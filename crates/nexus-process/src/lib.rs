//! Managed media subprocesses.
//!
//! This crate wraps OS processes in an owned handle with an idempotent
//! `stop`, exactly one exit notification per instance, stderr scanning
//! and stream-key redaction for logs.

mod error;
mod launcher;
mod policy;
mod process;
mod stderr;

use std::time::Duration;

pub use error::ProcessError;
pub use launcher::SystemLauncher;
pub use policy::{RestartPolicy, SupervisorState};
pub use process::{
    BoxedReader, BoxedWriter, ExitSender, ManagedProcess, ProcessExit, ProcessId, ProcessLauncher,
    ProcessSpec,
};
pub use stderr::{classify_failure, is_error_line, scan_stderr, Redactor, StderrTail};

/// Result type for process operations.
pub type ProcessResult<T> = Result<T, ProcessError>;

/// Default delay before restarting a crashed process, in milliseconds.
pub const DEFAULT_RESTART_DELAY_MS: u64 = 2000;

/// Number of stderr lines kept for crash diagnostics.
pub const STDERR_TAIL_LINES: usize = 40;

/// How long the exit waiter waits for stderr to reach EOF.
pub const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
