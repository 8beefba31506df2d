//! Owned handle for a supervised subprocess.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::stderr::Redactor;
use crate::ProcessResult;

/// Writable end of a process pipe.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Readable end of a process pipe.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Receives exactly one [`ProcessExit`] per launched process.
pub type ExitSender = mpsc::UnboundedSender<ProcessExit>;

static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of one process instance (not the OS pid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u64);

impl ProcessId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        Self(NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What to run and which pipes to open.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Short name used in logs (e.g., "source:obs", "master").
    pub label: String,

    /// Program to execute.
    pub program: PathBuf,

    /// Argument list.
    pub args: Vec<String>,

    /// Open a writable stdin pipe.
    pub stdin: bool,

    /// Open a readable stdout pipe.
    pub stdout: bool,

    /// Secrets masked in logged arguments and stderr.
    pub redactor: Redactor,
}

impl ProcessSpec {
    /// Create a spec with no pipes and no redaction.
    pub fn new(label: impl Into<String>, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args,
            stdin: false,
            stdout: false,
            redactor: Redactor::default(),
        }
    }

    /// Open a stdin pipe.
    pub fn with_stdin(mut self) -> Self {
        self.stdin = true;
        self
    }

    /// Open a stdout pipe.
    pub fn with_stdout(mut self) -> Self {
        self.stdout = true;
        self
    }

    /// Mask these secrets in logs.
    pub fn with_redactor(mut self, redactor: Redactor) -> Self {
        self.redactor = redactor;
        self
    }

    /// Redacted command line for logging.
    pub fn display_args(&self) -> String {
        self.redactor.join_args(&self.args)
    }
}

/// Exit notification, delivered once per process instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub id: ProcessId,
    pub label: String,

    /// Exit code, if the process exited normally.
    pub code: Option<i32>,

    /// Whether the exit was caused by [`ManagedProcess::stop`].
    pub killed: bool,

    /// Short failure reason derived from stderr, if recognised.
    pub reason: Option<String>,
}

impl ProcessExit {
    /// Returns true for a zero exit code that was not requested.
    pub fn is_clean(&self) -> bool {
        !self.killed && self.code == Some(0)
    }

    /// Human-readable summary for logs.
    pub fn describe(&self) -> String {
        let base = match (self.killed, self.code) {
            (true, _) => "stopped".to_string(),
            (false, Some(code)) => format!("exited with code {}", code),
            (false, None) => "terminated by signal".to_string(),
        };
        match &self.reason {
            Some(reason) => format!("{}: {}", base, reason),
            None => base,
        }
    }
}

/// An owned subprocess handle.
///
/// `stop` is idempotent and dropping the handle stops the process. The exit
/// notification is sent by the launcher's waiter, never by this handle.
pub struct ManagedProcess {
    id: ProcessId,
    label: String,
    pid: Option<u32>,
    stdin: Option<BoxedWriter>,
    stdout: Option<BoxedReader>,
    kill_tx: Option<oneshot::Sender<()>>,
    started_at: Instant,
}

impl ManagedProcess {
    /// Assemble a handle from launcher-provided parts.
    pub fn from_parts(
        id: ProcessId,
        label: String,
        pid: Option<u32>,
        stdin: Option<BoxedWriter>,
        stdout: Option<BoxedReader>,
        kill_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            id,
            label,
            pid,
            stdin,
            stdout,
            kill_tx: Some(kill_tx),
            started_at: Instant::now(),
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// OS process id, if known.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Time since launch.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Take the stdin pipe. Returns `None` after the first call.
    pub fn take_stdin(&mut self) -> Option<BoxedWriter> {
        self.stdin.take()
    }

    /// Take the stdout pipe. Returns `None` after the first call.
    pub fn take_stdout(&mut self) -> Option<BoxedReader> {
        self.stdout.take()
    }

    /// Whether `stop` has been called.
    pub fn is_stopping(&self) -> bool {
        self.kill_tx.is_none()
    }

    /// Request termination. Returns false if already requested.
    pub fn stop(&mut self) -> bool {
        match self.kill_tx.take() {
            Some(tx) => {
                debug!(label = %self.label, id = %self.id, "Stopping process");
                // The waiter may already have observed the exit; that is fine.
                let _ = tx.send(());
                self.stdin = None;
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("pid", &self.pid)
            .field("stopping", &self.is_stopping())
            .finish()
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawns processes. The seam between the supervisors and the OS.
pub trait ProcessLauncher: Send + Sync {
    /// Launch a process. Its single exit notification is sent on `exits`.
    fn launch(&self, spec: ProcessSpec, exits: ExitSender) -> ProcessResult<ManagedProcess>;
}
