//! OS-backed launcher built on `tokio::process`.

use std::process::Stdio;

use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::error::ProcessError;
use crate::process::{
    BoxedReader, BoxedWriter, ExitSender, ManagedProcess, ProcessExit, ProcessId, ProcessLauncher,
    ProcessSpec,
};
use crate::stderr::{classify_failure, scan_stderr, StderrTail};
use crate::{ProcessResult, STDERR_DRAIN_TIMEOUT};

/// Stderr lines logged with an unexpected exit.
const LOGGED_STDERR_LINES: usize = 10;

// Windows: hide console windows for spawned processes
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Launches real OS processes. Must be called from within a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLauncher;

impl SystemLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessLauncher for SystemLauncher {
    #[instrument(name = "launch", skip_all, fields(label = %spec.label))]
    fn launch(&self, spec: ProcessSpec, exits: ExitSender) -> ProcessResult<ManagedProcess> {
        let id = ProcessId::next();
        info!(
            id = %id,
            "Spawning {} {}",
            spec.program.display(),
            spec.display_args()
        );

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(if spec.stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(if spec.stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            label: spec.label.clone(),
            source,
        })?;

        let pid = child.id();
        let stdin = if spec.stdin {
            let pipe = child.stdin.take().ok_or_else(|| ProcessError::MissingPipe {
                label: spec.label.clone(),
                pipe: "stdin",
            })?;
            Some(Box::new(pipe) as BoxedWriter)
        } else {
            None
        };
        let stdout = if spec.stdout {
            let pipe = child.stdout.take().ok_or_else(|| ProcessError::MissingPipe {
                label: spec.label.clone(),
                pipe: "stdout",
            })?;
            Some(Box::new(pipe) as BoxedReader)
        } else {
            None
        };

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(scan_stderr(
                stderr,
                spec.label.clone(),
                spec.redactor.clone(),
            ))
        });

        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(wait_for_exit(
            child,
            kill_rx,
            id,
            spec.label.clone(),
            exits,
            stderr_task,
        ));

        debug!(id = %id, pid = ?pid, "Process spawned");
        Ok(ManagedProcess::from_parts(
            id, spec.label, pid, stdin, stdout, kill_tx,
        ))
    }
}

/// Waits for the child to exit (or for a stop request) and sends the single exit notification.
async fn wait_for_exit(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    id: ProcessId,
    label: String,
    exits: ExitSender,
    stderr_task: Option<JoinHandle<StderrTail>>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status.ok()),
        // A dropped sender means the handle is gone, which also means stop.
        _ = kill_rx => None,
    };

    let (status, killed) = match exited {
        Some(status) => (status, false),
        None => {
            if let Err(e) = child.start_kill() {
                debug!(label = %label, "Kill failed (already exited?): {}", e);
            }
            (child.wait().await.ok(), true)
        }
    };

    let tail = match stderr_task {
        Some(task) => match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await {
            Ok(Ok(tail)) => tail,
            _ => StderrTail::default(),
        },
        None => StderrTail::default(),
    };

    let reason = if killed {
        None
    } else {
        classify_failure(tail.lines()).map(str::to_string)
    };

    let exit = ProcessExit {
        id,
        label,
        code: status.and_then(|s| s.code()),
        killed,
        reason,
    };

    if exit.killed || exit.is_clean() {
        debug!(label = %exit.label, id = %id, "Process {}", exit.describe());
    } else {
        warn!(label = %exit.label, id = %id, "Process {}", exit.describe());
        for line in tail.last(LOGGED_STDERR_LINES) {
            warn!(label = %exit.label, "  {}", line);
        }
    }

    // Receiver gone means the supervisor shut down; nothing left to notify.
    let _ = exits.send(exit);
}
