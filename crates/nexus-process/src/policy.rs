//! Restart policy and supervision state.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::DEFAULT_RESTART_DELAY_MS;

/// Supervision state of a restartable process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupervisorState {
    /// No process and nothing scheduled.
    #[default]
    Idle,

    /// Process is running.
    Running { pid: Option<u32> },

    /// Process exited; a restart is scheduled.
    RestartPending { attempt: u32 },
}

impl SupervisorState {
    /// Check if a process is running.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    /// Check if a restart is pending.
    pub fn is_restart_pending(&self) -> bool {
        matches!(self, Self::RestartPending { .. })
    }

    /// Get status message for logs and UI.
    pub fn message(&self) -> String {
        match self {
            Self::Idle => "Idle".to_string(),
            Self::Running { pid: Some(pid) } => format!("Running (pid {})", pid),
            Self::Running { pid: None } => "Running".to_string(),
            Self::RestartPending { attempt } => format!("Restart pending (attempt {})", attempt),
        }
    }
}

/// Restart policy for supervised processes.
///
/// Backoff is fixed: a crashed process is restarted after `delay` every time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Delay between an unexpected exit and the restart.
    pub delay: Duration,

    /// Maximum consecutive restarts; `None` restarts indefinitely.
    pub max_attempts: Option<u32>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(DEFAULT_RESTART_DELAY_MS),
            max_attempts: None,
        }
    }
}

impl RestartPolicy {
    /// Policy with a fixed delay and no attempt cap.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    /// Delay for a given attempt number.
    pub fn delay_for_attempt(&self, _attempt: u32) -> Duration {
        self.delay
    }

    /// Check if more attempts are allowed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}
