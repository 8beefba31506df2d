//! Broadcast state machine types.

use serde::{Deserialize, Serialize};

use crate::types::SourceKind;

/// Snapshot of the broadcast, exposed to API and WebSocket observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastState {
    /// Whether a broadcast is running.
    pub broadcast_active: bool,

    /// Which upstream signal is (or is meant to be) live.
    pub current_source: SourceKind,

    /// Whether the operator forced fallback for a failover test.
    pub manual_fallback_active: bool,
}

impl BroadcastState {
    /// Returns the state machine phase for this snapshot.
    pub fn phase(&self) -> BroadcastPhase {
        if self.broadcast_active {
            BroadcastPhase::Broadcasting {
                source: self.current_source,
                manual: self.manual_fallback_active,
            }
        } else {
            BroadcastPhase::Idle
        }
    }

    /// Returns true if no broadcast is running.
    pub fn is_idle(&self) -> bool {
        !self.broadcast_active
    }

    /// Returns true if broadcasting from the given source.
    pub fn is_live_on(&self, source: SourceKind) -> bool {
        self.broadcast_active && self.current_source == source
    }
}

/// The two orchestrator states. `Idle` is both initial and re-enterable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BroadcastPhase {
    /// Not broadcasting.
    #[default]
    Idle,

    /// Broadcasting from `source`; `manual` marks a forced fallback.
    Broadcasting { source: SourceKind, manual: bool },
}

impl BroadcastPhase {
    /// Returns a simple string representation of the phase.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Broadcasting {
                source: SourceKind::Obs,
                ..
            } => "Broadcasting(obs)",
            Self::Broadcasting {
                source: SourceKind::Fallback,
                manual: false,
            } => "Broadcasting(fallback)",
            Self::Broadcasting {
                source: SourceKind::Fallback,
                manual: true,
            } => "Broadcasting(fallback, manual)",
        }
    }
}

/// Reason a broadcast stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Operator requested stop.
    UserRequested,

    /// Stopped to apply a setting that cannot change in place.
    SettingChanged,

    /// Stopped as part of an operator-requested reconnect.
    Reconnect,

    /// Engine shutdown.
    Shutdown,
}

impl StopReason {
    /// Returns a display message for this reason.
    pub fn message(&self) -> &'static str {
        match self {
            Self::UserRequested => "Broadcast stopped by operator",
            Self::SettingChanged => "Broadcast restarting to apply settings",
            Self::Reconnect => "Broadcast reconnecting",
            Self::Shutdown => "Engine shutting down",
        }
    }
}
