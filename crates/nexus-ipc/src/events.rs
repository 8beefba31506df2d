//! Events sent from the engine to observers.

use serde::{Deserialize, Serialize};

use crate::state::{BroadcastState, StopReason};
use crate::types::{RelayMetrics, WarningType};

/// Events that the engine publishes to every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineEvent {
    /// Engine loop is running.
    Ready,

    /// A broadcast started.
    Started,

    /// A broadcast stopped.
    Stopped(StopReason),

    /// Broadcast state has changed.
    StateChanged {
        /// Previous state.
        previous: BroadcastState,

        /// Current state.
        current: BroadcastState,
    },

    /// Reply to a state request.
    Snapshot(BroadcastState),

    /// The authenticated primary feed connected or disconnected.
    PrimaryFeed { connected: bool },

    /// A degraded condition operators should see.
    Warning(WarningType),

    /// Relay counters.
    Metrics(RelayMetrics),

    /// Engine has shut down.
    Shutdown,
}
