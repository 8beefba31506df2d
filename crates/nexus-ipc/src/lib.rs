//! Typed collaborator<->engine messages for the restream relay.
//!
//! This crate defines the command, event and state types exchanged between the
//! orchestration engine and its collaborators (ingest listener, API layer).

mod commands;
mod error;
mod events;
mod state;
mod types;

pub use commands::EngineCommand;
pub use error::IpcError;
pub use events::EngineEvent;
pub use state::{BroadcastPhase, BroadcastState, StopReason};
pub use types::{
    enabled_targets, ProbeResult, RelayMetrics, Resolution, SourceKind, StreamSettings, Target,
    WarningType,
};

use tokio::sync::{broadcast, mpsc};

/// Channel capacity for commands (collaborators → engine).
pub const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Channel capacity for events (engine → observers).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates a bounded command channel.
pub fn command_channel() -> (mpsc::Sender<EngineCommand>, mpsc::Receiver<EngineCommand>) {
    mpsc::channel(COMMAND_CHANNEL_CAPACITY)
}

/// Creates an event channel. Every subscriber receives every event sent after it subscribed.
pub fn event_channel() -> (
    broadcast::Sender<EngineEvent>,
    broadcast::Receiver<EngineEvent>,
) {
    broadcast::channel(EVENT_CHANNEL_CAPACITY)
}
