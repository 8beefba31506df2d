//! Commands sent from collaborators (API, ingest listener) to the engine.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::Target;

/// Commands that collaborators can send to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum EngineCommand {
    /// Start broadcasting. `targets: None` reads the enabled targets from the store.
    StartBroadcast {
        #[serde(default)]
        targets: Option<Vec<Target>>,
        #[serde(default)]
        primary_connected: Option<bool>,
    },

    /// Stop the current broadcast.
    StopBroadcast,

    /// Stop now and start again after a short pause.
    ReconnectBroadcast,

    /// Ingest listener saw a publish on `path`.
    Publish { path: String },

    /// Ingest listener saw an unpublish on `path`.
    Unpublish { path: String },

    /// The target list changed.
    UpdateTargets { targets: Vec<Target> },

    /// Select a new fallback media file.
    SetActiveVideo { path: PathBuf },

    /// Change the delay buffer length.
    SetBufferDuration { seconds: u32 },

    /// Enable or disable automatic fallback on primary-feed loss.
    SetAutoFallback { enabled: bool },

    /// Force fallback for a failover test.
    StartManualFallback,

    /// End a forced-fallback test.
    StopManualFallback,

    /// Request the current state snapshot.
    GetState,

    /// Request a metrics snapshot.
    GetMetrics,

    /// Stop everything and exit the engine loop.
    Shutdown,
}

impl EngineCommand {
    /// Command name for logs. Never includes payloads, which may carry stream keys.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartBroadcast { .. } => "StartBroadcast",
            Self::StopBroadcast => "StopBroadcast",
            Self::ReconnectBroadcast => "ReconnectBroadcast",
            Self::Publish { .. } => "Publish",
            Self::Unpublish { .. } => "Unpublish",
            Self::UpdateTargets { .. } => "UpdateTargets",
            Self::SetActiveVideo { .. } => "SetActiveVideo",
            Self::SetBufferDuration { .. } => "SetBufferDuration",
            Self::SetAutoFallback { .. } => "SetAutoFallback",
            Self::StartManualFallback => "StartManualFallback",
            Self::StopManualFallback => "StopManualFallback",
            Self::GetState => "GetState",
            Self::GetMetrics => "GetMetrics",
            Self::Shutdown => "Shutdown",
        }
    }
}
