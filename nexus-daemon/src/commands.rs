//! JSON-lines codec for the control surface.

use nexus_engine::SettingsStore;
use nexus_ipc::{EngineCommand, EngineEvent};

/// Parse one control line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> serde_json::Result<Option<EngineCommand>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line).map(Some)
}

/// Write settings carried by `command` to the store before the engine sees it.
///
/// The engine only reads targets from the store on (re)start, so a target
/// update has to be persisted here or a later reconnect would use stale ones.
pub fn persist(store: &dyn SettingsStore, command: &EngineCommand) {
    if let EngineCommand::UpdateTargets { targets } = command {
        store.set_targets(targets.clone());
    }
}

/// Encode an event as a single output line (without the newline).
pub fn encode_event(event: &EngineEvent) -> serde_json::Result<String> {
    serde_json::to_string(event)
}
