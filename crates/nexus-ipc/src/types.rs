//! Common types used across relay messages.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::IpcError;

/// An external streaming destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Identifier assigned by the target store.
    pub id: i64,

    /// Display name.
    pub name: String,

    /// Base ingest endpoint (e.g., "rtmp://live.twitch.tv/app").
    pub url: String,

    /// Stream key appended to `url`.
    pub stream_key: String,

    /// Disabled targets are excluded from fan-out entirely.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Target {
    /// Full publish address: `url + '/' + stream_key`.
    pub fn publish_url(&self) -> String {
        let base = self.url.trim();
        if base.ends_with('/') {
            format!("{}{}", base, self.stream_key)
        } else {
            format!("{}/{}", base, self.stream_key)
        }
    }
}

/// Returns only the enabled targets, preserving order.
pub fn enabled_targets(targets: &[Target]) -> Vec<Target> {
    targets.iter().filter(|t| t.enabled).cloned().collect()
}

/// Output profile for the fallback/encoding path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    /// Frame width in pixels.
    pub width: u32,

    /// Frame height in pixels.
    pub height: u32,

    /// Frames per second.
    pub fps: u32,

    /// Video bitrate in kbps.
    pub bitrate_kbps: u32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 60,
            bitrate_kbps: 6000,
        }
    }
}

impl StreamSettings {
    /// Resolution as "WIDTHxHEIGHT".
    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.width,
            height: self.height,
        }
    }
}

/// A "WxH" frame size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || IpcError::InvalidResolution(s.to_string());
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width: u32 = w.trim().parse().map_err(|_| invalid())?;
        let height: u32 = h.trim().parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

/// Format characteristics of a probed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub sample_rate: u32,
    pub channels: u32,
}

/// Which upstream signal is live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// The primary feed pushed by the operator's encoder.
    Obs,

    /// The looping local media file.
    #[default]
    Fallback,
}

impl SourceKind {
    /// Returns a short lowercase label.
    pub fn name(self) -> &'static str {
        match self {
            Self::Obs => "obs",
            Self::Fallback => "fallback",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Relay counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMetrics {
    /// Chunks accepted by the delay buffer.
    pub chunks_in: u64,

    /// Chunks emitted by the delay buffer.
    pub chunks_out: u64,

    /// Bytes emitted by the delay buffer.
    pub bytes_out: u64,

    /// Completed source handoffs.
    pub source_handoffs: u64,

    /// Source spawn failures.
    pub source_failures: u64,

    /// Automatic master restarts.
    pub master_restarts: u64,

    /// Seconds since the broadcast started.
    pub uptime_seconds: u64,
}

/// Operator-facing warnings about degraded states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum WarningType {
    /// Primary feed lost with auto-fallback disabled; downstream is frozen.
    SourceFrozen,

    /// A producer process could not be spawned.
    SourceSpawnFailed { message: String },

    /// A producer exited while it was still the live source.
    SourceExited { source: SourceKind },

    /// The distributor exited unexpectedly and will be restarted.
    MasterRestarting { attempt: u32, delay_ms: u64 },

    /// The distributor could not be spawned.
    MasterSpawnFailed { message: String },
}
