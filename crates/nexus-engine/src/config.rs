//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;
use url::Url;

use nexus_ffmpeg::FfmpegPaths;
use nexus_process::RestartPolicy;

const DEFAULT_INGEST_APP: &str = "/live";

/// What happens when the live producer dies or fails to spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceRecovery {
    /// Wait for the next connect, disconnect or operator action.
    #[default]
    Manual,

    /// Respawn the producer for the current source after `delay`.
    Restart { delay: Duration },
}

/// Whether the distributor forwards the stream as-is or re-encodes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MasterOutput {
    #[default]
    Copy,
    Encode,
}

/// Static engine configuration. Runtime settings live in the settings store.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ffmpeg: FfmpegPaths,

    /// Ingest application URL; the primary feed is `<ingest_url>/<stream key>`.
    pub ingest_url: String,

    /// Local preview endpoint, always the first distribution leg.
    pub preview_url: String,

    /// Base directory for relative fallback video paths.
    pub videos_dir: PathBuf,

    /// How long a replaced producer keeps running after a new one starts.
    pub handoff_grace: Duration,

    /// Delay between a primary-feed connect and the switch to it.
    pub connect_settle: Duration,

    /// Delay before restarting a broadcast after a setting change.
    pub setting_restart_delay: Duration,

    /// Delay before restarting a broadcast after an operator reconnect.
    pub reconnect_delay: Duration,

    /// Restart policy for the distributor.
    pub master_restart: RestartPolicy,

    pub master_output: MasterOutput,

    pub source_recovery: SourceRecovery,

    /// How often the daemon publishes relay metrics while broadcasting.
    pub metrics_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ffmpeg: FfmpegPaths::default(),
            ingest_url: "rtmp://localhost:1935/live".to_string(),
            preview_url: "rtmp://localhost:1935/live/preview".to_string(),
            videos_dir: PathBuf::from("videos"),
            handoff_grace: Duration::from_secs(1),
            connect_settle: Duration::from_secs(1),
            setting_restart_delay: Duration::from_secs(2),
            reconnect_delay: Duration::from_secs(5),
            master_restart: RestartPolicy::default(),
            master_output: MasterOutput::default(),
            source_recovery: SourceRecovery::default(),
            metrics_interval: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// URL of the primary feed for a stream key.
    pub fn primary_url(&self, stream_key: &str) -> String {
        format!("{}/{}", self.ingest_url.trim_end_matches('/'), stream_key)
    }

    /// Ingest path the primary feed publishes to, e.g. `/live/<key>`.
    pub fn publish_path(&self, stream_key: &str) -> String {
        let app = match Url::parse(&self.ingest_url) {
            Ok(url) => url.path().trim_end_matches('/').to_string(),
            Err(e) => {
                warn!("Invalid ingest URL {:?}: {}", self.ingest_url, e);
                DEFAULT_INGEST_APP.to_string()
            }
        };
        format!("{}/{}", app, stream_key)
    }

    /// Resolve a fallback video path against the videos directory.
    pub fn resolve_video(&self, path: &std::path::Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.videos_dir.join(path)
        }
    }
}
