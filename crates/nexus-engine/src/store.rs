//! Settings and target store seam.
//!
//! The engine reads every value at the moment it needs it and never caches
//! it across operations.

use std::path::PathBuf;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::warn;

use nexus_ipc::{enabled_targets, Resolution, Target};

/// Default delay buffer duration in seconds.
pub const DEFAULT_BUFFER_DURATION_SECS: u32 = 5;

/// Persistent settings and targets, owned by an external collaborator.
pub trait SettingsStore: Send + Sync {
    /// Key the primary feed must publish with.
    fn stream_key(&self) -> String;

    fn active_video(&self) -> Option<PathBuf>;
    fn set_active_video(&self, path: PathBuf);

    fn buffer_duration_seconds(&self) -> u32;
    fn set_buffer_duration_seconds(&self, seconds: u32);

    fn auto_fallback_enabled(&self) -> bool;
    fn set_auto_fallback_enabled(&self, enabled: bool);

    /// Explicit output resolution, if configured.
    fn fallback_resolution(&self) -> Option<Resolution>;

    /// Explicit output frame rate, if configured.
    fn fallback_fps(&self) -> Option<u32>;

    /// Explicit output bitrate in kbps, if configured.
    fn fallback_bitrate_kbps(&self) -> Option<u32>;

    /// Every configured target, enabled or not.
    fn targets(&self) -> Vec<Target>;
    fn set_targets(&self, targets: Vec<Target>);

    /// The enabled subset of [`SettingsStore::targets`], in order.
    fn enabled_targets(&self) -> Vec<Target> {
        enabled_targets(&self.targets())
    }
}

/// Initial contents for a [`MemoryStore`], usually loaded from JSON.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSeed {
    pub stream_key: String,
    pub active_video: Option<PathBuf>,
    pub buffer_duration_seconds: Option<u32>,
    pub auto_fallback_enabled: Option<bool>,
    pub fallback_resolution: Option<String>,
    pub fallback_fps: Option<u32>,
    pub fallback_bitrate: Option<u32>,
    pub targets: Vec<Target>,
}

#[derive(Debug)]
struct StoreValues {
    stream_key: String,
    active_video: Option<PathBuf>,
    buffer_duration_seconds: u32,
    auto_fallback_enabled: bool,
    fallback_resolution: Option<String>,
    fallback_fps: Option<u32>,
    fallback_bitrate: Option<u32>,
    targets: Vec<Target>,
}

/// In-process settings store.
#[derive(Debug)]
pub struct MemoryStore {
    values: RwLock<StoreValues>,
}

impl MemoryStore {
    /// Create a store with defaults and the given stream key.
    pub fn new(stream_key: impl Into<String>) -> Self {
        Self::from_seed(StoreSeed {
            stream_key: stream_key.into(),
            ..Default::default()
        })
    }

    pub fn from_seed(seed: StoreSeed) -> Self {
        Self {
            values: RwLock::new(StoreValues {
                stream_key: seed.stream_key,
                active_video: seed.active_video,
                buffer_duration_seconds: seed
                    .buffer_duration_seconds
                    .unwrap_or(DEFAULT_BUFFER_DURATION_SECS),
                auto_fallback_enabled: seed.auto_fallback_enabled.unwrap_or(true),
                fallback_resolution: seed.fallback_resolution,
                fallback_fps: seed.fallback_fps,
                fallback_bitrate: seed.fallback_bitrate,
                targets: seed.targets,
            }),
        }
    }

    pub fn set_stream_key(&self, key: impl Into<String>) {
        self.values.write().stream_key = key.into();
    }

    pub fn set_fallback_resolution(&self, resolution: Option<String>) {
        self.values.write().fallback_resolution = resolution;
    }

    pub fn set_fallback_fps(&self, fps: Option<u32>) {
        self.values.write().fallback_fps = fps;
    }

    pub fn set_fallback_bitrate(&self, kbps: Option<u32>) {
        self.values.write().fallback_bitrate = kbps;
    }
}

impl SettingsStore for MemoryStore {
    fn stream_key(&self) -> String {
        self.values.read().stream_key.clone()
    }

    fn active_video(&self) -> Option<PathBuf> {
        self.values.read().active_video.clone()
    }

    fn set_active_video(&self, path: PathBuf) {
        self.values.write().active_video = Some(path);
    }

    fn buffer_duration_seconds(&self) -> u32 {
        self.values.read().buffer_duration_seconds
    }

    fn set_buffer_duration_seconds(&self, seconds: u32) {
        self.values.write().buffer_duration_seconds = seconds;
    }

    fn auto_fallback_enabled(&self) -> bool {
        self.values.read().auto_fallback_enabled
    }

    fn set_auto_fallback_enabled(&self, enabled: bool) {
        self.values.write().auto_fallback_enabled = enabled;
    }

    fn fallback_resolution(&self) -> Option<Resolution> {
        let values = self.values.read();
        let raw = values.fallback_resolution.as_deref()?;
        match raw.parse() {
            Ok(resolution) => Some(resolution),
            Err(e) => {
                warn!("Ignoring stored resolution: {}", e);
                None
            }
        }
    }

    fn fallback_fps(&self) -> Option<u32> {
        self.values.read().fallback_fps.filter(|&fps| fps > 0)
    }

    fn fallback_bitrate_kbps(&self) -> Option<u32> {
        self.values.read().fallback_bitrate.filter(|&kbps| kbps > 0)
    }

    fn targets(&self) -> Vec<Target> {
        self.values.read().targets.clone()
    }

    fn set_targets(&self, targets: Vec<Target>) {
        self.values.write().targets = targets;
    }
}
