//! ffmpeg and ffprobe command lines.
//!
//! This crate builds the argument lists for the source producers (OBS
//! relay, looping fallback file, black slate) and for the master
//! distributor, and wraps ffprobe for one-shot stream analysis.

mod error;
mod master;
mod probe;
mod producer;

pub use error::FfmpegError;
pub use master::{escape_tee_target, master_args, tee_outputs, MasterConfig, OutputMode};
pub use probe::{parse_frame_rate, parse_probe_output, probe_stream, FfprobeProber, Prober, ProbeFuture};
pub use producer::{producer_args, ProducerConfig, ProducerInput};

use std::path::PathBuf;
use std::time::Duration;

use nexus_ipc::ProbeResult;
use tracing::{debug, warn};

/// Result type for ffmpeg operations.
pub type FfmpegResult<T> = Result<T, FfmpegError>;

/// How long a single ffprobe run may take.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Keyframe interval used whenever we encode.
pub const KEYFRAME_INTERVAL_SECS: u32 = 2;

/// GOP length in frames for `fps`, clamped to at least one frame.
pub fn gop_size(fps: u32) -> u32 {
    fps.saturating_mul(KEYFRAME_INTERVAL_SECS).max(1)
}

/// Locations of the ffmpeg and ffprobe executables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfmpegPaths {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Default for FfmpegPaths {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

impl FfmpegPaths {
    /// Resolve both binaries, preferring explicit overrides, then `PATH`.
    pub fn discover(ffmpeg: Option<PathBuf>, ffprobe: Option<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.unwrap_or_else(|| find_binary("ffmpeg")),
            ffprobe: ffprobe.unwrap_or_else(|| find_binary("ffprobe")),
        }
    }
}

fn find_binary(name: &str) -> PathBuf {
    match which::which(name) {
        Ok(path) => {
            debug!("Found {} at {}", name, path.display());
            path
        }
        Err(e) => {
            warn!("{} not found in PATH ({}), relying on bare name", name, e);
            PathBuf::from(name)
        }
    }
}

/// H.264 encoder preset for libx264.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum X264Preset {
    #[default]
    Ultrafast,
    Superfast,
    Veryfast,
}

impl X264Preset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ultrafast => "ultrafast",
            Self::Superfast => "superfast",
            Self::Veryfast => "veryfast",
        }
    }
}

/// Audio encoding configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioProfile {
    /// Sample rate in Hz.
    pub sample_rate: u32,

    /// Number of channels.
    pub channels: u32,

    /// Target bitrate in kbps.
    pub bitrate_kbps: u32,
}

impl Default for AudioProfile {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            bitrate_kbps: 128,
        }
    }
}

impl AudioProfile {
    /// Mirror the probed primary feed's audio, or fall back to defaults.
    pub fn from_probe(probe: Option<&ProbeResult>) -> Self {
        let mut profile = Self::default();
        if let Some(p) = probe {
            profile.sample_rate = p.sample_rate;
            profile.channels = p.channels;
        }
        profile
    }
}
