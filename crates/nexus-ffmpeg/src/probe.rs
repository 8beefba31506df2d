//! One-shot stream analysis via ffprobe.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use nexus_ipc::ProbeResult;

use crate::error::FfmpegError;
use crate::{FfmpegResult, DEFAULT_PROBE_TIMEOUT};

/// Future returned by [`Prober::probe`].
pub type ProbeFuture = Pin<Box<dyn Future<Output = Option<ProbeResult>> + Send>>;

/// Probes a stream URL for its format. `None` means "use defaults".
pub trait Prober: Send + Sync {
    fn probe(&self, url: &str) -> ProbeFuture;
}

/// Prober backed by the ffprobe binary.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    ffprobe: PathBuf,
    timeout: Duration,
}

impl FfprobeProber {
    pub fn new(ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe: ffprobe.into(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Prober for FfprobeProber {
    fn probe(&self, url: &str) -> ProbeFuture {
        let ffprobe = self.ffprobe.clone();
        let timeout = self.timeout;
        let url = url.to_string();
        Box::pin(async move {
            match probe_stream(&ffprobe, &url, timeout).await {
                Ok(result) => Some(result),
                Err(e) => {
                    debug!("Probe failed: {}", e);
                    None
                }
            }
        })
    }
}

/// Run ffprobe against `url` and parse its JSON output.
pub async fn probe_stream(
    ffprobe: &Path,
    url: &str,
    timeout: Duration,
) -> FfmpegResult<ProbeResult> {
    let child = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-show_entries",
            "stream=codec_type,width,height,r_frame_rate,sample_rate,channels",
            "-of",
            "json",
            url,
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| FfmpegError::Timeout(timeout))??;

    if !output.status.success() {
        return Err(FfmpegError::ExitStatus(output.status.code()));
    }

    parse_probe_output(&String::from_utf8_lossy(&output.stdout))
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u32>,
}

impl ProbeStream {
    fn is_video(&self) -> bool {
        match self.codec_type.as_deref() {
            Some(kind) => kind == "video",
            None => self.width.is_some(),
        }
    }

    fn is_audio(&self) -> bool {
        match self.codec_type.as_deref() {
            Some(kind) => kind == "audio",
            None => self.sample_rate.is_some(),
        }
    }
}

const DEFAULT_FPS: u32 = 30;
const DEFAULT_SAMPLE_RATE: u32 = 48_000;
const DEFAULT_CHANNELS: u32 = 2;

/// Parse ffprobe's JSON into a [`ProbeResult`].
pub fn parse_probe_output(json: &str) -> FfmpegResult<ProbeResult> {
    let output: ProbeOutput = serde_json::from_str(json)?;

    let video = output
        .streams
        .iter()
        .find(|s| s.is_video())
        .ok_or(FfmpegError::NoVideoStream)?;
    let (width, height) = match (video.width, video.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(FfmpegError::NoVideoStream),
    };
    let fps = video
        .r_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .unwrap_or(DEFAULT_FPS);

    let audio = output.streams.iter().find(|s| s.is_audio());
    let sample_rate = audio
        .and_then(|a| a.sample_rate.as_deref())
        .and_then(|r| r.trim().parse().ok())
        .unwrap_or(DEFAULT_SAMPLE_RATE);
    let channels = audio
        .and_then(|a| a.channels)
        .filter(|&c| c > 0)
        .unwrap_or(DEFAULT_CHANNELS);

    Ok(ProbeResult {
        width,
        height,
        fps,
        sample_rate,
        channels,
    })
}

/// Parse "num/den" (or a bare number) and round to the nearest integer fps.
pub fn parse_frame_rate(rate: &str) -> Option<u32> {
    let rate = rate.trim();
    let (num, den) = match rate.split_once('/') {
        Some((n, d)) => (n.trim().parse::<u64>().ok()?, d.trim().parse::<u64>().ok()?),
        None => (rate.parse::<u64>().ok()?, 1),
    };
    if den == 0 || num == 0 {
        return None;
    }
    let divisor = gcd(num, den);
    let (num, den) = (num / divisor, den / divisor);
    // Round half up in integer arithmetic.
    u32::try_from((2 * num + den) / (2 * den)).ok()
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}
