//! Master distributor command line.
//!
//! The master reads one FLV stream on stdin and fans it out to the preview
//! endpoint and every enabled target through the tee muxer. Each leg uses
//! `onfail=ignore` so a single failing destination does not take the
//! others down.

use nexus_ipc::{enabled_targets, StreamSettings, Target};

use crate::{gop_size, AudioProfile, X264Preset};

/// How the master treats the incoming stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Forward audio and video untouched.
    #[default]
    Copy,

    /// Re-encode to the given settings before distribution.
    Encode {
        settings: StreamSettings,
        audio: AudioProfile,
        preset: X264Preset,
    },
}

/// Master configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterConfig {
    /// Local preview endpoint, always the first tee leg.
    pub preview_url: String,

    /// Distribution targets. Disabled ones are skipped.
    pub targets: Vec<Target>,

    pub mode: OutputMode,
}

/// Escape characters that the tee muxer treats as syntax.
pub fn escape_tee_target(url: &str) -> String {
    let mut escaped = String::with_capacity(url.len());
    for c in url.chars() {
        if matches!(c, '\\' | '|' | '\'' | '[' | ']') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// The tee output specification: preview first, then enabled targets in order.
pub fn tee_outputs(config: &MasterConfig) -> String {
    const LEG_OPTIONS: &str = "[f=flv:flvflags=no_duration_filesize:onfail=ignore]";

    std::iter::once(config.preview_url.clone())
        .chain(
            enabled_targets(&config.targets)
                .iter()
                .map(Target::publish_url),
        )
        .map(|url| format!("{}{}", LEG_OPTIONS, escape_tee_target(&url)))
        .collect::<Vec<_>>()
        .join("|")
}

/// Build the ffmpeg argument list for the master.
pub fn master_args(config: &MasterConfig) -> Vec<String> {
    let mut args: Vec<String> = [
        "-hide_banner",
        "-loglevel",
        "warning",
        "-fflags",
        "nobuffer+genpts",
        "-flags",
        "low_delay",
        "-f",
        "flv",
        "-i",
        "pipe:0",
        "-map",
        "0:v:0",
        "-map",
        "0:a?",
    ]
    .map(String::from)
    .to_vec();

    match config.mode {
        OutputMode::Copy => {
            args.extend(["-c:v", "copy", "-c:a", "copy"].map(String::from));
        }
        OutputMode::Encode {
            settings,
            audio,
            preset,
        } => {
            let gop = gop_size(settings.fps);
            args.extend([
                "-c:v".to_string(),
                "libx264".into(),
                "-preset".into(),
                preset.as_str().into(),
                "-tune".into(),
                "zerolatency".into(),
                "-s".into(),
                settings.resolution().to_string(),
                "-r".into(),
                settings.fps.to_string(),
                "-b:v".into(),
                format!("{}k", settings.bitrate_kbps),
                "-maxrate".into(),
                format!("{}k", settings.bitrate_kbps),
                "-bufsize".into(),
                format!("{}k", settings.bitrate_kbps.saturating_mul(2)),
                "-g".into(),
                gop.to_string(),
                "-pix_fmt".into(),
                "yuv420p".into(),
                "-c:a".into(),
                "aac".into(),
                "-b:a".into(),
                format!("{}k", audio.bitrate_kbps),
                "-ar".into(),
                audio.sample_rate.to_string(),
                "-ac".into(),
                audio.channels.to_string(),
                // tee outputs need out-of-band codec headers when we encode.
                "-flags".into(),
                "+global_header".into(),
            ]);
        }
    }

    args.push("-f".into());
    args.push("tee".into());
    args.push(tee_outputs(config));
    args
}
