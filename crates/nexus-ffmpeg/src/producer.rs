//! Source producer command lines.
//!
//! Every producer writes FLV to stdout so that the relay can switch between
//! them without the distributor noticing.

use std::path::PathBuf;

use nexus_ipc::StreamSettings;

use crate::{gop_size, AudioProfile, X264Preset};

/// What a producer reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerInput {
    /// Relay the live primary feed from the local ingest server without re-encoding.
    Obs { url: String },

    /// Loop a local video file forever, normalized to the stream settings.
    Fallback { path: PathBuf },

    /// Black frame and silent audio, used when no fallback file is available.
    Slate,
}

/// Producer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerConfig {
    pub input: ProducerInput,

    /// Output geometry and video bitrate for encoded producers.
    pub settings: StreamSettings,

    /// Audio layout for encoded producers.
    pub audio: AudioProfile,

    pub preset: X264Preset,
}

impl ProducerConfig {
    pub fn new(input: ProducerInput, settings: StreamSettings, audio: AudioProfile) -> Self {
        Self {
            input,
            settings,
            audio,
            preset: X264Preset::default(),
        }
    }
}

/// Build the ffmpeg argument list for a producer.
pub fn producer_args(config: &ProducerConfig) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "warning".into()];

    match &config.input {
        ProducerInput::Obs { url } => {
            args.extend(
                [
                    "-probesize",
                    "100000000",
                    "-analyzeduration",
                    "100000000",
                    "-fflags",
                    "nobuffer+genpts+igndts",
                    "-flags",
                    "low_delay",
                    "-i",
                ]
                .map(String::from),
            );
            args.push(url.clone());
            args.extend(["-map", "0:v:0", "-map", "0:a?", "-c", "copy"].map(String::from));
        }
        ProducerInput::Fallback { path } => {
            args.extend(["-stream_loop", "-1", "-re", "-i"].map(String::from));
            args.push(path.to_string_lossy().into_owned());
            args.push("-vf".into());
            args.push(scale_filter(&config.settings));
            args.extend(["-map", "0:v:0", "-map", "0:a:0?"].map(String::from));
            push_encoding(&mut args, config);
        }
        ProducerInput::Slate => {
            let s = &config.settings;
            args.extend(["-re", "-f", "lavfi", "-i"].map(String::from));
            args.push(format!(
                "color=c=black:s={}x{}:r={}",
                s.width, s.height, s.fps
            ));
            args.extend(["-f", "lavfi", "-i"].map(String::from));
            args.push(format!(
                "anullsrc=channel_layout={}:sample_rate={}",
                channel_layout(config.audio.channels),
                config.audio.sample_rate
            ));
            args.extend(["-map", "0:v:0", "-map", "1:a:0"].map(String::from));
            push_encoding(&mut args, config);
        }
    }

    args.extend(["-f", "flv", "-flvflags", "no_duration_filesize", "pipe:1"].map(String::from));
    args
}

/// Scale into the target box, pad to exact size, then force the frame rate.
fn scale_filter(s: &StreamSettings) -> String {
    format!(
        "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,fps={fps}",
        w = s.width,
        h = s.height,
        fps = s.fps
    )
}

fn push_encoding(args: &mut Vec<String>, config: &ProducerConfig) {
    let s = &config.settings;
    let gop = gop_size(s.fps);
    args.extend(
        [
            "-c:v".to_string(),
            "libx264".into(),
            "-preset".into(),
            config.preset.as_str().into(),
            "-tune".into(),
            "zerolatency".into(),
            "-b:v".into(),
            format!("{}k", s.bitrate_kbps),
            "-maxrate".into(),
            format!("{}k", s.bitrate_kbps),
            "-bufsize".into(),
            format!("{}k", (s.bitrate_kbps / 4).max(1)),
            "-g".into(),
            gop.to_string(),
            "-keyint_min".into(),
            gop.to_string(),
            "-sc_threshold".into(),
            "0".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            format!("{}k", config.audio.bitrate_kbps),
            "-ar".into(),
            config.audio.sample_rate.to_string(),
            "-ac".into(),
            config.audio.channels.to_string(),
        ],
    );
}

fn channel_layout(channels: u32) -> &'static str {
    if channels == 1 {
        "mono"
    } else {
        "stereo"
    }
}
