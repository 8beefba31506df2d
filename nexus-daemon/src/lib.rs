//! Restream relay daemon.
//!
//! Drives the engine from a JSON-lines control surface: one `EngineCommand`
//! per stdin line in, one `EngineEvent` per stdout line out. Logs go to stderr.

mod commands;

pub use commands::{encode_event, parse_line, persist};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nexus_engine::{
    create_engine, EngineConfig, MasterOutput, MemoryStore, SettingsStore, SourceRecovery,
    StoreSeed,
};
use nexus_ffmpeg::FfmpegPaths;
use nexus_ipc::{command_channel, event_channel, EngineCommand, EngineEvent};

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "nexus-daemon", version, about = "24/7 restream relay")]
pub struct Args {
    /// Stream key the primary encoder publishes with (overrides the seed file)
    #[arg(long, env = "NEXUS_STREAM_KEY")]
    pub stream_key: Option<String>,

    /// Directory relative fallback video paths are resolved against
    #[arg(long, env = "NEXUS_VIDEOS_DIR", default_value = "videos")]
    pub videos_dir: PathBuf,

    /// ffmpeg binary (searched in PATH when unset)
    #[arg(long, env = "NEXUS_FFMPEG")]
    pub ffmpeg: Option<PathBuf>,

    /// ffprobe binary (searched in PATH when unset)
    #[arg(long, env = "NEXUS_FFPROBE")]
    pub ffprobe: Option<PathBuf>,

    /// Ingest application URL the primary feed publishes under
    #[arg(long, default_value = "rtmp://localhost:1935/live")]
    pub ingest_url: String,

    /// Local preview endpoint
    #[arg(long, default_value = "rtmp://localhost:1935/live/preview")]
    pub preview_url: String,

    /// JSON file with initial settings and targets
    #[arg(long)]
    pub seed: Option<PathBuf>,

    /// Re-encode in the distributor instead of copying the relayed stream
    #[arg(long, default_value_t = false)]
    pub encode: bool,

    /// Respawn a dead producer after this many seconds
    #[arg(long)]
    pub source_restart_secs: Option<u64>,

    /// Interval between metrics events while broadcasting
    #[arg(long, default_value_t = 5)]
    pub metrics_interval_secs: u64,
}

impl Args {
    /// Build the engine configuration, locating ffmpeg/ffprobe if needed.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            ffmpeg: FfmpegPaths::discover(self.ffmpeg.clone(), self.ffprobe.clone()),
            ingest_url: self.ingest_url.clone(),
            preview_url: self.preview_url.clone(),
            videos_dir: self.videos_dir.clone(),
            master_output: if self.encode {
                MasterOutput::Encode
            } else {
                MasterOutput::Copy
            },
            source_recovery: match self.source_restart_secs {
                Some(secs) => SourceRecovery::Restart {
                    delay: Duration::from_secs(secs),
                },
                None => SourceRecovery::Manual,
            },
            // A zero period would panic in the ticker.
            metrics_interval: Duration::from_secs(self.metrics_interval_secs.max(1)),
            ..Default::default()
        }
    }

    /// Load the settings store from the seed file and overrides.
    pub fn load_store(&self) -> anyhow::Result<MemoryStore> {
        let mut seed = match &self.seed {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading seed file {}", path.display()))?;
                serde_json::from_str::<StoreSeed>(&raw)
                    .with_context(|| format!("parsing seed file {}", path.display()))?
            }
            None => StoreSeed::default(),
        };
        if let Some(key) = &self.stream_key {
            seed.stream_key = key.clone();
        }
        Ok(MemoryStore::from_seed(seed))
    }
}

/// Initialize logging on stderr; stdout carries events.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "nexus_daemon=info,nexus_engine=debug,nexus_ffmpeg=info,nexus_process=info".into()
        }))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Run the daemon until shutdown or end of input.
pub async fn run(args: Args) -> anyhow::Result<()> {
    info!("Restream relay starting");

    let store = Arc::new(args.load_store()?);
    if store.stream_key().is_empty() {
        warn!("No stream key configured, publishes will be ignored");
    }
    let config = args.engine_config();
    debug!(?config, "Engine configuration");

    let (command_tx, command_rx) = command_channel();
    let (event_tx, event_rx) = event_channel();

    let engine = create_engine(config, store.clone(), command_rx, event_tx);
    let engine_task = tokio::spawn(engine.run());
    let writer_task = tokio::spawn(write_events(event_rx));

    read_commands(store, command_tx).await?;

    engine_task.await.context("engine task panicked")?;
    writer_task.await.context("event writer panicked")??;

    info!("Restream relay stopped");
    Ok(())
}

/// Forward stdin lines to the engine. Returns once input ends or a shutdown
/// has been sent; dropping `tx` on EOF shuts the engine down.
async fn read_commands(
    store: Arc<MemoryStore>,
    tx: mpsc::Sender<EngineCommand>,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("reading stdin")?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                let _ = tx.send(EngineCommand::Shutdown).await;
                return Ok(());
            }
        };
        let Some(line) = line else {
            info!("Control input closed");
            return Ok(());
        };

        let command = match parse_line(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                warn!("Ignoring malformed command: {}", e);
                continue;
            }
        };

        persist(store.as_ref(), &command);
        let shutdown = command == EngineCommand::Shutdown;
        if tx.send(command).await.is_err() {
            warn!("Engine is gone, dropping input");
            return Ok(());
        }
        if shutdown {
            return Ok(());
        }
    }
}

/// Write every event to stdout until the engine drops its senders.
async fn write_events(mut rx: broadcast::Receiver<EngineEvent>) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();

    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event output lagging, events dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let mut line = encode_event(&event)?;
        line.push('\n');
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;
    }

    Ok(())
}
