//! Core orchestrator for the restream relay.
//!
//! This crate decides which upstream signal is live, supervises the source
//! producer and the master distributor, and relays the stream between them
//! through a fixed-delay buffer.

mod buffer;
mod config;
mod error;
mod flv;
mod master;
mod metrics;
mod orchestrator;
mod source;
mod store;
#[cfg(test)]
mod testing;
mod timer;

pub use buffer::{BufferInput, DelayBuffer};
pub use config::{EngineConfig, MasterOutput, SourceRecovery};
pub use error::{EngineError, FlvError};
pub use flv::{FlvDemuxer, FlvUnit, InitCache, Tag, TagKind};
pub use master::{MasterController, MasterStopped, MASTER_LABEL};
pub use metrics::MetricsCollector;
pub use orchestrator::Engine;
pub use source::{SourceController, SourceExit, SourcePlan};
pub use store::{MemoryStore, SettingsStore, StoreSeed, DEFAULT_BUFFER_DURATION_SECS};

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use nexus_ffmpeg::FfprobeProber;
use nexus_ipc::{EngineCommand, EngineEvent, ProbeResult};
use nexus_process::SystemLauncher;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Capacity of the buffer-to-master unit channel.
pub const FEED_CHANNEL_CAPACITY: usize = 256;

/// Notifications the engine posts to itself from timers and background tasks.
#[derive(Debug)]
pub(crate) enum Internal {
    HandoffElapsed(u64),
    MasterRestartDue(u64),
    SourceSettled(u64),
    RestartDue(u64),
    SourceRecoveryDue(u64),
    ProbeFinished(Option<ProbeResult>),
}

/// Publish an event to every current subscriber.
pub(crate) fn emit(tx: &broadcast::Sender<EngineEvent>, event: EngineEvent) {
    if tx.send(event).is_err() {
        trace!("No event subscribers");
    }
}

/// Create an engine backed by real ffmpeg/ffprobe processes.
pub fn create_engine(
    config: EngineConfig,
    store: Arc<dyn SettingsStore>,
    command_rx: mpsc::Receiver<EngineCommand>,
    event_tx: broadcast::Sender<EngineEvent>,
) -> Engine {
    let prober = Arc::new(FfprobeProber::new(config.ffmpeg.ffprobe.clone()));
    Engine::new(
        config,
        store,
        Arc::new(SystemLauncher::new()),
        prober,
        command_rx,
        event_tx,
    )
}
