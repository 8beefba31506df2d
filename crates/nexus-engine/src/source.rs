//! Source producer supervision and seamless handoff.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};

use nexus_ffmpeg::{producer_args, AudioProfile, ProducerConfig, ProducerInput};
use nexus_ipc::{SourceKind, StreamSettings};
use nexus_process::{
    BoxedReader, ExitSender, ManagedProcess, ProcessError, ProcessExit, ProcessId,
    ProcessLauncher, ProcessResult, ProcessSpec, Redactor,
};

use crate::buffer::BufferInput;
use crate::flv::{FlvDemuxer, FlvUnit, InitCache, Tag};
use crate::metrics::MetricsCollector;
use crate::timer::DeferredSlot;
use crate::Internal;

/// Read size for producer stdout.
const PUMP_CHUNK_SIZE: usize = 64 * 1024;

/// What the controller should produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourcePlan {
    /// Relay the primary feed.
    Obs { url: String },

    /// Loop a file; `None` (or a missing file) produces the slate instead.
    Fallback { video: Option<PathBuf> },
}

impl SourcePlan {
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Obs { .. } => SourceKind::Obs,
            Self::Fallback { .. } => SourceKind::Fallback,
        }
    }

    fn into_input(self) -> ProducerInput {
        match self {
            Self::Obs { url } => ProducerInput::Obs { url },
            Self::Fallback { video: Some(path) } if path.is_file() => {
                ProducerInput::Fallback { path }
            }
            Self::Fallback { video } => {
                if let Some(path) = video {
                    info!("Fallback video {} missing, using slate", path.display());
                }
                ProducerInput::Slate
            }
        }
    }
}

fn label_for(input: &ProducerInput) -> &'static str {
    match input {
        ProducerInput::Obs { .. } => "source:obs",
        ProducerInput::Fallback { .. } => "source:fallback",
        ProducerInput::Slate => "source:slate",
    }
}

/// Which producer's output reaches the buffer.
///
/// `current` is the newest producer; `active` is the one whose tags are
/// forwarded. The current producer takes over at its first join point
/// (normally a keyframe). Its metadata and sequence headers go out first,
/// its file header only if none has, and its timestamps are shifted to
/// continue from the last forwarded tag.
#[derive(Debug, Default)]
struct Routing {
    state: Mutex<RouteState>,
}

#[derive(Debug, Default)]
struct RouteState {
    current: u64,
    active: u64,
    header_sent: bool,
    last_timestamp: Option<u32>,
    offset: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    Forward,
    TookOver { from: u64 },
    Drop,
}

impl Routing {
    /// Route one unit from producer `id`. `init` already includes `unit`.
    fn route(
        &self,
        id: u64,
        unit: FlvUnit,
        init: &InitCache,
        output: Option<&BufferInput>,
    ) -> Claim {
        let mut state = self.state.lock();
        let FlvUnit::Tag(tag) = unit else {
            // Headers go out with the takeover, never mid-stream.
            return Claim::Drop;
        };

        if state.active == id {
            state.forward(tag, output);
            return Claim::Forward;
        }
        if state.current != id || !init.is_join_point(&tag) {
            return Claim::Drop;
        }

        let from = std::mem::replace(&mut state.active, id);
        state.offset = state.last_timestamp.map_or(0, |last| {
            i64::from(last) + 1 - i64::from(tag.timestamp())
        });
        if !state.header_sent {
            if let Some(header) = init.header() {
                send(output, FlvUnit::Header(header.clone()));
                state.header_sent = true;
            }
        }
        for init_tag in init.tags() {
            state.forward(init_tag.with_timestamp(tag.timestamp()), output);
        }
        state.forward(tag, output);
        Claim::TookOver { from }
    }

    fn set_current(&self, id: u64) {
        self.state.lock().current = id;
    }

    /// Forget `id` as the current producer if it still is.
    fn clear_current(&self, id: u64) {
        let mut state = self.state.lock();
        if state.current == id {
            state.current = 0;
        }
    }

    /// Nothing is on air; the stream position is kept.
    fn silence(&self) {
        let mut state = self.state.lock();
        state.current = 0;
        state.active = 0;
    }

    /// A new output stream begins.
    fn reset(&self) {
        *self.state.lock() = RouteState::default();
    }
}

impl RouteState {
    fn forward(&mut self, tag: Tag, output: Option<&BufferInput>) {
        let shifted = (i64::from(tag.timestamp()) + self.offset).clamp(0, i64::from(u32::MAX)) as u32;
        let tag = if shifted == tag.timestamp() {
            tag
        } else {
            tag.with_timestamp(shifted)
        };
        self.last_timestamp = Some(self.last_timestamp.map_or(shifted, |last| last.max(shifted)));
        send(output, FlvUnit::Tag(tag));
    }
}

fn send(output: Option<&BufferInput>, unit: FlvUnit) {
    if let Some(output) = output {
        if !output.push(unit) {
            trace!("Buffer destroyed, dropping unit");
        }
    }
}

struct Producer {
    kind: SourceKind,
    process: ManagedProcess,
    pump: JoinHandle<()>,
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.process.stop();
        self.pump.abort();
    }
}

/// Outcome of routing a process exit to the source controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceExit {
    /// Not one of ours.
    Unknown,

    /// A replaced or stopped producer finished.
    Retired,

    /// The live producer died on its own.
    Current(SourceKind),
}

/// Runs the producer subprocess and hands the buffer over between producers.
pub struct SourceController {
    launcher: Arc<dyn ProcessLauncher>,
    ffmpeg: PathBuf,
    grace: Duration,
    exits: ExitSender,
    internal: mpsc::UnboundedSender<Internal>,
    metrics: Arc<MetricsCollector>,
    output: Option<BufferInput>,
    current: Option<Producer>,
    retiring: Vec<Producer>,
    handoff: DeferredSlot,
    routing: Arc<Routing>,
}

impl SourceController {
    pub(crate) fn new(
        launcher: Arc<dyn ProcessLauncher>,
        ffmpeg: PathBuf,
        grace: Duration,
        exits: ExitSender,
        internal: mpsc::UnboundedSender<Internal>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            launcher,
            ffmpeg,
            grace,
            exits,
            internal,
            metrics,
            output: None,
            current: None,
            retiring: Vec::new(),
            handoff: DeferredSlot::new("handoff"),
            routing: Arc::new(Routing::default()),
        }
    }

    /// Route producer output into a buffer, starting a new output stream.
    pub fn attach(&mut self, output: BufferInput) {
        self.routing.reset();
        self.output = Some(output);
    }

    /// Stop routing output anywhere. Producers keep running until killed.
    pub fn detach(&mut self) {
        self.output = None;
    }

    /// Start a producer. A running producer is kept for the grace window and
    /// then killed, whether or not the new one starts.
    #[instrument(name = "source_start", skip_all, fields(kind = %plan.kind()))]
    pub fn start(
        &mut self,
        plan: SourcePlan,
        settings: StreamSettings,
        audio: AudioProfile,
        redactor: Redactor,
    ) -> ProcessResult<ProcessId> {
        if let Some(previous) = self.current.take() {
            // Anything older than the producer being replaced goes now.
            self.retiring.clear();
            debug!(
                id = %previous.process.id(),
                "Retiring producer after {:?}",
                self.grace
            );
            self.retiring.push(previous);
            self.handoff
                .schedule(self.grace, &self.internal, Internal::HandoffElapsed);
        }

        let kind = plan.kind();
        let input = plan.into_input();
        let label = label_for(&input);
        let args = producer_args(&ProducerConfig::new(input, settings, audio));
        let spec = ProcessSpec::new(label, &self.ffmpeg, args)
            .with_stdout()
            .with_redactor(redactor);

        let result = self
            .launcher
            .launch(spec, self.exits.clone())
            .and_then(|mut process| match process.take_stdout() {
                Some(stdout) => Ok((process, stdout)),
                None => Err(ProcessError::MissingPipe {
                    label: label.to_string(),
                    pipe: "stdout",
                }),
            });

        match result {
            Ok((process, stdout)) => {
                let id = process.id();
                self.routing.set_current(id.get());
                let pump = tokio::spawn(pump(
                    id,
                    stdout,
                    Arc::clone(&self.routing),
                    self.output.clone(),
                    Arc::clone(&self.metrics),
                ));
                info!(id = %id, "Producer started");
                self.current = Some(Producer {
                    kind,
                    process,
                    pump,
                });
                Ok(id)
            }
            Err(e) => {
                self.routing.set_current(0);
                self.metrics.record_source_failure();
                error!("Producer failed to start: {}", e);
                Err(e)
            }
        }
    }

    /// Kill the current and any retiring producer immediately.
    pub fn kill(&mut self) {
        self.handoff.cancel();
        self.routing.silence();
        if let Some(producer) = self.current.take() {
            info!(id = %producer.process.id(), "Killing producer");
        }
        self.retiring.clear();
    }

    /// Handle the handoff timer firing.
    pub fn handle_handoff_elapsed(&mut self, generation: u64) {
        if !self.handoff.fire(generation) {
            return;
        }
        for producer in self.retiring.drain(..) {
            debug!(id = %producer.process.id(), "Handoff grace elapsed, killing old producer");
        }
    }

    /// Route an exit notification. Killed processes count as retired.
    pub fn handle_exit(&mut self, exit: &ProcessExit) -> SourceExit {
        if let Some(pos) = self
            .retiring
            .iter()
            .position(|p| p.process.id() == exit.id)
        {
            self.retiring.remove(pos);
            return SourceExit::Retired;
        }

        match &self.current {
            Some(producer) if producer.process.id() == exit.id => {
                let kind = producer.kind;
                self.current = None;
                self.routing.clear_current(exit.id.get());
                if exit.killed {
                    SourceExit::Retired
                } else {
                    SourceExit::Current(kind)
                }
            }
            _ => SourceExit::Unknown,
        }
    }

    pub fn has_producer(&self) -> bool {
        self.current.is_some()
    }

    pub fn current_kind(&self) -> Option<SourceKind> {
        self.current.as_ref().map(|p| p.kind)
    }

    pub fn current_id(&self) -> Option<ProcessId> {
        self.current.as_ref().map(|p| p.process.id())
    }

    /// Producers alive from our point of view: current plus retiring.
    pub fn producer_count(&self) -> usize {
        self.retiring.len() + usize::from(self.current.is_some())
    }

    pub fn is_handoff_pending(&self) -> bool {
        self.handoff.is_pending()
    }
}

/// Split producer stdout into FLV units and route them to the buffer.
async fn pump(
    id: ProcessId,
    mut stdout: BoxedReader,
    routing: Arc<Routing>,
    output: Option<BufferInput>,
    metrics: Arc<MetricsCollector>,
) {
    let mut buf = BytesMut::with_capacity(PUMP_CHUNK_SIZE);
    let mut demuxer = FlvDemuxer::new();
    let mut init = InitCache::default();
    loop {
        buf.clear();
        buf.reserve(PUMP_CHUNK_SIZE);
        match stdout.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => demuxer.extend(&buf),
            Err(e) => {
                debug!(id = %id, "Producer stdout closed: {}", e);
                break;
            }
        }

        loop {
            let unit = match demuxer.next_unit() {
                Ok(Some(unit)) => unit,
                Ok(None) => break,
                Err(e) => {
                    warn!(id = %id, "Dropping producer output: {}", e);
                    return;
                }
            };
            init.observe(&unit);
            match routing.route(id.get(), unit, &init, output.as_ref()) {
                Claim::TookOver { from: 0 } => debug!(id = %id, "Producer on air"),
                Claim::TookOver { from } => {
                    metrics.record_handoff();
                    info!(id = %id, "Producer took over from #{}", from);
                }
                Claim::Forward | Claim::Drop => {}
            }
        }
    }
    trace!(id = %id, "Pump finished");
}
