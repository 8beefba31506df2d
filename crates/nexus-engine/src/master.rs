//! Master distributor supervision.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use nexus_ffmpeg::{master_args, AudioProfile, MasterConfig, OutputMode, X264Preset};
use nexus_ipc::{EngineEvent, StreamSettings, Target, WarningType};
use nexus_process::{
    BoxedWriter, ExitSender, ManagedProcess, ProcessExit, ProcessId, ProcessLauncher,
    ProcessSpec, Redactor, RestartPolicy, SupervisorState,
};

use crate::config::MasterOutput;
use crate::flv::{FlvUnit, InitCache};
use crate::metrics::MetricsCollector;
use crate::timer::DeferredSlot;
use crate::{emit, Internal};

/// Label of the distributor process.
pub const MASTER_LABEL: &str = "master";

/// Returned by [`MasterController::stop`], once per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterStopped {
    /// Whether a process was running when stop was called.
    pub was_running: bool,

    /// Whether a pending restart was cancelled.
    pub cancelled_restart: bool,
}

/// Writes buffer output into whichever master stdin is current.
struct Feed {
    swap: mpsc::UnboundedSender<Option<BoxedWriter>>,
    task: JoinHandle<()>,
}

impl Feed {
    fn spawn(input: mpsc::Receiver<FlvUnit>) -> Self {
        let (swap, swaps) = mpsc::unbounded_channel();
        let task = tokio::spawn(feed(input, swaps));
        Self { swap, task }
    }

    fn set_writer(&self, writer: Option<BoxedWriter>) {
        if self.swap.send(writer).is_err() {
            debug!("Master feed already finished");
        }
    }
}

impl Drop for Feed {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// One master stdin. A fresh stdin gets the cached header, metadata and
/// sequence headers at the first join point, and nothing before it.
struct FeedWriter {
    inner: BoxedWriter,
    joined: bool,
}

impl FeedWriter {
    fn new(inner: BoxedWriter) -> Self {
        Self {
            inner,
            joined: false,
        }
    }

    async fn write(&mut self, unit: &FlvUnit, init: &InitCache) -> io::Result<()> {
        let FlvUnit::Tag(tag) = unit else {
            return Ok(());
        };
        if !self.joined {
            let Some(header) = init.header() else {
                return Ok(());
            };
            if !init.is_join_point(tag) {
                return Ok(());
            }
            self.inner.write_all(header).await?;
            for init_tag in init.tags() {
                self.inner.write_all(init_tag.as_bytes()).await?;
            }
            self.joined = true;
        }
        self.inner.write_all(tag.as_bytes()).await
    }
}

async fn feed(
    mut input: mpsc::Receiver<FlvUnit>,
    mut swaps: mpsc::UnboundedReceiver<Option<BoxedWriter>>,
) {
    let mut init = InitCache::default();
    let mut writer: Option<FeedWriter> = None;
    loop {
        tokio::select! {
            biased;
            swap = swaps.recv() => match swap {
                Some(next) => writer = next.map(FeedWriter::new),
                None => break,
            },
            unit = input.recv() => match unit {
                Some(unit) => {
                    init.observe(&unit);
                    // Units arriving while no master is running are dropped.
                    if let Some(w) = writer.as_mut() {
                        if let Err(e) = w.write(&unit, &init).await {
                            debug!("Master stdin write failed: {}", e);
                            writer = None;
                        }
                    }
                }
                None => break,
            },
        }
    }
}

/// Runs the single distributor process and restarts it after crashes.
pub struct MasterController {
    launcher: Arc<dyn ProcessLauncher>,
    ffmpeg: PathBuf,
    preview_url: String,
    output: MasterOutput,
    policy: RestartPolicy,
    exits: ExitSender,
    internal: mpsc::UnboundedSender<Internal>,
    events: broadcast::Sender<EngineEvent>,
    metrics: Arc<MetricsCollector>,
    process: Option<ManagedProcess>,
    state: SupervisorState,
    restart: DeferredSlot,
    targets: Vec<Target>,
    settings: StreamSettings,
    redactor: Redactor,
    active: bool,
    feed: Option<Feed>,
}

impl MasterController {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        launcher: Arc<dyn ProcessLauncher>,
        ffmpeg: PathBuf,
        preview_url: String,
        output: MasterOutput,
        policy: RestartPolicy,
        exits: ExitSender,
        internal: mpsc::UnboundedSender<Internal>,
        events: broadcast::Sender<EngineEvent>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            launcher,
            ffmpeg,
            preview_url,
            output,
            policy,
            exits,
            internal,
            events,
            metrics,
            process: None,
            state: SupervisorState::Idle,
            restart: DeferredSlot::new("master_restart"),
            targets: Vec::new(),
            settings: StreamSettings::default(),
            redactor: Redactor::default(),
            active: false,
            feed: None,
        }
    }

    /// Feed the master's stdin from `input` for the rest of the broadcast.
    pub fn attach(&mut self, input: mpsc::Receiver<FlvUnit>) {
        let feed = Feed::spawn(input);
        if let Some(stdin) = self.process.as_mut().and_then(ManagedProcess::take_stdin) {
            feed.set_writer(Some(stdin));
        }
        self.feed = Some(feed);
    }

    pub fn detach(&mut self) {
        self.feed = None;
    }

    /// Start distributing to the preview and `targets`. Restarts if running.
    #[instrument(name = "master_start", skip_all, fields(targets = targets.len()))]
    pub fn start(&mut self, targets: Vec<Target>, settings: StreamSettings, redactor: Redactor) {
        self.restart.cancel();
        self.kill_process();
        self.targets = targets;
        self.settings = settings;
        self.redactor = redactor;
        self.active = true;
        self.spawn(0);
    }

    /// Stop distributing and cancel any pending restart.
    ///
    /// Emits nothing. The caller owns the stopped notification and decides
    /// from the returned [`MasterStopped`] whether one is due.
    pub fn stop(&mut self) -> MasterStopped {
        let cancelled_restart = self.restart.is_pending();
        self.restart.cancel();
        self.active = false;
        let was_running = self.kill_process();
        self.state = SupervisorState::Idle;
        info!(was_running, cancelled_restart, "Master stopped");
        MasterStopped {
            was_running,
            cancelled_restart,
        }
    }

    /// Handle an exit notification. Returns false if it was not ours.
    pub fn handle_exit(&mut self, exit: &ProcessExit) -> bool {
        match &self.process {
            Some(process) if process.id() == exit.id => {}
            _ => return false,
        }
        self.process = None;
        if let Some(feed) = &self.feed {
            feed.set_writer(None);
        }

        if exit.killed || !self.active {
            self.state = SupervisorState::Idle;
            return true;
        }

        warn!("Master {}", exit.describe());
        self.schedule_restart(1);
        true
    }

    /// Handle the restart timer firing.
    pub fn handle_restart_due(&mut self, generation: u64) {
        if !self.restart.fire(generation) || !self.active {
            return;
        }
        let attempt = match self.state {
            SupervisorState::RestartPending { attempt } => attempt,
            _ => 1,
        };
        info!(attempt, "Restarting master");
        self.metrics.record_master_restart();
        self.spawn(attempt);
    }

    fn schedule_restart(&mut self, attempt: u32) {
        if !self.policy.should_retry(attempt) {
            error!(attempt, "Master restart attempts exhausted");
            self.state = SupervisorState::Idle;
            return;
        }
        let delay = self.policy.delay_for_attempt(attempt);
        self.state = SupervisorState::RestartPending { attempt };
        self.restart
            .schedule(delay, &self.internal, Internal::MasterRestartDue);
        emit(
            &self.events,
            EngineEvent::Warning(WarningType::MasterRestarting {
                attempt,
                delay_ms: delay.as_millis() as u64,
            }),
        );
    }

    fn spawn(&mut self, attempt: u32) {
        let config = MasterConfig {
            preview_url: self.preview_url.clone(),
            targets: self.targets.clone(),
            mode: match self.output {
                MasterOutput::Copy => OutputMode::Copy,
                MasterOutput::Encode => OutputMode::Encode {
                    settings: self.settings,
                    audio: AudioProfile::default(),
                    preset: X264Preset::Veryfast,
                },
            },
        };
        let spec = ProcessSpec::new(MASTER_LABEL, &self.ffmpeg, master_args(&config))
            .with_stdin()
            .with_redactor(self.redactor.clone());

        match self.launcher.launch(spec, self.exits.clone()) {
            Ok(mut process) => {
                let stdin = process.take_stdin();
                if let Some(feed) = &self.feed {
                    feed.set_writer(stdin);
                }
                self.state = SupervisorState::Running { pid: process.pid() };
                info!(id = %process.id(), "Master {}", self.state.message());
                self.process = Some(process);
            }
            Err(e) => {
                error!("Master failed to start: {}", e);
                emit(
                    &self.events,
                    EngineEvent::Warning(WarningType::MasterSpawnFailed {
                        message: e.to_string(),
                    }),
                );
                self.schedule_restart(attempt + 1);
            }
        }
    }

    fn kill_process(&mut self) -> bool {
        if let Some(feed) = &self.feed {
            feed.set_writer(None);
        }
        match self.process.take() {
            Some(mut process) => {
                process.stop();
                true
            }
            None => false,
        }
    }

    /// Enabled targets the master was last started with.
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn settings(&self) -> StreamSettings {
        self.settings
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn state(&self) -> &SupervisorState {
        &self.state
    }

    pub fn process_id(&self) -> Option<ProcessId> {
        self.process.as_ref().map(ManagedProcess::id)
    }
}
