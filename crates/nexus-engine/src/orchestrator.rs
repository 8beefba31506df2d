//! Main engine orchestrator.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, trace, warn};

use nexus_ffmpeg::{AudioProfile, Prober};
use nexus_ipc::{
    enabled_targets, BroadcastState, EngineCommand, EngineEvent, ProbeResult, RelayMetrics,
    SourceKind, StopReason, StreamSettings, Target, WarningType,
};
use nexus_process::{ProcessExit, ProcessLauncher, Redactor};

use crate::buffer::DelayBuffer;
use crate::config::{EngineConfig, SourceRecovery};
use crate::error::EngineError;
use crate::master::MasterController;
use crate::metrics::MetricsCollector;
use crate::source::{SourceController, SourceExit, SourcePlan};
use crate::store::SettingsStore;
use crate::timer::DeferredSlot;
use crate::{emit, EngineResult, Internal, FEED_CHANNEL_CAPACITY};

/// A broadcast restart waiting on a timer.
#[derive(Debug)]
struct RestartPlan {
    /// Targets to restart with; `None` re-reads the store.
    targets: Option<Vec<Target>>,
}

enum Message {
    Command(EngineCommand),
    Internal(Internal),
    Exit(ProcessExit),
    Closed,
}

/// The restream relay engine.
///
/// All orchestration state lives here and is only touched from the task
/// driving [`Engine::run`] (or [`Engine::step`] in tests). Subprocess exits
/// and timer firings arrive as messages on that same task.
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn SettingsStore>,
    prober: Arc<dyn Prober>,
    command_rx: mpsc::Receiver<EngineCommand>,
    event_tx: broadcast::Sender<EngineEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    exit_rx: mpsc::UnboundedReceiver<ProcessExit>,
    state: BroadcastState,
    primary_connected: bool,
    last_probe: Option<ProbeResult>,
    source: SourceController,
    master: MasterController,
    buffer: Option<DelayBuffer>,
    metrics: Arc<MetricsCollector>,
    settle: DeferredSlot,
    restart: DeferredSlot,
    recovery: DeferredSlot,
    pending_restart: Option<RestartPlan>,
    source_frozen: bool,
}

impl Engine {
    /// Create a new engine.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn SettingsStore>,
        launcher: Arc<dyn ProcessLauncher>,
        prober: Arc<dyn Prober>,
        command_rx: mpsc::Receiver<EngineCommand>,
        event_tx: broadcast::Sender<EngineEvent>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(MetricsCollector::new());

        let source = SourceController::new(
            Arc::clone(&launcher),
            config.ffmpeg.ffmpeg.clone(),
            config.handoff_grace,
            exit_tx.clone(),
            internal_tx.clone(),
            Arc::clone(&metrics),
        );
        let master = MasterController::new(
            launcher,
            config.ffmpeg.ffmpeg.clone(),
            config.preview_url.clone(),
            config.master_output,
            config.master_restart.clone(),
            exit_tx,
            internal_tx.clone(),
            event_tx.clone(),
            Arc::clone(&metrics),
        );

        Self {
            config,
            store,
            prober,
            command_rx,
            event_tx,
            internal_tx,
            internal_rx,
            exit_rx,
            state: BroadcastState::default(),
            primary_connected: false,
            last_probe: None,
            source,
            master,
            buffer: None,
            metrics,
            settle: DeferredSlot::new("connect_settle"),
            restart: DeferredSlot::new("broadcast_restart"),
            recovery: DeferredSlot::new("source_recovery"),
            pending_restart: None,
            source_frozen: false,
        }
    }

    /// Run the engine until shutdown or until every command sender is gone.
    #[instrument(name = "engine_run", skip(self))]
    pub async fn run(mut self) {
        info!("Engine starting");
        self.send_event(EngineEvent::Ready);

        let mut ticker = tokio::time::interval(self.config.metrics_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            let message = tokio::select! {
                message = self.next_message() => Some(message),
                _ = ticker.tick() => None,
            };
            match message {
                Some(message) => {
                    if !self.dispatch(message) {
                        break;
                    }
                }
                None => {
                    if self.state.broadcast_active {
                        self.emit_metrics();
                    }
                }
            }
        }

        info!("Engine stopped");
    }

    /// Process one message. Returns false once the engine should stop.
    pub async fn step(&mut self) -> bool {
        let message = self.next_message().await;
        self.dispatch(message)
    }

    async fn next_message(&mut self) -> Message {
        tokio::select! {
            biased;
            Some(exit) = self.exit_rx.recv() => Message::Exit(exit),
            Some(internal) = self.internal_rx.recv() => Message::Internal(internal),
            command = self.command_rx.recv() => match command {
                Some(command) => Message::Command(command),
                None => Message::Closed,
            },
        }
    }

    fn dispatch(&mut self, message: Message) -> bool {
        match message {
            Message::Command(command) => self.handle_command(command),
            Message::Internal(internal) => {
                self.handle_internal(internal);
                true
            }
            Message::Exit(exit) => {
                self.handle_exit(exit);
                true
            }
            Message::Closed => {
                info!("Command channel closed, shutting down");
                self.shutdown();
                false
            }
        }
    }

    /// Handle a command. Returns false if engine should stop.
    fn handle_command(&mut self, command: EngineCommand) -> bool {
        debug!(command = command.name(), "Handling command");

        match command {
            EngineCommand::StartBroadcast {
                targets,
                primary_connected,
            } => self.start_broadcast(targets, primary_connected),
            EngineCommand::StopBroadcast => self.stop_broadcast(StopReason::UserRequested),
            EngineCommand::ReconnectBroadcast => self.reconnect_broadcast(),
            EngineCommand::Publish { path } => self.handle_publish(&path),
            EngineCommand::Unpublish { path } => self.handle_unpublish(&path),
            EngineCommand::UpdateTargets { targets } => self.update_targets(targets),
            EngineCommand::SetActiveVideo { path } => {
                if let Err(e) = self.set_active_video(&path) {
                    warn!("{}", e);
                }
            }
            EngineCommand::SetBufferDuration { seconds } => self.set_buffer_duration(seconds),
            EngineCommand::SetAutoFallback { enabled } => self.set_auto_fallback(enabled),
            EngineCommand::StartManualFallback => self.start_manual_fallback(),
            EngineCommand::StopManualFallback => self.stop_manual_fallback(),
            EngineCommand::GetState => self.send_event(EngineEvent::Snapshot(self.state)),
            EngineCommand::GetMetrics => self.emit_metrics(),
            EngineCommand::Shutdown => {
                self.shutdown();
                return false;
            }
        }

        true
    }

    fn handle_internal(&mut self, internal: Internal) {
        trace!(?internal, "Internal notification");

        match internal {
            Internal::HandoffElapsed(generation) => self.source.handle_handoff_elapsed(generation),
            Internal::MasterRestartDue(generation) => self.master.handle_restart_due(generation),
            Internal::SourceSettled(generation) => {
                if self.settle.fire(generation)
                    && self.state.is_live_on(SourceKind::Obs)
                    && !self.state.manual_fallback_active
                {
                    debug!("Primary feed settled, switching producer");
                    self.start_source(SourceKind::Obs);
                }
            }
            Internal::RestartDue(generation) => {
                if !self.restart.fire(generation) {
                    return;
                }
                let plan = self.pending_restart.take();
                if self.state.broadcast_active {
                    debug!("Broadcast already running, dropping delayed restart");
                    return;
                }
                info!("Restarting broadcast");
                self.start_broadcast(plan.and_then(|p| p.targets), None);
            }
            Internal::SourceRecoveryDue(generation) => {
                if self.recovery.fire(generation)
                    && self.state.broadcast_active
                    && !self.source.has_producer()
                    && !self.source_frozen
                {
                    info!(source = %self.state.current_source, "Recovering producer");
                    self.start_source(self.state.current_source);
                }
            }
            Internal::ProbeFinished(result) => {
                match &result {
                    Some(probe) => debug!(?probe, "Primary feed probed"),
                    None => debug!("Primary feed probe failed, using defaults"),
                }
                self.last_probe = result;
            }
        }
    }

    fn handle_exit(&mut self, exit: ProcessExit) {
        if self.master.handle_exit(&exit) {
            return;
        }

        match self.source.handle_exit(&exit) {
            SourceExit::Current(kind) if self.state.broadcast_active => {
                warn!(source = %kind, "Producer {}", exit.describe());
                self.send_event(EngineEvent::Warning(WarningType::SourceExited { source: kind }));
                self.schedule_recovery();
            }
            outcome => trace!(id = %exit.id, ?outcome, "Process exit"),
        }
    }

    /// Start a broadcast.
    ///
    /// `targets` defaults to the stored target list and `primary_connected`
    /// to the last known primary feed state.
    #[instrument(name = "start_broadcast", skip(self, targets))]
    pub fn start_broadcast(
        &mut self,
        targets: Option<Vec<Target>>,
        primary_connected: Option<bool>,
    ) {
        if self.state.broadcast_active {
            debug!("Already broadcasting, ignoring start");
            return;
        }

        self.restart.cancel();
        self.pending_restart = None;

        let targets = enabled_targets(&targets.unwrap_or_else(|| self.store.targets()));
        let primary = primary_connected.unwrap_or(self.primary_connected);
        let source = if primary {
            SourceKind::Obs
        } else {
            SourceKind::Fallback
        };
        let settings = self.resolve_settings();
        let delay = Duration::from_secs(u64::from(self.store.buffer_duration_seconds()));

        info!(
            %source,
            targets = targets.len(),
            resolution = %settings.resolution(),
            fps = settings.fps,
            ?delay,
            "Starting broadcast"
        );

        self.metrics.start();
        let (feed_tx, feed_rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        let buffer = DelayBuffer::spawn(delay, feed_tx, Arc::clone(&self.metrics));

        self.update_state(|s| {
            s.broadcast_active = true;
            s.current_source = source;
            s.manual_fallback_active = false;
        });

        let redactor = self.redactor(&targets);
        self.master.attach(feed_rx);
        self.master.start(targets, settings, redactor);
        self.source.attach(buffer.input());
        self.buffer = Some(buffer);
        self.start_source(source);

        self.send_event(EngineEvent::Started);
    }

    /// Stop the broadcast. Pending chunks and deferred actions are discarded.
    #[instrument(name = "stop_broadcast", skip(self))]
    pub fn stop_broadcast(&mut self, reason: StopReason) {
        if !self.state.broadcast_active {
            if self.restart.is_pending() {
                info!("Cancelling pending broadcast restart");
                self.restart.cancel();
                self.pending_restart = None;
            } else {
                debug!("Not broadcasting, ignoring stop");
            }
            return;
        }

        info!(?reason, "Stopping broadcast");

        self.settle.cancel();
        self.recovery.cancel();
        self.restart.cancel();
        self.pending_restart = None;

        self.source.kill();
        self.source.detach();
        let stopped = self.master.stop();
        debug!(?stopped, "Master stopped");
        self.master.detach();
        if let Some(buffer) = self.buffer.take() {
            buffer.destroy();
        }
        self.metrics.stop();
        self.source_frozen = false;

        self.update_state(|s| {
            s.broadcast_active = false;
            s.manual_fallback_active = false;
        });

        self.send_event(EngineEvent::Stopped(reason));
    }

    /// Ingest listener reported a publish on `path`.
    pub fn handle_publish(&mut self, path: &str) {
        match self.match_stream_key(path) {
            Some(key) => self.handle_source_connect(&key),
            None => debug!("Ignoring publish on unknown path"),
        }
    }

    /// Ingest listener reported an unpublish on `path`.
    pub fn handle_unpublish(&mut self, path: &str) {
        if self.match_stream_key(path).is_some() {
            self.handle_source_disconnect();
        } else {
            debug!("Ignoring unpublish on unknown path");
        }
    }

    fn match_stream_key(&self, path: &str) -> Option<String> {
        let key = self.store.stream_key();
        if key.is_empty() {
            return None;
        }
        (path == self.config.publish_path(&key)).then_some(key)
    }

    /// The primary feed connected with `stream_key`.
    #[instrument(name = "source_connect", skip_all)]
    pub fn handle_source_connect(&mut self, stream_key: &str) {
        info!("Primary feed connected");
        self.primary_connected = true;
        self.send_event(EngineEvent::PrimaryFeed { connected: true });
        self.spawn_probe(stream_key);

        if !self.state.broadcast_active {
            self.start_broadcast(None, Some(true));
            return;
        }

        self.update_state(|s| {
            s.current_source = SourceKind::Obs;
            s.manual_fallback_active = false;
        });
        // Give the ingest server time to finish the handshake before relaying.
        self.settle.schedule(
            self.config.connect_settle,
            &self.internal_tx,
            Internal::SourceSettled,
        );
    }

    /// The primary feed went away.
    #[instrument(name = "source_disconnect", skip_all)]
    pub fn handle_source_disconnect(&mut self) {
        info!("Primary feed disconnected");
        self.primary_connected = false;
        self.send_event(EngineEvent::PrimaryFeed { connected: false });
        self.settle.cancel();

        if !self.state.broadcast_active {
            self.update_state(|s| s.current_source = SourceKind::Fallback);
            return;
        }

        if self.state.manual_fallback_active {
            debug!("Manual fallback active, producer unchanged");
            return;
        }

        if !self.store.auto_fallback_enabled() {
            warn!("Auto-fallback disabled, output will freeze");
            self.source.kill();
            self.recovery.cancel();
            self.source_frozen = true;
            self.update_state(|s| s.current_source = SourceKind::Fallback);
            self.send_event(EngineEvent::Warning(WarningType::SourceFrozen));
            return;
        }

        self.update_state(|s| s.current_source = SourceKind::Fallback);
        if self.source.current_kind() == Some(SourceKind::Fallback) {
            // The switch to the primary feed had not happened yet.
            debug!("Fallback producer still running");
            return;
        }
        self.start_source(SourceKind::Fallback);
    }

    /// Replace the distribution targets of a running broadcast.
    #[instrument(name = "update_targets", skip_all)]
    pub fn update_targets(&mut self, targets: Vec<Target>) {
        if !self.state.broadcast_active {
            debug!("Not broadcasting, targets apply on next start");
            return;
        }

        let next = enabled_targets(&targets);
        if same_targets(self.master.targets(), &next) {
            debug!("Enabled targets unchanged");
            return;
        }

        info!(
            from = self.master.targets().len(),
            to = next.len(),
            "Reconfiguring distribution targets"
        );
        let settings = self.master.settings();
        let redactor = self.redactor(&next);
        self.master.start(next, settings, redactor);
    }

    /// Change the fallback video, hot-swapping the producer if it is live.
    #[instrument(name = "set_active_video", skip(self))]
    pub fn set_active_video(&mut self, path: &Path) -> EngineResult<()> {
        let resolved = self.config.resolve_video(path);
        if !resolved.is_file() {
            return Err(EngineError::VideoNotFound(resolved));
        }

        info!("Active video set to {}", resolved.display());
        self.store.set_active_video(resolved);

        if self.state.is_live_on(SourceKind::Fallback) && self.source.has_producer() {
            self.start_source(SourceKind::Fallback);
        }
        Ok(())
    }

    /// Change the delay buffer duration. A running broadcast is restarted.
    pub fn set_buffer_duration(&mut self, seconds: u32) {
        info!(seconds, "Buffer duration changed");
        self.store.set_buffer_duration_seconds(seconds);

        if !self.state.broadcast_active {
            return;
        }

        let targets = self.master.targets().to_vec();
        self.stop_broadcast(StopReason::SettingChanged);
        self.schedule_restart(self.config.setting_restart_delay, Some(targets));
    }

    pub fn set_auto_fallback(&mut self, enabled: bool) {
        info!(enabled, "Auto-fallback changed");
        self.store.set_auto_fallback_enabled(enabled);
    }

    /// Stop now and start again after the reconnect delay.
    pub fn reconnect_broadcast(&mut self) {
        if !self.state.broadcast_active {
            debug!("Not broadcasting, ignoring reconnect");
            return;
        }
        self.stop_broadcast(StopReason::Reconnect);
        self.schedule_restart(self.config.reconnect_delay, None);
    }

    /// Force the fallback producer while the primary feed may still be up.
    pub fn start_manual_fallback(&mut self) {
        if !self.state.broadcast_active {
            debug!("Not broadcasting, ignoring manual fallback");
            return;
        }
        if self.state.manual_fallback_active {
            return;
        }

        info!("Manual fallback started");
        self.settle.cancel();
        self.update_state(|s| {
            s.manual_fallback_active = true;
            s.current_source = SourceKind::Fallback;
        });
        self.start_source(SourceKind::Fallback);
    }

    /// End a manual fallback, returning to the primary feed if it is up.
    pub fn stop_manual_fallback(&mut self) {
        if !self.state.manual_fallback_active {
            return;
        }

        info!(primary = self.primary_connected, "Manual fallback stopped");
        if self.primary_connected {
            self.update_state(|s| {
                s.manual_fallback_active = false;
                s.current_source = SourceKind::Obs;
            });
            self.start_source(SourceKind::Obs);
        } else {
            self.update_state(|s| s.manual_fallback_active = false);
        }
    }

    /// Current broadcast snapshot.
    pub fn state(&self) -> BroadcastState {
        self.state
    }

    /// Current relay counters.
    pub fn metrics(&self) -> RelayMetrics {
        self.metrics.snapshot()
    }

    pub fn is_primary_connected(&self) -> bool {
        self.primary_connected
    }

    /// Whether a delayed broadcast restart is scheduled.
    pub fn is_restart_pending(&self) -> bool {
        self.restart.is_pending()
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    fn shutdown(&mut self) {
        self.stop_broadcast(StopReason::Shutdown);
        self.settle.cancel();
        self.restart.cancel();
        self.recovery.cancel();
        self.send_event(EngineEvent::Shutdown);
    }

    fn start_source(&mut self, kind: SourceKind) {
        self.recovery.cancel();
        self.source_frozen = false;

        let plan = match kind {
            SourceKind::Obs => SourcePlan::Obs {
                url: self.config.primary_url(&self.store.stream_key()),
            },
            SourceKind::Fallback => SourcePlan::Fallback {
                video: self
                    .store
                    .active_video()
                    .map(|p| self.config.resolve_video(&p)),
            },
        };
        // Re-resolved per producer so a probe or store change since the
        // broadcast started is picked up.
        let settings = self.resolve_settings();
        let audio = AudioProfile::from_probe(self.last_probe.as_ref());
        let redactor = self.redactor(&[]);

        if let Err(e) = self.source.start(plan, settings, audio, redactor) {
            self.send_event(EngineEvent::Warning(WarningType::SourceSpawnFailed {
                message: e.to_string(),
            }));
            self.schedule_recovery();
        }
    }

    fn schedule_recovery(&mut self) {
        if let SourceRecovery::Restart { delay } = self.config.source_recovery {
            debug!(?delay, "Scheduling producer recovery");
            self.recovery
                .schedule(delay, &self.internal_tx, Internal::SourceRecoveryDue);
        }
    }

    fn schedule_restart(&mut self, delay: Duration, targets: Option<Vec<Target>>) {
        debug!(?delay, "Scheduling broadcast restart");
        self.pending_restart = Some(RestartPlan { targets });
        self.restart
            .schedule(delay, &self.internal_tx, Internal::RestartDue);
    }

    fn spawn_probe(&self, stream_key: &str) {
        let url = self.config.primary_url(stream_key);
        let prober = Arc::clone(&self.prober);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = prober.probe(&url).await;
            let _ = tx.send(Internal::ProbeFinished(result));
        });
    }

    /// Stream settings for a new broadcast or producer: stored values first,
    /// then the probed primary feed, then defaults.
    fn resolve_settings(&self) -> StreamSettings {
        let defaults = StreamSettings::default();
        let probe = self.last_probe.as_ref();

        let (width, height) = match self.store.fallback_resolution() {
            Some(r) => (r.width, r.height),
            None => probe
                .map(|p| (p.width, p.height))
                .unwrap_or((defaults.width, defaults.height)),
        };
        let fps = self
            .store
            .fallback_fps()
            .or_else(|| probe.map(|p| p.fps))
            .unwrap_or(defaults.fps);
        let bitrate_kbps = self
            .store
            .fallback_bitrate_kbps()
            .unwrap_or(defaults.bitrate_kbps);

        StreamSettings {
            width,
            height,
            fps,
            bitrate_kbps,
        }
    }

    /// Redactor for the ingest key and every known target key.
    fn redactor(&self, extra: &[Target]) -> Redactor {
        let stored = self.store.targets();
        Redactor::new(
            std::iter::once(self.store.stream_key())
                .chain(stored.into_iter().map(|t| t.stream_key))
                .chain(extra.iter().map(|t| t.stream_key.clone())),
        )
    }

    fn emit_metrics(&self) {
        self.send_event(EngineEvent::Metrics(self.metrics.snapshot()));
    }

    fn update_state(&mut self, change: impl FnOnce(&mut BroadcastState)) {
        let previous = self.state;
        change(&mut self.state);
        if previous == self.state {
            return;
        }

        debug!(
            previous = %previous.phase().name(),
            current = %self.state.phase().name(),
            "State transition"
        );

        self.send_event(EngineEvent::StateChanged {
            previous,
            current: self.state,
        });
    }

    fn send_event(&self, event: EngineEvent) {
        emit(&self.event_tx, event);
    }
}

/// Compare enabled target sets, ignoring order.
fn same_targets(current: &[Target], next: &[Target]) -> bool {
    fn key(t: &Target) -> (i64, &str, &str, &str) {
        (t.id, t.url.as_str(), t.stream_key.as_str(), t.name.as_str())
    }
    let mut a: Vec<_> = current.iter().map(key).collect();
    let mut b: Vec<_> = next.iter().map(key).collect();
    a.sort_unstable();
    b.sort_unstable();
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::MASTER_LABEL;
    use crate::store::MemoryStore;
    use crate::testing::{drain_events, flv, FakeLauncher, FakeProber};
    use tempfile::NamedTempFile;
    use tokio::io::AsyncReadExt;
    use tokio::time::Instant;

    const PUBLISH_PATH: &str = "/live/secret";

    struct Harness {
        engine: Engine,
        launcher: Arc<FakeLauncher>,
        prober: Arc<FakeProber>,
        store: Arc<MemoryStore>,
        commands: mpsc::Sender<EngineCommand>,
        events: broadcast::Receiver<EngineEvent>,
        video: NamedTempFile,
    }

    fn harness() -> Harness {
        harness_with(EngineConfig::default(), None)
    }

    fn harness_with(config: EngineConfig, probe: Option<ProbeResult>) -> Harness {
        let video = tempfile::Builder::new().suffix(".mp4").tempfile().unwrap();
        let store = Arc::new(MemoryStore::new("secret"));
        store.set_active_video(video.path().to_path_buf());
        let launcher = Arc::new(FakeLauncher::new());
        let prober = Arc::new(FakeProber::new(probe));
        let (commands, command_rx) = nexus_ipc::command_channel();
        let (event_tx, events) = nexus_ipc::event_channel();
        let engine = Engine::new(
            config,
            store.clone(),
            launcher.clone(),
            prober.clone(),
            command_rx,
            event_tx,
        );
        Harness {
            engine,
            launcher,
            prober,
            store,
            commands,
            events,
            video,
        }
    }

    fn target(id: i64) -> Target {
        Target {
            id,
            name: format!("t{}", id),
            url: format!("rtmp://t{}.example/app", id),
            stream_key: format!("key{}", id),
            enabled: true,
        }
    }

    impl Harness {
        /// Drive the engine for `duration` of (paused) time.
        async fn run_for(&mut self, duration: Duration) {
            let deadline = Instant::now() + duration;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    keep = self.engine.step() => {
                        if !keep {
                            break;
                        }
                    }
                }
            }
        }

        async fn settle(&mut self) {
            self.run_for(Duration::from_millis(10)).await;
        }

        fn sources_alive(&self) -> usize {
            self.launcher.live_count("source:")
        }

        fn masters_alive(&self) -> usize {
            self.launcher.live_count(MASTER_LABEL)
        }

        fn latest_source_label(&self) -> String {
            let id = self.launcher.latest("source:").unwrap();
            self.launcher.label(id).unwrap()
        }

        /// Tee legs of the most recent master.
        fn fan_out(&self) -> Vec<String> {
            let id = self.launcher.latest(MASTER_LABEL).unwrap();
            let args = self.launcher.args(id);
            args.last()
                .unwrap()
                .split('|')
                .map(|leg| leg.rsplit(']').next().unwrap().to_string())
                .collect()
        }

        fn events(&mut self) -> Vec<EngineEvent> {
            drain_events(&mut self.events)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_start_with_preview_only() {
        let mut h = harness();
        h.engine.start_broadcast(Some(Vec::new()), Some(false));
        h.settle().await;

        let state = h.engine.state();
        assert!(state.broadcast_active);
        assert_eq!(state.current_source, SourceKind::Fallback);
        assert!(!state.manual_fallback_active);

        assert_eq!(h.latest_source_label(), "source:fallback");
        let source = h.launcher.latest("source:").unwrap();
        let video = h.video.path().to_string_lossy().into_owned();
        assert!(h.launcher.args(source).contains(&video));

        assert_eq!(h.fan_out(), vec!["rtmp://localhost:1935/live/preview"]);
        assert_eq!(h.masters_alive(), 1);

        let events = h.events();
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::StateChanged { current, .. } if current.broadcast_active
        )));
        assert!(events.contains(&EngineEvent::Started));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_sequences_leave_nothing_running() {
        let mut h = harness();
        for round in 0..5 {
            h.engine
                .start_broadcast(Some(vec![target(1)]), Some(round % 2 == 0));
            h.engine.start_broadcast(Some(vec![target(2)]), Some(false));
            h.settle().await;
            assert_eq!(h.masters_alive(), 1);
            assert_eq!(h.sources_alive(), 1);

            h.engine.stop_broadcast(StopReason::UserRequested);
            h.engine.stop_broadcast(StopReason::UserRequested);
            h.settle().await;
            assert!(!h.engine.state().broadcast_active);
            assert_eq!(h.masters_alive(), 0);
            assert_eq!(h.sources_alive(), 0);
        }
        assert_eq!(h.launcher.launched(MASTER_LABEL).len(), 5);

        let stops = h
            .events()
            .into_iter()
            .filter(|e| matches!(e, EngineEvent::Stopped(_)))
            .count();
        assert_eq!(stops, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_broadcasting_hands_off_to_primary() {
        let mut h = harness();
        h.engine.start_broadcast(Some(Vec::new()), Some(false));
        h.settle().await;
        let fallback = h.launcher.latest("source:").unwrap();

        h.engine.handle_publish(PUBLISH_PATH);
        assert_eq!(h.engine.state().current_source, SourceKind::Obs);
        assert!(h.engine.is_primary_connected());
        // The switch waits for the ingest handshake to settle.
        h.run_for(Duration::from_millis(900)).await;
        assert_eq!(h.launcher.launched("source:").len(), 1);

        h.run_for(Duration::from_millis(200)).await;
        assert_eq!(h.latest_source_label(), "source:obs");
        let obs = h.launcher.latest("source:").unwrap();
        assert!(h
            .launcher
            .args(obs)
            .contains(&"rtmp://localhost:1935/live/secret".to_string()));
        assert_eq!(h.sources_alive(), 2);

        h.run_for(Duration::from_millis(1000)).await;
        assert!(!h.launcher.is_alive(fallback));
        assert!(h.launcher.is_alive(obs));
        assert_eq!(h.sources_alive(), 1);

        assert_eq!(
            h.prober.calls(),
            vec!["rtmp://localhost:1935/live/secret".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_with_wrong_key_is_ignored() {
        let mut h = harness();
        h.engine.handle_publish("/live/wrong");
        h.engine.handle_publish("/other/secret");
        h.settle().await;

        assert!(!h.engine.state().broadcast_active);
        assert!(!h.engine.is_primary_connected());
        assert!(h.launcher.launched("").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_when_idle_starts_with_stored_targets() {
        let mut h = harness();
        let mut disabled = target(2);
        disabled.enabled = false;
        h.store.set_targets(vec![target(1), disabled]);

        h.engine.handle_publish(PUBLISH_PATH);
        h.settle().await;

        let state = h.engine.state();
        assert!(state.broadcast_active);
        assert_eq!(state.current_source, SourceKind::Obs);
        assert_eq!(h.latest_source_label(), "source:obs");
        assert_eq!(
            h.fan_out(),
            vec![
                "rtmp://localhost:1935/live/preview".to_string(),
                "rtmp://t1.example/app/key1".to_string(),
            ]
        );
        assert!(h
            .events()
            .contains(&EngineEvent::PrimaryFeed { connected: true }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_with_auto_fallback_switches_producer() {
        let mut h = harness();
        h.engine.handle_publish(PUBLISH_PATH);
        h.settle().await;
        let obs = h.launcher.latest("source:").unwrap();

        h.engine.handle_unpublish(PUBLISH_PATH);
        h.settle().await;

        let state = h.engine.state();
        assert!(state.broadcast_active);
        assert_eq!(state.current_source, SourceKind::Fallback);
        assert_eq!(h.latest_source_label(), "source:fallback");
        assert_ne!(h.launcher.latest("source:").unwrap(), obs);

        h.run_for(Duration::from_millis(1100)).await;
        assert!(!h.launcher.is_alive(obs));
        assert_eq!(h.sources_alive(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_without_auto_fallback_freezes_output() {
        let mut h = harness();
        h.engine.set_auto_fallback(false);
        h.engine.handle_publish(PUBLISH_PATH);
        h.settle().await;
        h.events();

        h.engine.handle_unpublish(PUBLISH_PATH);
        h.settle().await;

        let state = h.engine.state();
        assert!(state.broadcast_active);
        assert_eq!(state.current_source, SourceKind::Fallback);
        assert_eq!(h.sources_alive(), 0);
        assert_eq!(h.launcher.launched("source:").len(), 1);
        assert_eq!(h.masters_alive(), 1);
        assert!(h
            .events()
            .contains(&EngineEvent::Warning(WarningType::SourceFrozen)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_targets_restarts_master_once() {
        let mut h = harness();
        h.engine
            .start_broadcast(Some(vec![target(1), target(2)]), Some(false));
        h.settle().await;
        let source = h.launcher.latest("source:").unwrap();

        h.engine.update_targets(vec![target(1), target(3)]);
        h.settle().await;
        assert_eq!(h.launcher.launched(MASTER_LABEL).len(), 2);
        assert_eq!(h.masters_alive(), 1);
        assert_eq!(
            h.fan_out(),
            vec![
                "rtmp://localhost:1935/live/preview".to_string(),
                "rtmp://t1.example/app/key1".to_string(),
                "rtmp://t3.example/app/key3".to_string(),
            ]
        );

        // Same set in another order, plus a disabled one: nothing to do.
        let mut disabled = target(4);
        disabled.enabled = false;
        h.engine
            .update_targets(vec![target(3), disabled, target(1)]);
        h.settle().await;
        assert_eq!(h.launcher.launched(MASTER_LABEL).len(), 2);

        // The producer was never touched.
        assert_eq!(h.launcher.latest("source:"), Some(source));
        assert!(h.launcher.is_alive(source));
    }

    #[tokio::test(start_paused = true)]
    async fn test_master_crash_restarts_until_stopped() {
        let mut h = harness();
        h.engine.start_broadcast(Some(vec![target(1)]), Some(false));
        h.settle().await;
        let first = h.launcher.latest(MASTER_LABEL).unwrap();
        let args = h.launcher.args(first);

        h.launcher.crash(first, 1);
        h.run_for(Duration::from_millis(1900)).await;
        assert_eq!(h.launcher.launched(MASTER_LABEL).len(), 1);
        assert_eq!(h.masters_alive(), 0);

        h.run_for(Duration::from_millis(200)).await;
        let second = h.launcher.latest(MASTER_LABEL).unwrap();
        assert_ne!(second, first);
        assert_eq!(h.launcher.args(second), args);
        assert_eq!(h.masters_alive(), 1);
        assert_eq!(h.engine.metrics().master_restarts, 1);

        // Crash again and stop during the backoff.
        h.launcher.crash(second, 1);
        h.run_for(Duration::from_millis(500)).await;
        h.engine.stop_broadcast(StopReason::UserRequested);
        h.run_for(Duration::from_secs(5)).await;
        assert_eq!(h.launcher.launched(MASTER_LABEL).len(), 2);
        assert_eq!(h.masters_alive(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_duration_change_restarts_broadcast() {
        let mut h = harness();
        h.engine.start_broadcast(Some(vec![target(1)]), Some(false));
        h.settle().await;
        h.events();

        h.engine.set_buffer_duration(3);
        assert_eq!(h.store.buffer_duration_seconds(), 3);
        assert!(!h.engine.state().broadcast_active);
        assert!(h.engine.is_restart_pending());
        assert!(h
            .events()
            .contains(&EngineEvent::Stopped(StopReason::SettingChanged)));

        h.run_for(Duration::from_millis(1900)).await;
        assert!(!h.engine.state().broadcast_active);

        h.run_for(Duration::from_millis(200)).await;
        assert!(h.engine.state().broadcast_active);
        assert_eq!(h.launcher.launched(MASTER_LABEL).len(), 2);
        assert_eq!(
            h.fan_out(),
            vec![
                "rtmp://localhost:1935/live/preview".to_string(),
                "rtmp://t1.example/app/key1".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_restart() {
        let mut h = harness();
        h.engine.start_broadcast(Some(Vec::new()), Some(false));
        h.settle().await;

        h.engine.set_buffer_duration(1);
        h.engine.stop_broadcast(StopReason::UserRequested);
        assert!(!h.engine.is_restart_pending());

        h.run_for(Duration::from_secs(5)).await;
        assert!(!h.engine.state().broadcast_active);
        assert_eq!(h.launcher.launched(MASTER_LABEL).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_restarts_after_delay() {
        let mut h = harness();
        h.store.set_targets(vec![target(7)]);
        h.engine.start_broadcast(None, Some(false));
        h.settle().await;

        h.engine.reconnect_broadcast();
        assert!(!h.engine.state().broadcast_active);
        h.run_for(Duration::from_millis(4900)).await;
        assert!(!h.engine.state().broadcast_active);

        h.run_for(Duration::from_millis(200)).await;
        assert!(h.engine.state().broadcast_active);
        assert_eq!(h.fan_out().len(), 2);
        assert!(h
            .events()
            .contains(&EngineEvent::Stopped(StopReason::Reconnect)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_fallback_round_trip() {
        let mut h = harness();
        h.engine.handle_publish(PUBLISH_PATH);
        h.settle().await;

        h.engine.start_manual_fallback();
        h.settle().await;
        let state = h.engine.state();
        assert!(state.manual_fallback_active);
        assert_eq!(state.current_source, SourceKind::Fallback);
        assert_eq!(h.latest_source_label(), "source:fallback");

        // A disconnect during the test changes nothing but bookkeeping.
        h.engine.handle_unpublish(PUBLISH_PATH);
        h.settle().await;
        assert_eq!(h.launcher.launched("source:").len(), 2);

        // With the primary feed gone, stopping the test stays on fallback.
        h.engine.stop_manual_fallback();
        h.settle().await;
        let state = h.engine.state();
        assert!(!state.manual_fallback_active);
        assert_eq!(state.current_source, SourceKind::Fallback);
        assert_eq!(h.launcher.launched("source:").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_manual_fallback_returns_to_primary() {
        let mut h = harness();
        h.engine.handle_publish(PUBLISH_PATH);
        h.settle().await;
        h.engine.start_manual_fallback();
        h.settle().await;

        h.engine.stop_manual_fallback();
        h.settle().await;
        let state = h.engine.state();
        assert!(!state.manual_fallback_active);
        assert_eq!(state.current_source, SourceKind::Obs);
        assert_eq!(h.latest_source_label(), "source:obs");
    }

    #[tokio::test(start_paused = true)]
    async fn test_real_connect_clears_manual_fallback() {
        let mut h = harness();
        h.engine.handle_publish(PUBLISH_PATH);
        h.settle().await;
        h.engine.start_manual_fallback();
        h.settle().await;

        h.engine.handle_publish(PUBLISH_PATH);
        let state = h.engine.state();
        assert!(!state.manual_fallback_active);
        assert_eq!(state.current_source, SourceKind::Obs);

        h.run_for(Duration::from_millis(1100)).await;
        assert_eq!(h.latest_source_label(), "source:obs");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_mid_handoff_kills_everything() {
        let mut h = harness();
        h.engine.start_broadcast(Some(Vec::new()), Some(false));
        h.settle().await;

        let other = tempfile::Builder::new().suffix(".mp4").tempfile().unwrap();
        h.engine.set_active_video(other.path()).unwrap();
        h.settle().await;
        assert_eq!(h.sources_alive(), 2);
        let newest = h.launcher.latest("source:").unwrap();
        let other_path = other.path().to_string_lossy().into_owned();
        assert!(h.launcher.args(newest).contains(&other_path));

        h.engine.stop_broadcast(StopReason::UserRequested);
        h.settle().await;
        assert_eq!(h.sources_alive(), 0);

        h.run_for(Duration::from_secs(3)).await;
        assert_eq!(h.launcher.launched("source:").len(), 2);
        assert!(!h.engine.state().broadcast_active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_active_video_rejects_missing_file() {
        let mut h = harness();
        let err = h
            .engine
            .set_active_video(Path::new("/nonexistent/video.mp4"))
            .unwrap_err();
        assert!(matches!(err, EngineError::VideoNotFound(_)));
        assert_eq!(
            h.store.active_video().as_deref(),
            Some(h.video.path())
        );
        h.settle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_crash_is_recovered_when_configured() {
        let config = EngineConfig {
            source_recovery: SourceRecovery::Restart {
                delay: Duration::from_secs(3),
            },
            ..Default::default()
        };
        let mut h = harness_with(config, None);
        h.engine.start_broadcast(Some(Vec::new()), Some(false));
        h.settle().await;
        let first = h.launcher.latest("source:").unwrap();

        h.launcher.crash(first, 1);
        h.settle().await;
        assert!(h.events().contains(&EngineEvent::Warning(
            WarningType::SourceExited {
                source: SourceKind::Fallback
            }
        )));

        h.run_for(Duration::from_millis(3100)).await;
        assert_eq!(h.launcher.launched("source:").len(), 2);
        assert_eq!(h.sources_alive(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_crash_waits_for_operator_by_default() {
        let mut h = harness();
        h.engine.start_broadcast(Some(Vec::new()), Some(false));
        h.settle().await;
        let first = h.launcher.latest("source:").unwrap();

        h.launcher.crash(first, 1);
        h.run_for(Duration::from_secs(10)).await;
        assert_eq!(h.launcher.launched("source:").len(), 1);
        assert!(h.engine.state().broadcast_active);
        assert_eq!(h.masters_alive(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_spawn_failure_is_reported() {
        let mut h = harness();
        h.launcher.fail_spawns("source:", true);
        h.engine.start_broadcast(Some(Vec::new()), Some(false));
        h.settle().await;

        assert!(h.engine.state().broadcast_active);
        assert_eq!(h.masters_alive(), 1);
        assert_eq!(h.engine.metrics().source_failures, 1);
        assert!(h.events().iter().any(|e| matches!(
            e,
            EngineEvent::Warning(WarningType::SourceSpawnFailed { .. })
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_result_shapes_next_broadcast() {
        let probe = ProbeResult {
            width: 1280,
            height: 720,
            fps: 30,
            sample_rate: 44100,
            channels: 1,
        };
        let mut h = harness_with(EngineConfig::default(), Some(probe));
        h.engine.handle_publish(PUBLISH_PATH);
        h.settle().await;
        h.engine.stop_broadcast(StopReason::UserRequested);
        h.engine.handle_unpublish(PUBLISH_PATH);
        h.settle().await;

        h.engine.start_broadcast(Some(Vec::new()), None);
        h.settle().await;
        assert_eq!(h.latest_source_label(), "source:fallback");
        let args = h.launcher.args(h.launcher.latest("source:").unwrap()).join(" ");
        assert!(args.contains("scale=1280:720"));
        assert!(args.contains("fps=30"));
        assert!(args.contains("-ar 44100 -ac 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_after_idle_connect_uses_probed_settings() {
        let probe = ProbeResult {
            width: 1280,
            height: 720,
            fps: 30,
            sample_rate: 48000,
            channels: 2,
        };
        let mut h = harness_with(EngineConfig::default(), Some(probe));
        // The broadcast starts before the probe result is in.
        h.engine.handle_publish(PUBLISH_PATH);
        h.settle().await;

        h.engine.handle_unpublish(PUBLISH_PATH);
        h.settle().await;
        assert_eq!(h.latest_source_label(), "source:fallback");
        let args = h.launcher.args(h.launcher.latest("source:").unwrap()).join(" ");
        assert!(args.contains("scale=1280:720"));
        assert!(args.contains("fps=30"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_swap_reads_current_store_settings() {
        let mut h = harness();
        h.engine.start_broadcast(Some(Vec::new()), Some(false));
        h.settle().await;

        h.store.set_fallback_resolution(Some("640x360".into()));
        h.store.set_fallback_fps(Some(25));
        let other = tempfile::Builder::new().suffix(".mp4").tempfile().unwrap();
        h.engine.set_active_video(other.path()).unwrap();
        h.settle().await;

        let args = h.launcher.args(h.launcher.latest("source:").unwrap()).join(" ");
        assert!(args.contains("scale=640:360"));
        assert!(args.contains("fps=25"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_output_reaches_master_after_delay() {
        let mut h = harness();
        h.store.set_buffer_duration_seconds(2);
        h.engine.start_broadcast(Some(Vec::new()), Some(false));
        h.settle().await;

        let master = h.launcher.latest(MASTER_LABEL).unwrap();
        let source = h.launcher.latest("source:").unwrap();
        let mut stdin = h.launcher.take_stdin(master).unwrap();

        let sent = Instant::now();
        let stream = flv::stream_start(0);
        h.launcher.write_stdout(source, &stream).await;
        let mut buf = vec![0u8; stream.len()];
        stdin.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, stream);
        assert!(Instant::now() >= sent + Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_change_mid_stream_gives_new_master_a_clean_stream() {
        let mut h = harness();
        h.engine.start_broadcast(Some(vec![target(1)]), Some(false));
        h.settle().await;
        let source = h.launcher.latest("source:").unwrap();
        let first = h.launcher.latest(MASTER_LABEL).unwrap();
        let mut first_stdin = h.launcher.take_stdin(first).unwrap();

        let opening = flv::stream_start(0);
        h.launcher.write_stdout(source, &opening).await;
        let mut buf = vec![0u8; opening.len()];
        first_stdin.read_exact(&mut buf).await.unwrap();

        h.engine.update_targets(vec![target(2)]);
        h.settle().await;
        let second = h.launcher.latest(MASTER_LABEL).unwrap();
        assert_ne!(second, first);
        let mut stdin = h.launcher.take_stdin(second).unwrap();

        // The producer is mid-tag when the new master comes up.
        let inter = flv::video(40, false);
        h.launcher.write_stdout(source, &inter[..5]).await;
        let rest = [&inter[5..], &flv::video(80, true)[..]].concat();
        h.launcher.write_stdout(source, &rest).await;

        let expected = [
            flv::header(),
            flv::metadata(),
            flv::video_sequence_header(0),
            flv::audio_sequence_header(0),
            flv::video(80, true),
        ]
        .concat();
        let mut buf = vec![0u8; expected.len()];
        stdin.read_exact(&mut buf).await.unwrap();
        assert!(buf.starts_with(b"FLV"));
        assert_eq!(buf, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_loop_round_trip() {
        let Harness {
            engine,
            launcher,
            commands,
            mut events,
            video: _video,
            ..
        } = harness();
        let task = tokio::spawn(engine.run());

        commands
            .send(EngineCommand::StartBroadcast {
                targets: None,
                primary_connected: Some(false),
            })
            .await
            .unwrap();
        commands.send(EngineCommand::GetState).await.unwrap();
        commands.send(EngineCommand::Shutdown).await.unwrap();
        task.await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let events = drain_events(&mut events);
        assert_eq!(events.first(), Some(&EngineEvent::Ready));
        assert!(events.contains(&EngineEvent::Started));
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::Snapshot(s) if s.broadcast_active)));
        assert!(events.contains(&EngineEvent::Stopped(StopReason::Shutdown)));
        assert_eq!(events.last(), Some(&EngineEvent::Shutdown));
        assert_eq!(launcher.live_count(""), 0);
    }

    #[test]
    fn test_same_targets_ignores_order() {
        assert!(same_targets(&[target(1), target(2)], &[target(2), target(1)]));
        assert!(!same_targets(&[target(1), target(2)], &[target(1), target(3)]));

        let mut renamed = target(1);
        renamed.stream_key = "rotated".into();
        assert!(!same_targets(&[target(1)], &[renamed]));
    }
}
