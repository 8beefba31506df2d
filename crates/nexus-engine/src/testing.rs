//! In-memory launcher and prober for engine tests.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;

use nexus_ffmpeg::{ProbeFuture, Prober};
use nexus_ipc::ProbeResult;
use nexus_process::{
    BoxedReader, BoxedWriter, ExitSender, ManagedProcess, ProcessError, ProcessExit, ProcessId,
    ProcessLauncher, ProcessResult, ProcessSpec,
};

const PIPE_CAPACITY: usize = 64 * 1024;

type StdoutSlot = Arc<tokio::sync::Mutex<Option<DuplexStream>>>;

struct FakeProcess {
    id: ProcessId,
    label: String,
    args: Vec<String>,
    alive: Arc<AtomicBool>,
    crash: Option<oneshot::Sender<i32>>,
    stdout: StdoutSlot,
    stdin: Option<DuplexStream>,
}

/// Launcher whose processes are tokio tasks with in-memory pipes.
#[derive(Default)]
pub(crate) struct FakeLauncher {
    processes: Mutex<Vec<FakeProcess>>,
    failing: Mutex<Vec<String>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make launches whose label starts with `prefix` fail (or succeed again).
    pub fn fail_spawns(&self, prefix: &str, fail: bool) {
        let mut failing = self.failing.lock();
        failing.retain(|p| p != prefix);
        if fail {
            failing.push(prefix.to_string());
        }
    }

    pub fn is_alive(&self, id: ProcessId) -> bool {
        self.processes
            .lock()
            .iter()
            .any(|p| p.id == id && p.alive.load(Ordering::Acquire))
    }

    /// Number of running processes whose label starts with `prefix`.
    pub fn live_count(&self, prefix: &str) -> usize {
        self.processes
            .lock()
            .iter()
            .filter(|p| p.label.starts_with(prefix) && p.alive.load(Ordering::Acquire))
            .count()
    }

    /// Ids of every process ever launched with a label starting with `prefix`.
    pub fn launched(&self, prefix: &str) -> Vec<ProcessId> {
        self.processes
            .lock()
            .iter()
            .filter(|p| p.label.starts_with(prefix))
            .map(|p| p.id)
            .collect()
    }

    /// The most recent launch with a label starting with `prefix`.
    pub fn latest(&self, prefix: &str) -> Option<ProcessId> {
        self.launched(prefix).last().copied()
    }

    pub fn label(&self, id: ProcessId) -> Option<String> {
        self.processes
            .lock()
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.label.clone())
    }

    pub fn args(&self, id: ProcessId) -> Vec<String> {
        self.processes
            .lock()
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.args.clone())
            .unwrap_or_default()
    }

    /// Make a process exit on its own with `code`.
    pub fn crash(&self, id: ProcessId, code: i32) {
        let crash = self
            .processes
            .lock()
            .iter_mut()
            .find(|p| p.id == id)
            .and_then(|p| p.crash.take());
        if let Some(tx) = crash {
            let _ = tx.send(code);
        }
    }

    /// Write to a producer's stdout as if the process emitted it.
    pub async fn write_stdout(&self, id: ProcessId, data: &[u8]) {
        let slot = self
            .processes
            .lock()
            .iter()
            .find(|p| p.id == id)
            .map(|p| Arc::clone(&p.stdout));
        let Some(slot) = slot else { return };
        let mut guard = slot.lock().await;
        if let Some(stdout) = guard.as_mut() {
            let _ = stdout.write_all(data).await;
            let _ = stdout.flush().await;
        }
        drop(guard);
        // Let the pump task forward the chunk.
        tokio::task::yield_now().await;
    }

    /// The read side of a process's stdin.
    pub fn take_stdin(&self, id: ProcessId) -> Option<DuplexStream> {
        self.processes
            .lock()
            .iter_mut()
            .find(|p| p.id == id)
            .and_then(|p| p.stdin.take())
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(&self, spec: ProcessSpec, exits: ExitSender) -> ProcessResult<ManagedProcess> {
        if self
            .failing
            .lock()
            .iter()
            .any(|prefix| spec.label.starts_with(prefix.as_str()))
        {
            return Err(ProcessError::Spawn {
                label: spec.label,
                source: io::Error::new(io::ErrorKind::NotFound, "fake spawn failure"),
            });
        }

        let id = ProcessId::next();
        let (stdin, stdin_peer) = if spec.stdin {
            let (ours, theirs) = duplex(PIPE_CAPACITY);
            (Some(Box::new(ours) as BoxedWriter), Some(theirs))
        } else {
            (None, None)
        };
        let (stdout, stdout_peer) = if spec.stdout {
            let (ours, theirs) = duplex(PIPE_CAPACITY);
            (Some(Box::new(ours) as BoxedReader), Some(theirs))
        } else {
            (None, None)
        };

        let (kill_tx, kill_rx) = oneshot::channel();
        let (crash_tx, crash_rx) = oneshot::channel();
        let alive = Arc::new(AtomicBool::new(true));
        let stdout_slot: StdoutSlot = Arc::new(tokio::sync::Mutex::new(stdout_peer));

        tokio::spawn(wait_fake(
            id,
            spec.label.clone(),
            kill_rx,
            crash_rx,
            Arc::clone(&alive),
            Arc::clone(&stdout_slot),
            exits,
        ));

        self.processes.lock().push(FakeProcess {
            id,
            label: spec.label.clone(),
            args: spec.args.clone(),
            alive,
            crash: Some(crash_tx),
            stdout: stdout_slot,
            stdin: stdin_peer,
        });

        Ok(ManagedProcess::from_parts(
            id, spec.label, None, stdin, stdout, kill_tx,
        ))
    }
}

async fn wait_fake(
    id: ProcessId,
    label: String,
    kill_rx: oneshot::Receiver<()>,
    crash_rx: oneshot::Receiver<i32>,
    alive: Arc<AtomicBool>,
    stdout: StdoutSlot,
    exits: ExitSender,
) {
    let code = tokio::select! {
        _ = kill_rx => None,
        Ok(code) = crash_rx => Some(code),
    };
    alive.store(false, Ordering::Release);
    // Closing our end gives the pump EOF, like a real pipe.
    stdout.lock().await.take();
    let _ = exits.send(ProcessExit {
        id,
        label,
        code,
        killed: code.is_none(),
        reason: None,
    });
}

/// Prober returning a fixed result and recording the URLs it was asked about.
#[derive(Default)]
pub(crate) struct FakeProber {
    result: Mutex<Option<ProbeResult>>,
    calls: Mutex<Vec<String>>,
}

impl FakeProber {
    pub fn new(result: Option<ProbeResult>) -> Self {
        Self {
            result: Mutex::new(result),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl Prober for FakeProber {
    fn probe(&self, url: &str) -> ProbeFuture {
        self.calls.lock().push(url.to_string());
        let result = *self.result.lock();
        Box::pin(async move { result })
    }
}

/// Collect every event currently queued on `rx`.
pub(crate) fn drain_events(
    rx: &mut tokio::sync::broadcast::Receiver<nexus_ipc::EngineEvent>,
) -> Vec<nexus_ipc::EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// FLV byte fixtures shaped like ffmpeg's `-f flv` output.
pub(crate) mod flv {
    use crate::flv::{FlvDemuxer, FlvUnit};

    fn tag(kind: u8, timestamp: u32, data: &[u8]) -> Vec<u8> {
        let [ext, hi, mid, lo] = timestamp.to_be_bytes();
        let mut out = vec![kind];
        out.extend_from_slice(&(data.len() as u32).to_be_bytes()[1..]);
        out.extend_from_slice(&[hi, mid, lo, ext, 0, 0, 0]);
        out.extend_from_slice(data);
        out.extend_from_slice(&((11 + data.len()) as u32).to_be_bytes());
        out
    }

    /// Audio+video header followed by `PreviousTagSize0`.
    pub fn header() -> Vec<u8> {
        b"FLV\x01\x05\x00\x00\x00\x09\x00\x00\x00\x00".to_vec()
    }

    pub fn metadata() -> Vec<u8> {
        tag(18, 0, b"\x02\x00\x0aonMetaData\x08\x00\x00\x00\x00\x00\x00\x09")
    }

    pub fn video_sequence_header(timestamp: u32) -> Vec<u8> {
        tag(9, timestamp, &[0x17, 0x00, 0, 0, 0, 0x01, 0x64, 0x00, 0x1f])
    }

    pub fn audio_sequence_header(timestamp: u32) -> Vec<u8> {
        tag(8, timestamp, &[0xaf, 0x00, 0x12, 0x10])
    }

    /// An AVC frame; `key` selects keyframe or inter frame.
    pub fn video(timestamp: u32, key: bool) -> Vec<u8> {
        let flags = if key { 0x17 } else { 0x27 };
        tag(9, timestamp, &[flags, 0x01, 0, 0, 0, 0x65, 0x88])
    }

    pub fn audio(timestamp: u32) -> Vec<u8> {
        tag(8, timestamp, &[0xaf, 0x01, 0x21, 0x00])
    }

    /// Everything a producer writes up to and including its first keyframe.
    pub fn stream_start(timestamp: u32) -> Vec<u8> {
        [
            header(),
            metadata(),
            video_sequence_header(timestamp),
            audio_sequence_header(timestamp),
            video(timestamp, true),
        ]
        .concat()
    }

    /// Split a stream that starts with a header.
    pub fn split(data: &[u8]) -> Vec<FlvUnit> {
        let mut demuxer = FlvDemuxer::new();
        demuxer.extend(data);
        let mut units = Vec::new();
        while let Some(unit) = demuxer.next_unit().unwrap() {
            units.push(unit);
        }
        units
    }

    /// Split headerless tag bytes.
    pub fn tags(data: &[u8]) -> Vec<FlvUnit> {
        let mut units = split(&[header(), data.to_vec()].concat());
        units.remove(0);
        units
    }
}
