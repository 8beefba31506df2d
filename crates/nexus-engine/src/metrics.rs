//! Relay metrics collection and reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use tracing::debug;

use nexus_ipc::RelayMetrics;

/// Collects relay counters. Shared between the engine and its pump tasks.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    start_time: RwLock<Option<Instant>>,
    chunks_in: AtomicU64,
    chunks_out: AtomicU64,
    bytes_out: AtomicU64,
    source_handoffs: AtomicU64,
    source_failures: AtomicU64,
    master_restarts: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new broadcast: reset counters and the uptime clock.
    pub fn start(&self) {
        for counter in [
            &self.chunks_in,
            &self.chunks_out,
            &self.bytes_out,
            &self.source_handoffs,
            &self.source_failures,
            &self.master_restarts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        *self.start_time.write() = Some(Instant::now());
    }

    /// Stop the uptime clock. Counters are kept for a final report.
    pub fn stop(&self) {
        if let Some(start) = self.start_time.write().take() {
            debug!(
                "Relay ran {:.1}s, {} chunks out",
                start.elapsed().as_secs_f32(),
                self.chunks_out.load(Ordering::Relaxed)
            );
        }
    }

    pub fn is_running(&self) -> bool {
        self.start_time.read().is_some()
    }

    /// Record a chunk accepted by the delay buffer.
    pub fn record_chunk_in(&self) {
        self.chunks_in.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a chunk emitted by the delay buffer.
    pub fn record_chunk_out(&self, bytes: usize) {
        self.chunks_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_handoff(&self) {
        self.source_handoffs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_source_failure(&self) {
        self.source_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_master_restart(&self) {
        self.master_restarts.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> RelayMetrics {
        let uptime_seconds = self
            .start_time
            .read()
            .map(|s| s.elapsed().as_secs())
            .unwrap_or(0);

        RelayMetrics {
            chunks_in: self.chunks_in.load(Ordering::Relaxed),
            chunks_out: self.chunks_out.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            source_handoffs: self.source_handoffs.load(Ordering::Relaxed),
            source_failures: self.source_failures.load(Ordering::Relaxed),
            master_restarts: self.master_restarts.load(Ordering::Relaxed),
            uptime_seconds,
        }
    }
}
