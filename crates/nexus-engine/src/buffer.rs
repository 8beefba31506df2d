//! Fixed time-delay relay between the source producer and the distributor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::flv::FlvUnit;
use crate::metrics::MetricsCollector;

/// Unit with its arrival time.
type Timed = (Instant, FlvUnit);

/// Cloneable write side of a [`DelayBuffer`].
#[derive(Debug, Clone)]
pub struct BufferInput {
    tx: mpsc::UnboundedSender<Timed>,
    destroyed: Arc<AtomicBool>,
    metrics: Arc<MetricsCollector>,
}

impl BufferInput {
    /// Queue a unit. Returns false if the buffer was destroyed.
    pub fn push(&self, unit: FlvUnit) -> bool {
        if self.destroyed.load(Ordering::Acquire) {
            return false;
        }
        if self.tx.send((Instant::now(), unit)).is_err() {
            return false;
        }
        self.metrics.record_chunk_in();
        true
    }
}

/// Re-emits every unit, in arrival order, `delay` after it arrived.
///
/// Destroying the buffer discards everything still pending; nothing is
/// emitted afterwards.
#[derive(Debug)]
pub struct DelayBuffer {
    delay: Duration,
    input: BufferInput,
    task: JoinHandle<()>,
}

impl DelayBuffer {
    /// Start relaying into `output`.
    pub fn spawn(
        delay: Duration,
        output: mpsc::Sender<FlvUnit>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let destroyed = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(relay(
            delay,
            rx,
            output,
            Arc::clone(&destroyed),
            Arc::clone(&metrics),
        ));
        debug!(?delay, "Delay buffer started");
        Self {
            delay,
            input: BufferInput {
                tx,
                destroyed,
                metrics,
            },
            task,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn input(&self) -> BufferInput {
        self.input.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.input.destroyed.load(Ordering::Acquire)
    }

    /// Stop relaying and discard pending units. Idempotent.
    pub fn destroy(&self) {
        if !self.input.destroyed.swap(true, Ordering::AcqRel) {
            self.task.abort();
            debug!("Delay buffer destroyed");
        }
    }
}

impl Drop for DelayBuffer {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn relay(
    delay: Duration,
    mut rx: mpsc::UnboundedReceiver<Timed>,
    output: mpsc::Sender<FlvUnit>,
    destroyed: Arc<AtomicBool>,
    metrics: Arc<MetricsCollector>,
) {
    while let Some((arrival, unit)) = rx.recv().await {
        if !delay.is_zero() {
            tokio::time::sleep_until(arrival + delay).await;
        }
        if destroyed.load(Ordering::Acquire) {
            break;
        }
        let len = unit.len();
        if output.send(unit).await.is_err() {
            trace!("Buffer output closed");
            break;
        }
        metrics.record_chunk_out(len);
    }
}
