//! Cancelable deferred actions.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// One pending deferred action, identified by a generation number.
///
/// Scheduling or cancelling bumps the generation, so a message from an
/// earlier schedule that was already in flight is recognised as stale by
/// [`DeferredSlot::fire`].
#[derive(Debug)]
pub(crate) struct DeferredSlot {
    name: &'static str,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl DeferredSlot {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            generation: 0,
            task: None,
        }
    }

    /// Send `make(generation)` on `tx` after `delay`, replacing anything pending.
    pub fn schedule<M, F>(&mut self, delay: Duration, tx: &mpsc::UnboundedSender<M>, make: F) -> u64
    where
        M: Send + 'static,
        F: FnOnce(u64) -> M + Send + 'static,
    {
        self.cancel();
        let generation = self.generation;
        let tx = tx.clone();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Receiver gone means the engine is shutting down.
            let _ = tx.send(make(generation));
        }));
        trace!(slot = self.name, generation, ?delay, "Scheduled");
        generation
    }

    /// Drop whatever is pending. Safe to call when nothing is.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            trace!(slot = self.name, generation = self.generation, "Cancelled");
        }
        self.generation += 1;
    }

    /// Consume a firing. Returns true only for the current, still pending schedule.
    pub fn fire(&mut self, generation: u64) -> bool {
        if self.task.is_some() && generation == self.generation {
            self.task = None;
            self.generation += 1;
            true
        } else {
            trace!(slot = self.name, generation, "Ignoring stale firing");
            false
        }
    }

    pub fn is_pending(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for DeferredSlot {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
