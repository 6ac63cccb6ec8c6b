//! Bounded work queue and the worker pool that drains it.
//!
//! The receiver admits an event to the ledger only after reserving a queue
//! slot, so an admitted event is always queued. When the queue is full the
//! receiver sheds the webhook instead of admitting it; the provider retries
//! later and nothing is lost.
//!
//! Each event is handled in its own task. A handler that panics takes down
//! that task only; the event is marked `failed` and the worker moves on.
//!
//! On shutdown the workers stop taking new keys and finish the event they
//! are handling. Keys still queued stay `received` in the ledger and are
//! picked up by [`Dispatcher::recover_pending`] on the next start.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use super::{DispatchError, Dispatcher, DispatcherConfig};
use crate::event_store::EventKey;

/// Work queue failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Work queue is full")]
    Full,

    #[error("Work queue is closed")]
    Closed,
}

/// Producer side of the bounded work queue.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    sender: mpsc::Sender<EventKey>,
}

/// A reserved queue position; dropping it releases the slot.
#[derive(Debug)]
pub struct QueueSlot {
    permit: mpsc::OwnedPermit<EventKey>,
}

impl QueueSlot {
    pub fn submit(self, key: EventKey) {
        self.permit.send(key);
    }
}

impl WorkQueue {
    /// Create a queue and its consumer end.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<EventKey>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Reserve a slot without waiting.
    pub fn try_reserve(&self) -> Result<QueueSlot, QueueError> {
        self.sender
            .clone()
            .try_reserve_owned()
            .map(|permit| QueueSlot { permit })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => QueueError::Full,
                mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
            })
    }

    /// Queue a key, waiting for space.
    pub async fn enqueue(&self, key: EventKey) -> Result<(), QueueError> {
        self.sender.send(key).await.map_err(|_| QueueError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Free slots right now.
    pub fn capacity(&self) -> usize {
        self.sender.capacity()
    }

    pub fn max_capacity(&self) -> usize {
        self.sender.max_capacity()
    }
}

/// Fixed set of workers running [`Dispatcher::handle_inbound`].
pub struct WorkerPool {
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `config.worker_count` workers and return the queue feeding them.
    pub fn start(
        dispatcher: Arc<Dispatcher>,
        config: &DispatcherConfig,
        cancellation_token: CancellationToken,
    ) -> (Self, WorkQueue) {
        let (queue, receiver) = WorkQueue::bounded(config.queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));

        info!(
            worker_count = config.worker_count,
            queue_capacity = config.queue_capacity,
            "Spawning dispatch workers"
        );

        let worker_handles = (0..config.worker_count.max(1))
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    dispatcher.clone(),
                    receiver.clone(),
                    cancellation_token.clone(),
                ))
            })
            .collect();

        (
            Self {
                cancellation_token,
                worker_handles,
            },
            queue,
        )
    }

    pub fn worker_count(&self) -> usize {
        self.worker_handles.len()
    }

    /// Whether any worker is still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }

    /// Stop taking work and wait for in-flight events.
    ///
    /// Workers still running at the deadline are aborted. Their events stay
    /// `processing` in the ledger.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<(), DispatchError> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "Initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let deadline = tokio::time::Instant::now() + timeout;
        let mut timed_out = 0usize;

        for (worker_id, mut handle) in std::mem::take(&mut self.worker_handles)
            .into_iter()
            .enumerate()
        {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join_error)) => {
                    error!(worker_id, error = %join_error, "Worker task panicked during shutdown");
                }
                Err(_) => {
                    handle.abort();
                    timed_out += 1;
                }
            }
        }

        if timed_out > 0 {
            error!(
                timed_out,
                timeout_seconds = timeout.as_secs(),
                "Worker shutdown timed out, aborted remaining workers"
            );
            return Err(DispatchError::ShutdownTimeout { timeout });
        }

        info!("Worker pool shutdown completed");
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.worker_handles.is_empty() {
            self.cancellation_token.cancel();
        }
    }
}

async fn run_worker(
    worker_id: usize,
    dispatcher: Arc<Dispatcher>,
    receiver: Arc<Mutex<mpsc::Receiver<EventKey>>>,
    cancellation_token: CancellationToken,
) {
    debug!(worker_id, "Dispatch worker started");

    loop {
        let key = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => break,
                key = receiver.recv() => key,
            }
        };

        let Some(key) = key else {
            break;
        };

        // Aborting the worker at shutdown also aborts the event task.
        let task = AbortOnDropHandle::new(tokio::spawn({
            let dispatcher = dispatcher.clone();
            let key = key.clone();
            async move { dispatcher.handle_inbound(&key).await }
        }));

        match task.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(worker_id, event = %key, error = %e, "Inbound dispatch failed");
            }
            Err(join_error) => {
                error!(
                    worker_id,
                    event = %key,
                    error = %join_error,
                    "Event handling panicked"
                );
                let reason = format!("handler panicked: {}", join_error);
                if let Err(e) = dispatcher.fail_abandoned(&key, &reason).await {
                    warn!(
                        worker_id,
                        event = %key,
                        error = %e,
                        "Could not record panicked event"
                    );
                }
            }
        }
    }

    debug!(worker_id, "Dispatch worker stopped");
}

#[cfg(test)]
#[path = "worker_pool_tests.rs"]
mod tests;
