//! Background delivery loop between the persistent queue and the collector.

pub mod stats;

pub use stats::{EmitterMetrics, EmitterStats};

use crate::buffer::{PersistentBlockingQueue, QueueError};
use crate::domain::{Payload, RecordId};
use crate::reliability::{BackoffConfig, BackoffError, BackoffPolicy};
use crate::sender::{ConnectionStats, Endpoint, SendResult};
use clap::ValueEnum;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum EmitterError {
    #[error("Emitter already running")]
    AlreadyRunning,
    #[error("Emitter has been closed")]
    Closed,
    #[error("No tokio runtime available to run the emitter")]
    NoRuntime,
    #[error("Invalid emitter configuration: {0}")]
    InvalidConfig(String),
    #[error("Backoff error: {0}")]
    Backoff(#[from] BackoffError),
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// What happens to an event too large to ever be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OversizePolicy {
    /// Report it as failed, then delete it from the queue
    #[default]
    Drop,
    /// Report it as failed and leave it queued
    Retain,
}

#[derive(Debug, Clone)]
pub struct EmitterConfig {
    /// Maximum events taken from the queue per batch
    pub send_limit: usize,
    /// How long one peek waits for new events
    pub poll_interval: Duration,
    pub backoff: BackoffConfig,
    pub oversize_policy: OversizePolicy,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            send_limit: 150,
            poll_interval: Duration::from_millis(1_000),
            backoff: BackoffConfig::default(),
            oversize_policy: OversizePolicy::default(),
        }
    }
}

/// Tally of a synchronous flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    pub attempted: usize,
    pub failed: usize,
}

impl FlushOutcome {
    pub fn succeeded(&self) -> usize {
        self.attempted - self.failed
    }
}

/// Called after every batch with `(successes, failures)`.
pub type SendCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;
/// Returns false while the device has no connectivity.
pub type OnlinePredicate = Arc<dyn Fn() -> bool + Send + Sync>;

struct EmitterShared {
    queue: Arc<PersistentBlockingQueue>,
    endpoint: Endpoint,
    config: EmitterConfig,
    backoff: BackoffPolicy,
    on_send: RwLock<Option<SendCallback>>,
    is_online: RwLock<Option<OnlinePredicate>>,
    metrics: EmitterMetrics,
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Drives events from the queue to the collector on a background task.
///
/// At most one loop runs per emitter. `stop` and `flush` interrupt both the
/// poll wait and the backoff wait, so they return without waiting out either.
pub struct Emitter {
    shared: Arc<EmitterShared>,
    worker: Mutex<Option<Worker>>,
    flush_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl Emitter {
    pub fn new(
        queue: Arc<PersistentBlockingQueue>,
        endpoint: Endpoint,
        config: EmitterConfig,
    ) -> Result<Self, EmitterError> {
        if config.send_limit == 0 {
            return Err(EmitterError::InvalidConfig(
                "send_limit must be greater than 0".to_string(),
            ));
        }
        let backoff = BackoffPolicy::new(config.backoff)?;

        Ok(Self {
            shared: Arc::new(EmitterShared {
                queue,
                endpoint,
                config,
                backoff,
                on_send: RwLock::new(None),
                is_online: RwLock::new(None),
                metrics: EmitterMetrics::new(),
            }),
            worker: Mutex::new(None),
            flush_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn with_send_callback(self, callback: SendCallback) -> Self {
        self.set_send_callback(Some(callback));
        self
    }

    pub fn with_online_check(self, predicate: OnlinePredicate) -> Self {
        self.set_online_check(Some(predicate));
        self
    }

    pub fn set_send_callback(&self, callback: Option<SendCallback>) {
        *self.shared.on_send.write() = callback;
    }

    pub fn set_online_check(&self, predicate: Option<OnlinePredicate>) {
        *self.shared.is_online.write() = predicate;
    }

    pub fn queue(&self) -> &Arc<PersistentBlockingQueue> {
        &self.shared.queue
    }

    pub fn config(&self) -> &EmitterConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> EmitterStats {
        self.shared.metrics.snapshot()
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        self.shared.endpoint.connection_stats()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    /// Spawns the delivery loop on the current tokio runtime.
    pub fn start(&self) -> Result<(), EmitterError> {
        if self.is_closed() {
            return Err(EmitterError::Closed);
        }

        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return Err(EmitterError::AlreadyRunning);
        }

        let runtime = Handle::try_current().map_err(|_| EmitterError::NoRuntime)?;
        let cancel = CancellationToken::new();
        let handle = runtime.spawn(run_loop(Arc::clone(&self.shared), cancel.clone()));
        *worker = Some(Worker { cancel, handle });

        info!(
            "Emitter started (send_limit={}, poll_interval={:?})",
            self.shared.config.send_limit, self.shared.config.poll_interval
        );
        Ok(())
    }

    /// Stops the loop and waits for it to exit. No-op when not running.
    pub async fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };

        worker.cancel.cancel();
        if let Err(e) = worker.handle.await {
            error!("Emitter task ended abnormally: {}", e);
        }
        info!("Emitter stopped");
    }

    /// Stops the loop, then sends until the queue is empty or a batch fails.
    ///
    /// The loop is restarted afterwards unless `disable_restart` is set or the
    /// emitter has been closed meanwhile. A closed emitter returns
    /// [`EmitterError::Closed`] without touching the queue.
    pub async fn flush(&self, disable_restart: bool) -> Result<FlushOutcome, EmitterError> {
        if self.is_closed() {
            return Err(EmitterError::Closed);
        }
        let _guard = self.flush_lock.lock().await;

        self.stop().await;
        let drained = drain(&self.shared).await;

        if !disable_restart && !self.is_closed() {
            match self.start() {
                Ok(()) | Err(EmitterError::AlreadyRunning) => {}
                Err(e) => return Err(e),
            }
        }

        let outcome = drained?;
        info!(
            "Flush finished: {} attempted, {} failed",
            outcome.attempted, outcome.failed
        );
        Ok(outcome)
    }

    /// Stops the loop for good. Later `start` calls return [`EmitterError::Closed`].
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.stop().await;
    }
}

impl Drop for Emitter {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("config", &self.shared.config)
            .field("running", &self.is_running())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl EmitterShared {
    fn online(&self) -> bool {
        self.is_online.read().as_ref().is_none_or(|predicate| predicate())
    }

    /// Applies a send result to the queue: removes delivered and dropped
    /// records, releases the rest, records metrics and notifies the callback.
    fn settle(&self, batch_len: usize, result: &SendResult, latency: Duration) -> Result<(), QueueError> {
        let (drop_ids, retry_ids): (Vec<RecordId>, Vec<RecordId>) = match self.config.oversize_policy {
            OversizePolicy::Drop => result
                .failure_ids
                .iter()
                .copied()
                .partition(|id| result.oversize_ids.contains(id)),
            OversizePolicy::Retain => (Vec::new(), result.failure_ids.clone()),
        };

        self.queue.release(&retry_ids);

        let settled = self.remove_all(&result.success_ids).and_then(|()| {
            if !drop_ids.is_empty() {
                self.remove_all(&drop_ids)?;
                warn!("Dropped {} oversize events: {:?}", drop_ids.len(), drop_ids);
                self.metrics.record_oversize_dropped(drop_ids.len());
            }
            Ok(())
        });

        if settled.is_err() {
            // Leave nothing leased; redelivery beats loss
            self.queue.release(&result.success_ids);
            self.queue.release(&drop_ids);
        }

        self.metrics
            .record_batch(result.success_count(), result.failure_count(), latency);
        debug!(
            "Batch of {} settled: {} sent, {} failed",
            batch_len,
            result.success_count(),
            result.failure_count()
        );

        let callback = self.on_send.read().clone();
        if let Some(callback) = callback {
            callback(result.success_count(), result.failure_count());
        }

        settled
    }

    fn remove_all(&self, ids: &[RecordId]) -> Result<(), QueueError> {
        if !ids.is_empty() && !self.queue.remove(ids)? {
            warn!("Some of {} records were already gone from storage", ids.len());
        }
        Ok(())
    }

    fn drop_corrupt(&self, id: RecordId, source: &dyn std::error::Error) {
        error!("Removing undecodable record {}: {}", id, source);
        self.metrics.record_corrupt_dropped();
        if let Err(e) = self.queue.remove(&[id]) {
            error!("Failed to remove undecodable record {}: {}", id, e);
            self.queue.release(&[id]);
        }
    }
}

async fn run_loop(shared: Arc<EmitterShared>, cancel: CancellationToken) {
    debug!("Emitter loop running");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        if !shared.online() {
            debug!("Device offline, backing off");
            if !backoff_wait(&shared, &cancel).await {
                break;
            }
            continue;
        }

        let peeked = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            peeked = shared.queue.peek(shared.config.send_limit, shared.config.poll_interval) => peeked,
        };

        let batch = match peeked {
            Ok(batch) if batch.is_empty() => continue,
            Ok(batch) => batch,
            Err(QueueError::Decode { id, source }) => {
                shared.drop_corrupt(id, &source);
                continue;
            }
            Err(e) => {
                error!("Failed to read from queue: {}", e);
                shared.metrics.record_queue_error();
                if !backoff_wait(&shared, &cancel).await {
                    break;
                }
                continue;
            }
        };

        let start = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                shared.queue.release(&batch_ids(&batch));
                break;
            }
            result = shared.endpoint.send(&batch) => result,
        };

        if let Err(e) = shared.settle(batch.len(), &result, start.elapsed()) {
            error!("Failed to update queue after send: {}", e);
            shared.metrics.record_queue_error();
        }

        if result.success_count() > 0 {
            shared.backoff.reset();
        } else if result.failure_count() > 0 && !backoff_wait(&shared, &cancel).await {
            break;
        }
    }

    debug!("Emitter loop exited");
}

/// Sleeps for the next backoff delay. Returns false if cancelled meanwhile.
async fn backoff_wait(shared: &EmitterShared, cancel: &CancellationToken) -> bool {
    let delay = shared.backoff.next_delay();
    shared.metrics.record_backoff();
    warn!(
        "Backing off for {:?} ({} consecutive)",
        delay,
        shared.backoff.consecutive_failures()
    );

    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Sends with zero-wait peeks until the queue is empty or a batch has a failure.
async fn drain(shared: &EmitterShared) -> Result<FlushOutcome, QueueError> {
    let mut outcome = FlushOutcome::default();

    loop {
        let batch = match shared.queue.peek(shared.config.send_limit, Duration::ZERO).await {
            Ok(batch) if batch.is_empty() => break,
            Ok(batch) => batch,
            Err(QueueError::Decode { id, source }) => {
                shared.drop_corrupt(id, &source);
                outcome.attempted += 1;
                outcome.failed += 1;
                break;
            }
            Err(e) => return Err(e),
        };

        let start = Instant::now();
        let result = shared.endpoint.send(&batch).await;
        shared.settle(batch.len(), &result, start.elapsed())?;

        outcome.attempted += batch.len();
        outcome.failed += result.failure_count();

        if result.failure_count() > 0 {
            break;
        }
    }

    Ok(outcome)
}

fn batch_ids(batch: &[(RecordId, Payload)]) -> Vec<RecordId> {
    batch.iter().map(|(id, _)| *id).collect()
}
