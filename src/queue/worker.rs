//! Delivery worker.
//!
//! Each worker runs as an independent async task:
//!
//! ```text
//! Idle -> Fetching -> Sending -> Delivered | Retrying | DeadLettered -> Idle
//! ```
//!
//! Fetching is a blocking pop bounded by the fetch timeout, so cancellation
//! is observed within one timeout even on an empty queue. A failed send
//! never blocks the worker: the task is parked in the delayed set and the
//! worker moves on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dedupe::Deduplicator;
use super::delayed::{DelayedQueue, ScheduleOutcome};
use super::failed::FailedQueue;
use super::task::{FailedEntry, Task};
use super::task_queue::TaskQueue;
use crate::config::QueueConfig;
use crate::error::StoreError;
use crate::metrics::{DeliveryOutcome, MetricsCollector};
use crate::store::{KeySpace, Store};
use crate::transport::SharedTransport;

/// Lifetime delivery counters shared by all workers.
#[derive(Debug, Default)]
pub struct DeliveryCounters {
    processed: AtomicU64,
    failed: AtomicU64,
}

impl DeliveryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::SeqCst);
    }

    fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    /// Messages delivered by workers.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    /// Messages that ended up dead-lettered or lost.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }
}

/// Everything a worker needs, shared across the pool.
pub struct WorkerContext {
    pub config: QueueConfig,
    pub ready: Arc<TaskQueue>,
    pub delayed: Arc<DelayedQueue>,
    pub failed: Arc<FailedQueue>,
    pub dedupe: Arc<Deduplicator>,
    pub transport: SharedTransport,
    pub counters: Arc<DeliveryCounters>,
}

impl WorkerContext {
    /// Wires the queues, deduplicator and counters over one store.
    pub fn new(store: Arc<dyn Store>, config: QueueConfig, transport: SharedTransport) -> Self {
        let keys = KeySpace::new(config.key_prefix.clone());
        let ready = Arc::new(TaskQueue::new(Arc::clone(&store), &keys, transport.clone()));
        let delayed = Arc::new(DelayedQueue::new(
            Arc::clone(&store),
            &keys,
            Arc::clone(&ready),
            config.dispatch_batch,
        ));
        let failed = Arc::new(FailedQueue::new(Arc::clone(&store), &keys));
        let dedupe = Arc::new(Deduplicator::new(store, &config));

        Self {
            config,
            ready,
            delayed,
            failed,
            dedupe,
            transport,
            counters: Arc::new(DeliveryCounters::new()),
        }
    }
}

/// Activity of one worker, inspected by the scaling monitor.
#[derive(Debug, Clone, Copy)]
pub struct WorkerState {
    /// Currently handling a task.
    pub busy: bool,
    /// Last time the worker started or finished a task.
    pub last_active: Instant,
}

impl WorkerState {
    pub fn new() -> Self {
        Self {
            busy: false,
            last_active: Instant::now(),
        }
    }
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to a worker's state.
#[derive(Debug, Clone, Default)]
pub struct SharedWorkerState(Arc<Mutex<WorkerState>>);

impl SharedWorkerState {
    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> WorkerState {
        *self.lock()
    }

    fn set_busy(&self, busy: bool) {
        let mut state = self.lock();
        state.busy = busy;
        state.last_active = Instant::now();
    }
}

/// What one iteration of the worker loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The fetch timed out on an empty queue.
    Idle,
    /// The transport accepted the message.
    Delivered,
    /// Another worker already delivered this task.
    Skipped,
    /// The send failed and a retry is pending.
    Retrying,
    /// Retries are exhausted; the task is in the failed list.
    DeadLettered,
    /// The payload was malformed and dropped.
    Discarded,
    /// Neither retry nor archive was possible.
    Lost,
}

pub struct Worker {
    id: u64,
    ctx: Arc<WorkerContext>,
    state: SharedWorkerState,
    cancel: CancellationToken,
    metrics: MetricsCollector,
}

impl Worker {
    pub fn new(
        id: u64,
        ctx: Arc<WorkerContext>,
        state: SharedWorkerState,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            ctx,
            state,
            cancel,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Main worker loop; returns once the worker's token is cancelled.
    pub async fn run(self) {
        info!(worker_id = self.id, "Worker started");

        while !self.cancel.is_cancelled() {
            match self.process_next().await {
                Ok(StepOutcome::Idle) => {}
                Ok(outcome) => debug!(worker_id = self.id, outcome = ?outcome, "Step finished"),
                Err(e) => {
                    error!(worker_id = self.id, error = %e, "Failed to fetch task");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.ctx.config.error_backoff) => {}
                    }
                }
            }
        }

        info!(worker_id = self.id, "Worker stopped");
    }

    /// Fetches and handles at most one task.
    ///
    /// # Errors
    ///
    /// Only a store failure during fetch is returned; everything after the
    /// fetch is handled and logged here.
    pub async fn process_next(&self) -> Result<StepOutcome, StoreError> {
        let Some(payload) = self.ctx.ready.pop(self.ctx.config.fetch_timeout).await? else {
            return Ok(StepOutcome::Idle);
        };

        self.state.set_busy(true);
        let outcome = self.handle(&payload).await;
        self.state.set_busy(false);

        Ok(outcome)
    }

    async fn handle(&self, payload: &str) -> StepOutcome {
        let mut task: Task = match serde_json::from_str(payload) {
            Ok(task) => task,
            Err(e) => {
                error!(worker_id = self.id, error = %e, "Discarding malformed task");
                self.metrics.record_delivery(DeliveryOutcome::Discarded);
                return StepOutcome::Discarded;
            }
        };

        match self.ctx.dedupe.already_delivered(&task).await {
            Ok(true) => {
                info!(worker_id = self.id, task_id = %task.id, "Task already delivered, skipping");
                self.metrics.record_delivery(DeliveryOutcome::Skipped);
                return StepOutcome::Skipped;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    worker_id = self.id,
                    task_id = %task.id,
                    error = %e,
                    "Could not read sent marker"
                );
            }
        }

        let started = std::time::Instant::now();
        let transport = self.ctx.transport.current();
        let result = transport.send(&task.to, &task.subject, &task.body).await;
        self.metrics.observe_send(started.elapsed());

        match result {
            Ok(()) => {
                self.finish_delivery(&task).await;
                info!(
                    worker_id = self.id,
                    task_id = %task.id,
                    to = %task.to,
                    attempt = task.retry + 1,
                    "Mail delivered"
                );
                StepOutcome::Delivered
            }
            Err(e) => {
                let message = e.to_string();
                if task.record_failure() {
                    self.reschedule(&task, &message).await
                } else {
                    self.dead_letter(task, message).await
                }
            }
        }
    }

    async fn finish_delivery(&self, task: &Task) {
        if let Err(e) = self.ctx.dedupe.mark_sent(task).await {
            warn!(
                worker_id = self.id,
                task_id = %task.id,
                error = %e,
                "Could not record delivery marker"
            );
        }
        self.ctx.counters.record_processed();
        self.metrics.record_delivery(DeliveryOutcome::Delivered);
    }

    async fn reschedule(&self, task: &Task, reason: &str) -> StepOutcome {
        let delay = task.retry_delay(self.ctx.config.base_retry_delay);
        warn!(
            worker_id = self.id,
            task_id = %task.id,
            retry = task.retry,
            max_retry = task.max_retry,
            delay_secs = delay.as_secs(),
            error = %reason,
            "Send failed, retry scheduled"
        );

        match self.ctx.delayed.schedule(task, delay).await {
            Ok(ScheduleOutcome::Scheduled { .. }) => {
                self.metrics.record_delivery(DeliveryOutcome::Retried);
                StepOutcome::Retrying
            }
            Ok(ScheduleOutcome::SentInline) => {
                self.finish_delivery(task).await;
                StepOutcome::Delivered
            }
            Err(e) => {
                error!(
                    worker_id = self.id,
                    task_id = %task.id,
                    error = %e,
                    "Retry could not be scheduled, message lost"
                );
                self.ctx.counters.record_failed();
                StepOutcome::Lost
            }
        }
    }

    async fn dead_letter(&self, task: Task, reason: String) -> StepOutcome {
        let task_id = task.id.clone();
        error!(
            worker_id = self.id,
            task_id = %task_id,
            retry = task.retry,
            error = %reason,
            "Retries exhausted, moving to failed queue"
        );

        self.ctx.counters.record_failed();
        let entry = FailedEntry::new(task, reason, self.id);
        match self.ctx.failed.append(&entry).await {
            Ok(()) => {
                self.metrics.record_delivery(DeliveryOutcome::DeadLettered);
                StepOutcome::DeadLettered
            }
            Err(e) => {
                error!(
                    worker_id = self.id,
                    task_id = %task_id,
                    error = %e,
                    "Failed to archive task"
                );
                StepOutcome::Lost
            }
        }
    }
}
