//! Delayed retries.
//!
//! A task waiting for its next attempt sits in the `delayed` sorted set,
//! scored by the unix time (seconds) at which it becomes due. The dispatcher
//! loop periodically promotes due entries back into the ready list.
//!
//! Promotion moves an entry from the delayed set to the ready list in one
//! atomic store operation. Concurrent dispatchers never deliver a task twice,
//! and a store failure mid-scan leaves the entry where it was.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::task::Task;
use super::task_queue::TaskQueue;
use crate::error::{QueueError, StoreError};
use crate::metrics::{DeliveryOutcome, MetricsCollector};
use crate::store::{KeySpace, Store};

/// Where a rescheduled task ended up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScheduleOutcome {
    /// Stored in the delayed set, due at this unix time.
    Scheduled { execute_at: f64 },
    /// The store refused it, so the task was sent synchronously instead.
    SentInline,
}

/// Current wall-clock time as fractional unix seconds.
pub fn unix_now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

pub struct DelayedQueue {
    store: Arc<dyn Store>,
    key: String,
    ready: Arc<TaskQueue>,
    batch: usize,
    metrics: MetricsCollector,
}

impl DelayedQueue {
    pub fn new(
        store: Arc<dyn Store>,
        keys: &KeySpace,
        ready: Arc<TaskQueue>,
        batch: usize,
    ) -> Self {
        Self {
            store,
            key: keys.delayed(),
            ready,
            batch,
            metrics: MetricsCollector::new(),
        }
    }

    /// Stores a task to run again after `delay`.
    ///
    /// If the task cannot be stored it is sent once, synchronously, rather
    /// than dropped.
    pub async fn schedule(
        &self,
        task: &Task,
        delay: Duration,
    ) -> Result<ScheduleOutcome, QueueError> {
        let execute_at = unix_now() + delay.as_secs_f64();
        let payload = serde_json::to_string(task)?;

        let stored = if self.store.is_available() {
            self.store.zadd(&self.key, &payload, execute_at).await
        } else {
            Err(StoreError::Unavailable)
        };

        match stored {
            Ok(()) => {
                info!(
                    task_id = %task.id,
                    retry = task.retry,
                    delay_secs = delay.as_secs(),
                    "Retry scheduled"
                );
                Ok(ScheduleOutcome::Scheduled { execute_at })
            }
            Err(e) => {
                warn!(
                    task_id = %task.id,
                    error = %e,
                    "Could not schedule retry, sending synchronously"
                );
                self.ready.send_inline(task).await?;
                Ok(ScheduleOutcome::SentInline)
            }
        }
    }

    /// Promotes every entry due by now.
    pub async fn promote_due(&self) -> Result<usize, StoreError> {
        self.promote_until(unix_now()).await
    }

    /// Promotes up to one batch of entries with a score at or below `now`.
    ///
    /// Returns the number of entries this call promoted. Entries moved by a
    /// concurrent caller are skipped.
    ///
    /// # Errors
    ///
    /// Stops at the first store failure. The failing entry, and every entry
    /// after it, stays in the delayed set with its original score.
    pub async fn promote_until(&self, now: f64) -> Result<usize, StoreError> {
        let due = self.store.zrange_by_score(&self.key, now, self.batch).await?;
        let mut promoted = 0;

        for (payload, score) in due {
            let task: Task = match serde_json::from_str(&payload) {
                Ok(task) => task,
                Err(e) => {
                    if self.store.zrem(&self.key, &payload).await? {
                        error!(error = %e, "Discarding malformed delayed entry");
                        self.metrics.record_delivery(DeliveryOutcome::Discarded);
                    }
                    continue;
                }
            };

            match self.store.zrem_lpush(&self.key, &payload, self.ready.key()).await {
                Ok(true) => promoted += 1,
                Ok(false) => debug!(task_id = %task.id, "Delayed entry already promoted elsewhere"),
                Err(e) => {
                    warn!(
                        task_id = %task.id,
                        execute_at = score,
                        error = %e,
                        "Promotion failed, entry left for the next scan"
                    );
                    return Err(e);
                }
            }
        }

        Ok(promoted)
    }

    /// Number of tasks waiting for a retry.
    pub async fn len(&self) -> Result<usize, StoreError> {
        self.store.zcard(&self.key).await
    }

    /// Scans for due entries every `interval` until cancelled.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "Delayed dispatcher started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            match self.promote_due().await {
                Ok(0) => {}
                Ok(promoted) => debug!(promoted = promoted, "Promoted delayed tasks"),
                Err(e) => error!(error = %e, "Delayed dispatch scan failed"),
            }
        }

        info!("Delayed dispatcher stopped");
    }
}
