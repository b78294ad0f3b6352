//! Statistics and dead-letter administration.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::service::MailQueue;
use super::task::FailedEntry;
use crate::error::{QueueError, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Active,
    Disabled,
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueStatus::Active => write!(f, "active"),
            QueueStatus::Disabled => write!(f, "disabled"),
        }
    }
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub status: QueueStatus,
    pub worker_count: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub queue_size: usize,
    pub failed_size: usize,
    pub delayed_size: usize,
    pub processed_total: u64,
    pub failed_total: u64,
}

impl QueueStats {
    /// The shape reported when no store is usable.
    pub fn disabled() -> Self {
        Self {
            status: QueueStatus::Disabled,
            worker_count: 0,
            min_workers: 0,
            max_workers: 0,
            queue_size: 0,
            failed_size: 0,
            delayed_size: 0,
            processed_total: 0,
            failed_total: 0,
        }
    }
}

impl MailQueue {
    /// Current queue statistics.
    ///
    /// Never fails: without a usable store the `disabled` shape is returned,
    /// carrying the in-process counters when the queue has them.
    pub async fn stats(&self) -> QueueStats {
        let Some(backend) = &self.backend else {
            return QueueStats::disabled();
        };

        let counters = &backend.ctx.counters;
        let sizes = async {
            tokio::try_join!(
                backend.ctx.ready.len(),
                backend.ctx.failed.len(),
                backend.ctx.delayed.len()
            )
        };

        let (queue_size, failed_size, delayed_size) = match sizes.await {
            Ok(sizes) if backend.store.is_available() => sizes,
            Ok(_) => {
                return QueueStats {
                    processed_total: counters.processed(),
                    failed_total: counters.failed(),
                    ..QueueStats::disabled()
                }
            }
            Err(e) => {
                warn!(error = %e, "Could not read queue sizes");
                return QueueStats {
                    processed_total: counters.processed(),
                    failed_total: counters.failed(),
                    ..QueueStats::disabled()
                };
            }
        };

        QueueStats {
            status: QueueStatus::Active,
            worker_count: backend.pool.len().await,
            min_workers: backend.pool.min_workers(),
            max_workers: backend.pool.max_workers(),
            queue_size,
            failed_size,
            delayed_size,
            processed_total: counters.processed(),
            failed_total: counters.failed(),
        }
    }

    /// Re-submits every dead-lettered task with its retry count reset.
    ///
    /// Returns how many tasks were re-submitted. Each entry is moved to the
    /// ready list in one atomic step, so it is always in exactly one of the
    /// two lists. An entry that cannot be decoded is dropped.
    ///
    /// # Errors
    ///
    /// - `QueueError::StoreUnavailable` if there is no usable store
    /// - `QueueError::PartialRetry` if the store fails mid-drain, carrying
    ///   the number already moved; the rest stay in the failed list
    pub async fn retry_failed_all(&self) -> Result<usize, QueueError> {
        let Some(backend) = &self.backend else {
            return Err(QueueError::StoreUnavailable);
        };
        if !backend.store.is_available() {
            return Err(QueueError::StoreUnavailable);
        }

        let failed = &backend.ctx.failed;
        let ready_key = backend.ctx.ready.key();
        let mut moved = 0;

        loop {
            let raw = match failed.oldest().await {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(source) => return Err(interrupted(moved, source)),
            };

            let mut entry: FailedEntry = match serde_json::from_str(&raw) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Dropping malformed dead-letter entry");
                    if let Err(source) = failed.drop_oldest(&raw).await {
                        return Err(interrupted(moved, source));
                    }
                    continue;
                }
            };
            entry.task.reset_retries();
            let payload = serde_json::to_string(&entry.task)?;

            match failed.move_oldest(&raw, ready_key, &payload).await {
                Ok(true) => moved += 1,
                Ok(false) => {
                    debug!(task_id = %entry.task.id, "Dead-letter list changed, re-reading")
                }
                Err(source) => return Err(interrupted(moved, source)),
            }
        }

        info!(moved = moved, "Failed mail re-submitted");
        Ok(moved)
    }

    /// Deletes the dead-letter list and returns how many entries it held.
    pub async fn clear_failed_all(&self) -> Result<usize, QueueError> {
        let Some(backend) = &self.backend else {
            return Err(QueueError::StoreUnavailable);
        };

        let cleared = backend.ctx.failed.clear().await?;
        info!(cleared = cleared, "Failed mail cleared");
        Ok(cleared)
    }

    /// Newest dead-letter entries, without removing them.
    pub async fn peek_failed(&self, limit: usize) -> Result<Vec<FailedEntry>, QueueError> {
        let Some(backend) = &self.backend else {
            return Err(QueueError::StoreUnavailable);
        };

        Ok(backend.ctx.failed.peek(limit).await?)
    }
}

fn interrupted(moved: usize, source: StoreError) -> QueueError {
    warn!(moved = moved, error = %source, "Re-submission interrupted");
    QueueError::PartialRetry { moved, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::queue::task::Task;
    use crate::store::testing::FaultyStore;
    use crate::store::{MemoryStore, Store};
    use std::sync::Arc;

    fn config() -> QueueConfig {
        QueueConfig::default()
            .with_key_prefix("t")
            .with_worker_bounds(1, 4)
    }

    async fn seed_failed(store: &MemoryStore, count: usize) {
        for i in 0..count {
            let mut task = Task::new(format!("email_{}", i), "a@x.com", "s", "b", 3);
            task.retry = 3;
            let entry = FailedEntry::new(task, "550", 1);
            store
                .lpush("t:failed", &serde_json::to_string(&entry).unwrap())
                .await
                .unwrap();
        }
    }

    #[test]
    fn test_stats_serialization_shape() {
        let value = serde_json::to_value(QueueStats::disabled()).unwrap();

        assert_eq!(value["status"], "disabled");
        for field in [
            "worker_count",
            "min_workers",
            "max_workers",
            "queue_size",
            "failed_size",
            "processed_total",
            "failed_total",
        ] {
            assert!(value.get(field).is_some(), "missing {}", field);
        }
    }

    #[tokio::test]
    async fn test_stats_disabled_without_store() {
        let queue = MailQueue::new(config(), None);
        let stats = queue.stats().await;

        assert_eq!(stats, QueueStats::disabled());
        assert_eq!(stats.status.to_string(), "disabled");
    }

    #[tokio::test]
    async fn test_stats_disabled_when_store_down() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let queue = MailQueue::new(config(), Some(store));

        assert_eq!(queue.stats().await.status, QueueStatus::Disabled);
    }

    #[tokio::test]
    async fn test_stats_active_reports_sizes() {
        let store = Arc::new(MemoryStore::new());
        seed_failed(&store, 2).await;
        let queue = MailQueue::new(config(), Some(store));
        queue.submit("a@x.com", "s", "b").await.unwrap();

        let stats = queue.stats().await;

        assert_eq!(stats.status, QueueStatus::Active);
        assert_eq!(stats.queue_size, 1);
        assert_eq!(stats.failed_size, 2);
        assert_eq!(stats.min_workers, 1);
        assert_eq!(stats.max_workers, 4);
    }

    #[tokio::test]
    async fn test_retry_failed_all_resets_and_moves() {
        let store = Arc::new(MemoryStore::new());
        seed_failed(&store, 3).await;
        store.lpush("t:failed", "garbage").await.unwrap();
        let queue = MailQueue::new(config(), Some(store.clone()));

        let moved = queue.retry_failed_all().await.unwrap();

        assert_eq!(moved, 3);
        assert_eq!(store.llen("t:failed").await.unwrap(), 0);
        let raw = store.lrange("t:queue", 0, -1).await.unwrap();
        assert_eq!(raw.len(), 3);
        for payload in raw {
            let task: Task = serde_json::from_str(&payload).unwrap();
            assert_eq!(task.retry, 0);
        }
    }

    #[tokio::test]
    async fn test_interrupted_retry_keeps_remaining_entries() {
        let store = Arc::new(FaultyStore::new());
        for i in 0..3 {
            let task = Task::new(format!("email_{}", i), "a@x.com", "s", "b", 3);
            let entry = FailedEntry::new(task, "550", 1);
            store
                .lpush("t:failed", &serde_json::to_string(&entry).unwrap())
                .await
                .unwrap();
        }
        let queue = MailQueue::new(config(), Some(store.clone()));

        store.fail_after("rpop_lpush_if", 1);
        let result = queue.retry_failed_all().await;

        assert!(matches!(result, Err(QueueError::PartialRetry { moved: 1, .. })));
        assert_eq!(store.llen("t:queue").await.unwrap(), 1);
        assert_eq!(store.llen("t:failed").await.unwrap(), 2);

        store.heal("rpop_lpush_if");
        assert_eq!(queue.retry_failed_all().await.unwrap(), 2);
        assert_eq!(store.llen("t:queue").await.unwrap(), 3);
        assert_eq!(store.llen("t:failed").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retry_read_failure_moves_nothing() {
        let store = Arc::new(FaultyStore::new());
        let entry = FailedEntry::new(Task::new("email_1", "a@x.com", "s", "b", 3), "550", 1);
        store
            .lpush("t:failed", &serde_json::to_string(&entry).unwrap())
            .await
            .unwrap();
        let queue = MailQueue::new(config(), Some(store.clone()));

        store.fail("lrange");
        let result = queue.retry_failed_all().await;

        assert!(matches!(result, Err(QueueError::PartialRetry { moved: 0, .. })));
        assert_eq!(store.llen("t:failed").await.unwrap(), 1);
        assert_eq!(store.llen("t:queue").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clear_and_peek() {
        let store = Arc::new(MemoryStore::new());
        seed_failed(&store, 4).await;
        let queue = MailQueue::new(config(), Some(store.clone()));

        let peeked = queue.peek_failed(2).await.unwrap();
        assert_eq!(peeked.len(), 2);
        assert_eq!(peeked[0].task.id, "email_3");

        assert_eq!(queue.clear_failed_all().await.unwrap(), 4);
        assert_eq!(queue.stats().await.failed_size, 0);
    }

    #[tokio::test]
    async fn test_admin_ops_need_a_store() {
        let queue = MailQueue::new(config(), None);

        assert!(matches!(
            queue.retry_failed_all().await,
            Err(QueueError::StoreUnavailable)
        ));
        assert!(matches!(
            queue.clear_failed_all().await,
            Err(QueueError::StoreUnavailable)
        ));
    }
}
