//! Durable FIFO of ready tasks.
//!
//! Tasks are pushed at the head of the `queue` list and popped from the tail.
//! When the store cannot take a task, the task is delivered synchronously
//! instead, so a store outage costs latency but never loses a message.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, warn};

use super::task::Task;
use crate::error::{QueueError, StoreError};
use crate::metrics::{DeliveryOutcome, MetricsCollector};
use crate::store::{KeySpace, Store};
use crate::transport::SharedTransport;

/// What happened to a pushed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Appended to the ready list.
    Queued,
    /// Delivered in-line because the store was unavailable.
    SentInline,
}

pub struct TaskQueue {
    store: Arc<dyn Store>,
    key: String,
    transport: SharedTransport,
    metrics: MetricsCollector,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn Store>, keys: &KeySpace, transport: SharedTransport) -> Self {
        Self {
            store,
            key: keys.queue(),
            transport,
            metrics: MetricsCollector::new(),
        }
    }

    /// Store key of the ready list.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Appends a task, falling back to a synchronous send.
    ///
    /// # Errors
    ///
    /// - `QueueError::Serialization` if the task cannot be encoded
    /// - `QueueError::Transport` if the fallback send fails
    pub async fn push(&self, task: &Task) -> Result<PushOutcome, QueueError> {
        if !self.store.is_available() {
            warn!(task_id = %task.id, "Store unavailable, sending synchronously");
            return self.send_inline(task).await;
        }

        let payload = serde_json::to_string(task)?;
        match self.store.lpush(&self.key, &payload).await {
            Ok(()) => Ok(PushOutcome::Queued),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Enqueue failed, sending synchronously");
                self.send_inline(task).await
            }
        }
    }

    /// Delivers a task immediately through the current transport.
    pub async fn send_inline(&self, task: &Task) -> Result<PushOutcome, QueueError> {
        let started = Instant::now();
        let result = self.transport.send(&task.to, &task.subject, &task.body).await;
        self.metrics.observe_send(started.elapsed());

        match result {
            Ok(()) => {
                self.metrics.record_delivery(DeliveryOutcome::Inline);
                Ok(PushOutcome::SentInline)
            }
            Err(e) => {
                error!(task_id = %task.id, to = %task.to, error = %e, "Synchronous send failed");
                Err(e.into())
            }
        }
    }

    /// Pops the oldest raw payload, waiting up to `timeout`.
    ///
    /// Decoding is left to the caller so a malformed entry can be discarded
    /// without being mistaken for a store failure.
    pub async fn pop(&self, timeout: Duration) -> Result<Option<String>, StoreError> {
        self.store.brpop(&self.key, timeout).await
    }

    /// Number of ready tasks.
    pub async fn len(&self) -> Result<usize, StoreError> {
        self.store.llen(&self.key).await
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }
}
