//! Submission and delivery deduplication.
//!
//! Two markers guard against double delivery:
//!
//! - a content marker keyed by the day and a fingerprint of
//!   `(to, subject, body)`, claimed atomically at submission and extended to
//!   the full dedupe window once the message is delivered
//! - a per-task marker, `processing` while the task is in flight and `sent`
//!   after delivery, which lets a worker skip a task another worker already
//!   completed

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use super::task::Task;
use crate::config::QueueConfig;
use crate::error::StoreError;
use crate::store::{KeySpace, Store};

const FINGERPRINT_LEN: usize = 16;
const MARKER_PROCESSING: &str = "processing";
const MARKER_SENT: &str = "sent";

/// Result of a submission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The message is new; build the task from these identifiers.
    Accept {
        task_id: String,
        content_hash: String,
        dedupe_key: String,
    },
    /// Identical content was already accepted within the window.
    Duplicate { dedupe_key: String },
}

/// Truncated hex SHA-256 of `to:subject:body`.
pub fn fingerprint(to: &str, subject: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}:{}", to, subject, body).as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(FINGERPRINT_LEN);
    digest
}

/// Gatekeeper for submissions and deliveries.
pub struct Deduplicator {
    store: Arc<dyn Store>,
    keys: KeySpace,
    window: Duration,
    processing_ttl: Duration,
    sent_ttl: Duration,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn Store>, config: &QueueConfig) -> Self {
        Self {
            store,
            keys: KeySpace::new(config.key_prefix.clone()),
            window: config.dedupe_window,
            processing_ttl: config.processing_ttl,
            sent_ttl: config.sent_ttl,
        }
    }

    /// Decides whether a message should be queued.
    ///
    /// A duplicate is not an error; callers report it as a quiet success.
    pub async fn should_accept(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<Admission, StoreError> {
        let content_hash = fingerprint(to, subject, body);
        let date = Utc::now().format("%Y-%m-%d").to_string();
        let dedupe_key = self.keys.dedupe(&date, &content_hash);

        let claimed = self
            .store
            .set_nx_ex(&dedupe_key, MARKER_PROCESSING, self.processing_ttl)
            .await?;
        if !claimed {
            info!(to = %to, dedupe_key = %dedupe_key, "Duplicate message suppressed");
            return Ok(Admission::Duplicate { dedupe_key });
        }

        let task_id = format!("email_{}", Uuid::new_v4());
        let marked = self
            .store
            .set_nx_ex(
                &self.keys.sent_task(&task_id),
                MARKER_PROCESSING,
                self.processing_ttl,
            )
            .await?;
        if !marked {
            info!(task_id = %task_id, "Task already in flight");
            return Ok(Admission::Duplicate { dedupe_key });
        }

        debug!(task_id = %task_id, content_hash = %content_hash, "Message admitted");
        Ok(Admission::Accept {
            task_id,
            content_hash,
            dedupe_key,
        })
    }

    /// Returns whether the task was already delivered.
    ///
    /// The `processing` marker set at submission does not count; only a
    /// completed delivery does.
    pub async fn already_delivered(&self, task: &Task) -> Result<bool, StoreError> {
        let marker = self.store.get(&self.keys.sent_task(&task.id)).await?;
        Ok(marker.as_deref() == Some(MARKER_SENT))
    }

    /// Records a successful delivery.
    ///
    /// Overwrites the task marker with `sent` and extends the content marker
    /// to the full dedupe window.
    pub async fn mark_sent(&self, task: &Task) -> Result<(), StoreError> {
        self.store
            .set_ex(&self.keys.sent_task(&task.id), MARKER_SENT, self.sent_ttl)
            .await?;
        if !task.dedupe_key.is_empty() {
            self.store
                .set_ex(&task.dedupe_key, MARKER_SENT, self.window)
                .await?;
        }
        Ok(())
    }
}
