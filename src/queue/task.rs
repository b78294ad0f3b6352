//! Task definitions for the mail queue.
//!
//! - `Task`: one message waiting for delivery, as stored in the ready list
//!   and the delayed set
//! - `FailedEntry`: a task that exhausted its retries, as stored in the
//!   dead-letter list

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single outbound message and its retry state.
///
/// The JSON field names are the wire format shared with other producers
/// and consumers of the same store keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Unique task identifier (`email_<uuid>`).
    pub id: String,
    /// Recipient address, or several joined with `;`.
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Failed attempts so far.
    pub retry: u32,
    /// Retries allowed before the task is dead-lettered.
    pub max_retry: u32,
    /// When the task was submitted.
    #[serde(rename = "create_at")]
    pub created_at: DateTime<Utc>,
    /// Truncated content fingerprint.
    pub content_hash: String,
    /// Store key of the content fingerprint marker.
    pub dedupe_key: String,
}

impl Task {
    /// Creates a fresh task with no failed attempts.
    pub fn new(
        id: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        max_retry: u32,
    ) -> Self {
        Self {
            id: id.into(),
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
            retry: 0,
            max_retry,
            created_at: Utc::now(),
            content_hash: String::new(),
            dedupe_key: String::new(),
        }
    }

    /// Attaches the dedupe fingerprint and its marker key.
    pub fn with_dedupe(
        mut self,
        content_hash: impl Into<String>,
        dedupe_key: impl Into<String>,
    ) -> Self {
        self.content_hash = content_hash.into();
        self.dedupe_key = dedupe_key.into();
        self
    }

    /// Records a failed attempt.
    ///
    /// Returns `true` and bumps the retry count when the task may be tried
    /// again; returns `false` once `retry == max_retry`, leaving the count
    /// untouched so the task never exceeds its ceiling.
    pub fn record_failure(&mut self) -> bool {
        if self.retry < self.max_retry {
            self.retry += 1;
            true
        } else {
            false
        }
    }

    /// Linear backoff: `retry * base`.
    pub fn retry_delay(&self, base: Duration) -> Duration {
        base * self.retry
    }

    /// Clears the retry count for a manual replay.
    pub fn reset_retries(&mut self) {
        self.retry = 0;
    }
}

/// Dead-letter record for a task that exhausted its retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedEntry {
    pub task: Task,
    /// Error returned by the last delivery attempt.
    pub error: String,
    pub failed_at: DateTime<Utc>,
    /// Worker that made the last attempt.
    pub worker_id: u64,
}

impl FailedEntry {
    pub fn new(task: Task, error: impl Into<String>, worker_id: u64) -> Self {
        Self {
            task,
            error: error.into(),
            failed_at: Utc::now(),
            worker_id,
        }
    }
}
