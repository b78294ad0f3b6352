//! Dead-letter list for tasks that exhausted their retries.
//!
//! Entries leave the list only through compare-and-move operations on the
//! oldest entry, so a re-submission is never half done.

use std::sync::Arc;

use tracing::warn;

use super::task::FailedEntry;
use crate::error::{QueueError, StoreError};
use crate::store::{KeySpace, Store};

pub struct FailedQueue {
    store: Arc<dyn Store>,
    key: String,
}

impl FailedQueue {
    pub fn new(store: Arc<dyn Store>, keys: &KeySpace) -> Self {
        Self {
            store,
            key: keys.failed(),
        }
    }

    /// Archives an entry.
    pub async fn append(&self, entry: &FailedEntry) -> Result<(), QueueError> {
        let payload = serde_json::to_string(entry)?;
        self.store.lpush(&self.key, &payload).await?;
        Ok(())
    }

    /// Reads the oldest raw entry without removing it.
    pub async fn oldest(&self) -> Result<Option<String>, StoreError> {
        Ok(self.store.lrange(&self.key, -1, -1).await?.pop())
    }

    /// Atomically replaces the oldest entry, if it is still `expected`, with
    /// `payload` at the head of the list `to`.
    pub async fn move_oldest(
        &self,
        expected: &str,
        to: &str,
        payload: &str,
    ) -> Result<bool, StoreError> {
        self.store
            .rpop_lpush_if(&self.key, expected, Some((to, payload)))
            .await
    }

    /// Removes the oldest entry if it is still `expected`.
    pub async fn drop_oldest(&self, expected: &str) -> Result<bool, StoreError> {
        self.store.rpop_lpush_if(&self.key, expected, None).await
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        self.store.llen(&self.key).await
    }

    /// Deletes the whole list and returns how many entries it held.
    ///
    /// Best effort: an entry appended between the length read and the
    /// delete is removed but not counted.
    pub async fn clear(&self) -> Result<usize, StoreError> {
        let count = self.store.llen(&self.key).await?;
        self.store.del(&self.key).await?;
        Ok(count)
    }

    /// Reads up to `limit` of the newest entries without removing them.
    ///
    /// Entries that fail to decode are skipped with a warning.
    pub async fn peek(&self, limit: usize) -> Result<Vec<FailedEntry>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let raw = self.store.lrange(&self.key, 0, limit as isize - 1).await?;
        Ok(raw
            .iter()
            .filter_map(|s| match serde_json::from_str(s) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed dead-letter entry");
                    None
                }
            })
            .collect())
    }
}
