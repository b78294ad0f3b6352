//! Durable store abstraction backing the mail queue.
//!
//! The queue needs a small set of key/value primitives: a FIFO list, a
//! score-ordered set, and string keys with a TTL and atomic set-if-absent.
//! [`Store`] captures exactly those; two implementations are provided:
//!
//! - [`RedisStore`]: production backend on a Redis `ConnectionManager`
//! - [`MemoryStore`]: in-process backend with identical semantics, used in
//!   tests and for running without Redis
//!
//! # Key layout
//!
//! ```text
//! {prefix}:queue                      list, ready tasks (LPUSH / BRPOP)
//! {prefix}:failed                     list, dead-letter entries
//! {prefix}:delayed                    sorted set, score = unix execute time
//! {prefix}:sent:task:{id}             string, processing/sent marker
//! {prefix}:dedupe:{date}:{hash}       string, content fingerprint marker
//! ```

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

pub mod keys;
pub mod memory;
pub mod redis_store;
#[cfg(test)]
pub(crate) mod testing;

pub use self::keys::KeySpace;
pub use self::memory::MemoryStore;
pub use self::redis_store::{PersistenceReport, RedisStore};

/// Key/value primitives required by the queue.
///
/// Lists are pushed at the head and popped from the tail, giving FIFO order.
#[async_trait]
pub trait Store: Send + Sync {
    /// Last known availability; does not touch the network.
    fn is_available(&self) -> bool;

    /// Pushes a value onto the head of a list.
    async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Pops from the tail of a list, waiting up to `timeout` for a value.
    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError>;

    /// Returns the length of a list.
    async fn llen(&self, key: &str) -> Result<usize, StoreError>;

    /// Returns list elements between `start` and `stop` inclusive, head first.
    async fn lrange(&self, key: &str, start: isize, stop: isize)
        -> Result<Vec<String>, StoreError>;

    /// Deletes a key of any type.
    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Adds or re-scores a member of a sorted set.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// Returns up to `limit` members with score <= `max`, lowest score first.
    async fn zrange_by_score(
        &self,
        key: &str,
        max: f64,
        limit: usize,
    ) -> Result<Vec<(String, f64)>, StoreError>;

    /// Removes a member; returns whether it was present.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Atomically removes `member` from the sorted set `from` and pushes it
    /// onto the head of the list `to`.
    ///
    /// Returns `false`, changing nothing, when the member was already gone.
    async fn zrem_lpush(&self, from: &str, member: &str, to: &str) -> Result<bool, StoreError>;

    /// Atomically pops the tail of the list `from` if it equals `expected`,
    /// then pushes `value` onto the head of list `to` when `push` is
    /// `Some((to, value))`.
    ///
    /// Returns `false`, changing nothing, when the tail differs.
    async fn rpop_lpush_if(
        &self,
        from: &str,
        expected: &str,
        push: Option<(&str, &str)>,
    ) -> Result<bool, StoreError>;

    /// Returns the cardinality of a sorted set.
    async fn zcard(&self, key: &str) -> Result<usize, StoreError>;

    /// Reads a string key.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Returns whether a key exists.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Sets a string key with a TTL, overwriting any previous value.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Sets a string key with a TTL only if it does not exist; returns whether it was set.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;
}
