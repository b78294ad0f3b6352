//! mailqueue: persistent, self-scaling email delivery queue.
//!
//! This library provides a Redis-backed mail queue with content
//! deduplication, delayed retries, a dead-letter list and a worker pool that
//! grows and shrinks with queue depth.

pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod store;
pub mod transport;

pub use config::QueueConfig;
pub use error::{ConfigError, QueueError, StoreError, TransportError};
pub use queue::{FailedEntry, MailQueue, QueueStats, QueueStatus, SubmitOutcome, Task};
pub use store::{MemoryStore, RedisStore, Store};
pub use transport::{LogTransport, SharedTransport, Transport};
