//! Mail delivery queue.
//!
//! This module provides a persistent, self-scaling email queue:
//!
//! - `MailQueue`: façade used by producers and admin code
//! - `Deduplicator`: content and per-task markers against double delivery
//! - `TaskQueue`: durable FIFO of ready tasks with a synchronous fallback
//! - `DelayedQueue`: retries scheduled by execution time, plus the dispatcher
//! - `FailedQueue`: dead-letter list
//! - `Worker` / `WorkerPool` / `ScalingMonitor`: delivery workers and the
//!   load-driven pool that owns them
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use mailqueue::{MailQueue, QueueConfig, RedisStore};
//!
//! let store = RedisStore::connect("redis://localhost:6379").await?;
//! let queue = MailQueue::new(QueueConfig::default(), Some(Arc::new(store)));
//! queue.start().await;
//!
//! queue.submit("reader@example.com", "New comment", "Someone replied").await?;
//!
//! queue.shutdown().await?;
//! ```

pub mod admin;
pub mod dedupe;
pub mod delayed;
pub mod failed;
pub mod pool;
pub mod scaling;
pub mod service;
pub mod task;
pub mod task_queue;
pub mod worker;

pub use admin::{QueueStats, QueueStatus};
pub use dedupe::{fingerprint, Admission, Deduplicator};
pub use delayed::{DelayedQueue, ScheduleOutcome};
pub use failed::FailedQueue;
pub use pool::WorkerPool;
pub use scaling::{ScaleAction, ScalingMonitor};
pub use service::{MailQueue, SubmitOutcome};
pub use task::{FailedEntry, Task};
pub use task_queue::{PushOutcome, TaskQueue};
pub use worker::{
    DeliveryCounters, SharedWorkerState, StepOutcome, Worker, WorkerContext, WorkerState,
};
