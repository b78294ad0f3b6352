//! Error types for mailqueue operations.
//!
//! Defines the error types for each subsystem:
//! - Durable store access (Redis or in-memory)
//! - Mail transport (the injected send function)
//! - Queue operations (submit, retry, admin)
//! - Configuration loading and validation

use std::time::Duration;

use thiserror::Error;

/// Errors raised by a [`Store`](crate::store::Store) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store is unavailable")]
    Unavailable,

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Errors returned by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Mail delivery failed: {0}")]
    Failed(String),
}

impl TransportError {
    /// Convenience constructor used by transport implementations.
    pub fn failed(message: impl Into<String>) -> Self {
        TransportError::Failed(message.into())
    }
}

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue store is unavailable")]
    StoreUnavailable,

    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),

    #[error("Task serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Synchronous delivery failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Retry of failed tasks interrupted after {moved} re-submissions: {source}")]
    PartialRetry {
        moved: usize,
        #[source]
        source: StoreError,
    },

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
