//! Mail transport seam.
//!
//! The queue never talks SMTP itself. Delivery goes through a [`Transport`]
//! supplied by the host application; until one is installed, [`LogTransport`]
//! records each message and reports success.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use crate::error::TransportError;

/// Sends a single message.
///
/// Implementations have no visibility into retry state; a returned error is
/// all the queue needs to decide between a delayed retry and the dead-letter
/// list.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), TransportError>;
}

/// Default transport: logs the message and succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), TransportError> {
        debug!(
            to = %to,
            subject = %subject,
            body_len = body.len(),
            "No mail transport configured, message logged only"
        );
        Ok(())
    }
}

/// Swappable handle to the active transport.
///
/// Replacing the transport affects the next send. Sends already in flight
/// hold their own `Arc` and finish on the transport they started with.
#[derive(Clone)]
pub struct SharedTransport {
    inner: Arc<RwLock<Arc<dyn Transport>>>,
}

impl Default for SharedTransport {
    fn default() -> Self {
        Self::new(Arc::new(LogTransport))
    }
}

impl SharedTransport {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(transport)),
        }
    }

    /// Returns the transport to use for the next send.
    pub fn current(&self) -> Arc<dyn Transport> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    /// Installs a new transport.
    pub fn replace(&self, transport: Arc<dyn Transport>) {
        match self.inner.write() {
            Ok(mut guard) => *guard = transport,
            Err(poisoned) => *poisoned.into_inner() = transport,
        }
    }

    /// Sends through the current transport.
    pub async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), TransportError> {
        let transport = self.current();
        transport.send(to, subject, body).await
    }
}
