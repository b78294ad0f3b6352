//! The mail queue façade.
//!
//! [`MailQueue`] is constructed once at startup and shared by handle with
//! producers and admin code. It wires the ready list, delayed set,
//! dead-letter list, deduplicator and worker pool over one store, and owns
//! the lifecycle of the background tasks:
//!
//! - one task per live worker
//! - the delayed-queue dispatcher
//! - the scaling monitor
//!
//! Constructed without a store, the queue is disabled: every submission is
//! sent synchronously and stats report `disabled`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::dedupe::Admission;
use super::pool::WorkerPool;
use super::scaling::ScalingMonitor;
use super::task::Task;
use super::task_queue::PushOutcome;
use super::worker::WorkerContext;
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::metrics::{DeliveryOutcome, MetricsCollector};
use crate::store::Store;
use crate::transport::{SharedTransport, Transport};

/// What `submit` did with a message. All three are successes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Appended to the ready list for a worker to deliver.
    Queued,
    /// Identical content was already accepted within the dedupe window.
    Duplicate,
    /// Delivered synchronously because the store was unavailable.
    SentInline,
}

/// Store-backed parts of an enabled queue.
pub(super) struct Backend {
    pub(super) store: Arc<dyn Store>,
    pub(super) ctx: Arc<WorkerContext>,
    pub(super) pool: Arc<WorkerPool>,
}

pub struct MailQueue {
    pub(super) config: QueueConfig,
    transport: SharedTransport,
    pub(super) backend: Option<Backend>,
    root: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    metrics: MetricsCollector,
}

impl MailQueue {
    /// Creates a queue over `store`, or a disabled queue when `store` is
    /// `None`. Nothing runs until [`start`](Self::start).
    pub fn new(config: QueueConfig, store: Option<Arc<dyn Store>>) -> Self {
        let transport = SharedTransport::default();
        let root = CancellationToken::new();

        let backend = store.map(|store| {
            let ctx = Arc::new(WorkerContext::new(
                Arc::clone(&store),
                config.clone(),
                transport.clone(),
            ));
            let pool = Arc::new(WorkerPool::new(Arc::clone(&ctx), root.child_token()));
            Backend { store, ctx, pool }
        });

        Self {
            config,
            transport,
            backend,
            root,
            background: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            metrics: MetricsCollector::new(),
        }
    }

    /// Whether the queue has a store behind it.
    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Replaces the mail transport. Takes effect for the next send.
    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        self.transport.replace(transport);
        info!("Mail transport replaced");
    }

    /// Starts the floor of workers, the dispatcher and the monitor.
    ///
    /// Calling it again, or on a disabled queue, does nothing.
    pub async fn start(&self) {
        let Some(backend) = &self.backend else {
            info!("Mail queue disabled, messages will be sent synchronously");
            return;
        };
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        backend.pool.start().await;

        let dispatcher = tokio::spawn(
            Arc::clone(&backend.ctx.delayed)
                .run(self.config.dispatch_interval, self.root.child_token()),
        );
        let monitor = ScalingMonitor::new(Arc::clone(&backend.pool), Arc::clone(&backend.ctx));
        let monitor =
            tokio::spawn(monitor.run(self.config.scale_interval, self.root.child_token()));

        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([dispatcher, monitor]);

        info!(
            min_workers = self.config.min_workers,
            max_workers = self.config.max_workers,
            scale_up_threshold = self.config.scale_up_threshold,
            scale_down_threshold = self.config.scale_down_threshold,
            "Mail queue started"
        );
    }

    /// Submits a message for delivery.
    ///
    /// Duplicates within the dedupe window are dropped quietly. When the
    /// store is missing or failing the message is sent synchronously.
    ///
    /// # Errors
    ///
    /// - `QueueError::Serialization` if the task cannot be encoded
    /// - `QueueError::Transport` if a synchronous send fails
    pub async fn submit(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<SubmitOutcome, QueueError> {
        let Some(backend) = &self.backend else {
            return self.send_direct(to, subject, body).await;
        };
        if !backend.store.is_available() {
            warn!(to = %to, "Store unavailable, sending synchronously");
            return self.send_direct(to, subject, body).await;
        }

        let admission = match backend.ctx.dedupe.should_accept(to, subject, body).await {
            Ok(admission) => admission,
            Err(e) => {
                warn!(to = %to, error = %e, "Dedupe check failed, sending synchronously");
                return self.send_direct(to, subject, body).await;
            }
        };

        let Admission::Accept {
            task_id,
            content_hash,
            dedupe_key,
        } = admission
        else {
            return Ok(SubmitOutcome::Duplicate);
        };

        let task = Task::new(task_id, to, subject, body, self.config.max_retry)
            .with_dedupe(content_hash, dedupe_key);

        match backend.ctx.ready.push(&task).await? {
            PushOutcome::Queued => {
                info!(task_id = %task.id, to = %to, "Mail queued");
                Ok(SubmitOutcome::Queued)
            }
            PushOutcome::SentInline => Ok(SubmitOutcome::SentInline),
        }
    }

    /// Sends one message to a `;`-separated recipient list.
    ///
    /// Empty entries are dropped; with no recipients left nothing is sent
    /// and `None` is returned.
    pub async fn notify(
        &self,
        recipients: &str,
        subject: &str,
        body: &str,
    ) -> Result<Option<SubmitOutcome>, QueueError> {
        let to: Vec<&str> = recipients
            .split(';')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .collect();
        if to.is_empty() {
            return Ok(None);
        }

        self.submit(&to.join(";"), subject, body).await.map(Some)
    }

    async fn send_direct(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<SubmitOutcome, QueueError> {
        let started = Instant::now();
        let result = self.transport.send(to, subject, body).await;
        self.metrics.observe_send(started.elapsed());

        if let Err(e) = result {
            error!(to = %to, error = %e, "Synchronous send failed");
            return Err(e.into());
        }
        self.metrics.record_delivery(DeliveryOutcome::Inline);
        Ok(SubmitOutcome::SentInline)
    }

    /// Number of live workers; zero when disabled.
    pub async fn worker_count(&self) -> usize {
        match &self.backend {
            Some(backend) => backend.pool.len().await,
            None => 0,
        }
    }

    /// Cancels every background task and waits up to the shutdown timeout.
    ///
    /// On timeout the error is logged and returned; the tasks are left to
    /// finish on their own.
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        info!("Stopping mail queue");
        self.root.cancel();

        let Some(backend) = &self.backend else {
            return Ok(());
        };

        let timeout = self.config.shutdown_timeout;
        let deadline = tokio::time::Instant::now() + timeout;

        let background: Vec<JoinHandle<()>> = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        let pool_result = backend.pool.shutdown(timeout).await;
        let background_result =
            tokio::time::timeout_at(deadline, futures::future::join_all(background)).await;

        match (pool_result, background_result) {
            (Ok(()), Ok(_)) => {
                info!("Mail queue stopped");
                Ok(())
            }
            _ => {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "Mail queue stop timed out, exiting anyway"
                );
                Err(QueueError::ShutdownTimeout(timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct Counting {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl Transport for Counting {
        async fn send(&self, _to: &str, _subject: &str, _body: &str) -> Result<(), TransportError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config() -> QueueConfig {
        QueueConfig::default()
            .with_key_prefix("t")
            .with_worker_bounds(1, 2)
            .with_fetch_timeout(Duration::from_millis(50))
            .with_shutdown_timeout(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_disabled_queue_sends_inline() {
        let queue = MailQueue::new(config(), None);
        let counting = Arc::new(Counting::default());
        queue.set_transport(counting.clone());

        queue.start().await;
        let outcome = queue.submit("a@x.com", "hi", "body").await.unwrap();

        assert!(!queue.is_enabled());
        assert_eq!(outcome, SubmitOutcome::SentInline);
        assert_eq!(counting.sent.load(Ordering::SeqCst), 1);
        assert_eq!(queue.worker_count().await, 0);
        assert!(queue.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn test_submit_queues_then_suppresses_duplicate() {
        let store = Arc::new(MemoryStore::new());
        let queue = MailQueue::new(config(), Some(store.clone()));

        let first = queue.submit("a@x.com", "hi", "body").await.unwrap();
        let second = queue.submit("a@x.com", "hi", "body").await.unwrap();

        assert_eq!(first, SubmitOutcome::Queued);
        assert_eq!(second, SubmitOutcome::Duplicate);
        assert_eq!(store.llen("t:queue").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_sends_inline() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let queue = MailQueue::new(config(), Some(store));
        let counting = Arc::new(Counting::default());
        queue.set_transport(counting.clone());

        let outcome = queue.submit("a@x.com", "hi", "body").await.unwrap();

        assert_eq!(outcome, SubmitOutcome::SentInline);
        assert_eq!(counting.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_notify_joins_recipients() {
        let store = Arc::new(MemoryStore::new());
        let queue = MailQueue::new(config(), Some(store.clone()));

        assert_eq!(queue.notify(" ; ;", "s", "b").await.unwrap(), None);

        let outcome = queue.notify("a@x.com;;b@y.org;", "s", "b").await.unwrap();
        assert_eq!(outcome, Some(SubmitOutcome::Queued));

        let raw = store.lrange("t:queue", 0, 0).await.unwrap();
        let task: Task = serde_json::from_str(&raw[0]).unwrap();
        assert_eq!(task.to, "a@x.com;b@y.org");
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_shutdown_is_clean() {
        let queue = MailQueue::new(config(), Some(Arc::new(MemoryStore::new())));

        queue.start().await;
        queue.start().await;

        assert_eq!(queue.worker_count().await, 1);
        assert!(queue.shutdown().await.is_ok());
        assert_eq!(queue.worker_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_reports_timeout_when_delivery_hangs() {
        struct Hanging {
            entered: tokio::sync::Notify,
        }

        #[async_trait]
        impl Transport for Hanging {
            async fn send(&self, _: &str, _: &str, _: &str) -> Result<(), TransportError> {
                self.entered.notify_one();
                std::future::pending::<()>().await;
                Ok(())
            }
        }

        let config = config().with_shutdown_timeout(Duration::from_millis(500));
        let queue = MailQueue::new(config, Some(Arc::new(MemoryStore::new())));
        let hanging = Arc::new(Hanging {
            entered: tokio::sync::Notify::new(),
        });
        queue.set_transport(hanging.clone());

        queue.submit("a@x.com", "s", "b").await.unwrap();
        queue.start().await;
        hanging.entered.notified().await;

        let result = queue.shutdown().await;
        assert!(matches!(result, Err(QueueError::ShutdownTimeout(_))));
        assert_eq!(queue.worker_count().await, 0);
    }
}
