//! Worker pool with a bounded, mutable set of workers.
//!
//! The pool owns a single map of live workers behind one lock and enforces
//! `min_workers <= len <= max_workers` on every mutation. Each worker gets a
//! child token of the pool's root token, so stopping one worker cancels only
//! that worker while shutting down the pool cancels all of them.
//!
//! The lock is never held across a store call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::worker::{SharedWorkerState, Worker, WorkerContext};
use crate::error::QueueError;
use crate::metrics::MetricsCollector;

struct WorkerEntry {
    state: SharedWorkerState,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Registry {
    workers: HashMap<u64, WorkerEntry>,
    id_counter: u64,
}

impl Registry {
    /// Honours the requested id when it is free, otherwise hands out the
    /// next unused one. Requested ids are advisory.
    fn assign_id(&mut self, requested: Option<u64>) -> u64 {
        if let Some(id) = requested {
            if !self.workers.contains_key(&id) {
                self.id_counter = self.id_counter.max(id);
                return id;
            }
        }
        loop {
            self.id_counter += 1;
            if !self.workers.contains_key(&self.id_counter) {
                return self.id_counter;
            }
        }
    }
}

pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
    min_workers: usize,
    max_workers: usize,
    registry: RwLock<Registry>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    root: CancellationToken,
    metrics: MetricsCollector,
}

impl WorkerPool {
    pub fn new(ctx: Arc<WorkerContext>, root: CancellationToken) -> Self {
        Self {
            min_workers: ctx.config.min_workers,
            max_workers: ctx.config.max_workers,
            ctx,
            registry: RwLock::new(Registry::default()),
            handles: Mutex::new(Vec::new()),
            root,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn min_workers(&self) -> usize {
        self.min_workers
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Starts workers until the floor is reached.
    pub async fn start(&self) -> usize {
        let mut started = 0;
        while self.len().await < self.min_workers {
            if self.start_worker(None).await.is_none() {
                break;
            }
            started += 1;
        }
        info!(workers = started, "Worker pool started");
        started
    }

    /// Starts one worker. Returns its id, or `None` at the ceiling or after
    /// shutdown.
    pub async fn start_worker(&self, requested: Option<u64>) -> Option<u64> {
        if self.root.is_cancelled() {
            return None;
        }

        let mut registry = self.registry.write().await;
        if registry.workers.len() >= self.max_workers {
            debug!(max_workers = self.max_workers, "Worker ceiling reached");
            return None;
        }

        let id = registry.assign_id(requested);
        let state = SharedWorkerState::default();
        let cancel = self.root.child_token();
        let worker = Worker::new(id, Arc::clone(&self.ctx), state.clone(), cancel.clone());

        registry.workers.insert(id, WorkerEntry { state, cancel });
        let count = registry.workers.len();
        drop(registry);

        let handle = tokio::spawn(worker.run());
        {
            let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
            handles.retain(|h| !h.is_finished());
            handles.push(handle);
        }

        self.metrics.update_workers(count);
        info!(worker_id = id, workers = count, "Worker added");
        Some(id)
    }

    /// Stops one worker. Refused when the pool is at its floor or the id is
    /// unknown.
    ///
    /// The worker finishes the task it is handling and exits on its own.
    pub async fn stop_worker(&self, id: u64) -> bool {
        let mut registry = self.registry.write().await;
        if registry.workers.len() <= self.min_workers {
            debug!(min_workers = self.min_workers, "Worker floor reached");
            return false;
        }

        let Some(entry) = registry.workers.remove(&id) else {
            return false;
        };
        entry.cancel.cancel();
        let count = registry.workers.len();
        drop(registry);

        self.metrics.update_workers(count);
        info!(worker_id = id, workers = count, "Worker removed");
        true
    }

    /// Number of live workers.
    pub async fn len(&self) -> usize {
        self.registry.read().await.workers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Ids of live workers, ascending.
    pub async fn worker_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.registry.read().await.workers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// The non-busy worker that has been idle the longest, with its last
    /// activity time.
    pub async fn longest_idle(&self) -> Option<(u64, Instant)> {
        let registry = self.registry.read().await;
        registry
            .workers
            .iter()
            .map(|(id, entry)| (*id, entry.state.snapshot()))
            .filter(|(_, state)| !state.busy)
            .min_by_key(|(_, state)| state.last_active)
            .map(|(id, state)| (id, state.last_active))
    }

    /// Cancels every worker and waits up to `timeout` for them to exit.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), QueueError> {
        self.root.cancel();
        self.registry.write().await.workers.clear();
        self.metrics.update_workers(0);

        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
            guard.drain(..).collect()
        };

        match tokio::time::timeout(timeout, futures::future::join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(error = %e, "Worker task panicked during shutdown");
                    }
                }
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "Worker pool shutdown timed out");
                Err(QueueError::ShutdownTimeout(timeout))
            }
        }
    }
}
