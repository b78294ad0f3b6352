//! Load-driven pool scaling.
//!
//! Every tick the monitor reads the ready-queue depth and applies at most
//! one change:
//!
//! - depth above the scale-up threshold and below the ceiling: add a worker
//! - depth below the scale-down threshold and above the floor: remove the
//!   longest-idle worker, provided it has been idle past the idle timeout
//!
//! One change per tick keeps bursts from spawning a herd of workers and the
//! idle timeout keeps the pool from flapping.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pool::WorkerPool;
use super::worker::WorkerContext;
use crate::metrics::MetricsCollector;

/// Decision taken by one monitor tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
    ScaledUp { worker_id: u64 },
    ScaledDown { worker_id: u64 },
    Hold,
}

pub struct ScalingMonitor {
    pool: Arc<WorkerPool>,
    ctx: Arc<WorkerContext>,
    metrics: MetricsCollector,
}

impl ScalingMonitor {
    pub fn new(pool: Arc<WorkerPool>, ctx: Arc<WorkerContext>) -> Self {
        Self {
            pool,
            ctx,
            metrics: MetricsCollector::new(),
        }
    }

    /// Runs one scaling decision.
    pub async fn check_and_scale(&self) -> ScaleAction {
        let depth = match self.ctx.ready.len().await {
            Ok(depth) => depth,
            Err(e) => {
                warn!(error = %e, "Could not read queue length, skipping scaling check");
                return ScaleAction::Hold;
            }
        };
        self.refresh_gauges(depth).await;

        let config = &self.ctx.config;
        let live = self.pool.len().await;

        if depth > config.scale_up_threshold && live < self.pool.max_workers() {
            if let Some(worker_id) = self.pool.start_worker(None).await {
                info!(
                    queue_length = depth,
                    workers = live + 1,
                    worker_id = worker_id,
                    "Scaled up"
                );
                return ScaleAction::ScaledUp { worker_id };
            }
        } else if depth < config.scale_down_threshold && live > self.pool.min_workers() {
            if let Some((worker_id, last_active)) = self.pool.longest_idle().await {
                let idle_for = Instant::now().saturating_duration_since(last_active);
                if idle_for > config.idle_timeout && self.pool.stop_worker(worker_id).await {
                    info!(
                        queue_length = depth,
                        workers = live - 1,
                        worker_id = worker_id,
                        idle_secs = idle_for.as_secs(),
                        "Scaled down"
                    );
                    return ScaleAction::ScaledDown { worker_id };
                }
            }
        }

        debug!(queue_length = depth, workers = live, "No scaling needed");
        ScaleAction::Hold
    }

    async fn refresh_gauges(&self, depth: usize) {
        self.metrics.update_queue_depth("ready", depth);
        if let Ok(failed) = self.ctx.failed.len().await {
            self.metrics.update_queue_depth("failed", failed);
        }
        if let Ok(delayed) = self.ctx.delayed.len().await {
            self.metrics.update_queue_depth("delayed", delayed);
        }
    }

    /// Checks every `interval` until cancelled.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "Scaling monitor started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            self.check_and_scale().await;
        }

        info!("Scaling monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::queue::task::Task;
    use crate::store::{MemoryStore, Store};
    use crate::transport::SharedTransport;

    fn monitor(config: QueueConfig) -> (Arc<MemoryStore>, Arc<WorkerPool>, ScalingMonitor) {
        let store = Arc::new(MemoryStore::new());
        let ctx = Arc::new(WorkerContext::new(
            store.clone(),
            config,
            SharedTransport::default(),
        ));
        let pool = Arc::new(WorkerPool::new(ctx.clone(), CancellationToken::new()));
        let monitor = ScalingMonitor::new(pool.clone(), ctx);
        (store, pool, monitor)
    }

    fn config() -> QueueConfig {
        QueueConfig::default()
            .with_key_prefix("t")
            .with_worker_bounds(1, 3)
            .with_thresholds(5, 2)
            .with_idle_timeout(Duration::from_secs(60))
            .with_fetch_timeout(Duration::from_millis(50))
    }

    #[tokio::test(start_paused = true)]
    async fn test_scales_up_one_worker_per_tick() {
        let (store, pool, monitor) = monitor(config());
        // No workers draining yet, so the backlog stays put.
        for i in 0..10 {
            let task = Task::new(format!("email_{}", i), "a@x.com", "s", "b", 3);
            store
                .lpush("t:queue", &serde_json::to_string(&task).unwrap())
                .await
                .unwrap();
        }

        assert!(matches!(
            monitor.check_and_scale().await,
            ScaleAction::ScaledUp { .. }
        ));
        assert_eq!(pool.len().await, 1);

        pool.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_holds_within_thresholds() {
        let (_store, pool, monitor) = monitor(config().with_thresholds(5, 0));
        pool.start().await;

        assert_eq!(monitor.check_and_scale().await, ScaleAction::Hold);
        assert_eq!(pool.len().await, 1);

        pool.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_down_waits_for_idle_timeout() {
        let (_store, pool, monitor) = monitor(config());
        pool.start().await;
        pool.start_worker(None).await.unwrap();
        assert_eq!(pool.len().await, 2);

        assert_eq!(monitor.check_and_scale().await, ScaleAction::Hold);

        tokio::time::sleep(Duration::from_secs(61)).await;

        assert!(matches!(
            monitor.check_and_scale().await,
            ScaleAction::ScaledDown { .. }
        ));
        assert_eq!(pool.len().await, 1);

        // The floor holds no matter how long the last worker idles.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(monitor.check_and_scale().await, ScaleAction::Hold);
        assert_eq!(pool.len().await, 1);

        pool.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_error_holds() {
        let (store, pool, monitor) = monitor(config());
        store.set_available(false);

        assert_eq!(monitor.check_and_scale().await, ScaleAction::Hold);
        assert!(pool.is_empty().await);
    }
}
