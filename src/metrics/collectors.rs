//! Recording façade over the raw Prometheus metrics.

use std::fmt;
use std::time::Duration;

use super::prometheus::{DELIVERIES_TOTAL, QUEUE_DEPTH, SEND_DURATION, WORKERS};

/// Final disposition of one delivery attempt, used as the `outcome` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The transport accepted the message.
    Delivered,
    /// The transport failed and a retry was scheduled.
    Retried,
    /// Retries were exhausted and the task moved to the failed list.
    DeadLettered,
    /// The task was already delivered by someone else.
    Skipped,
    /// The payload could not be decoded.
    Discarded,
    /// Sent synchronously because the store could not take the task.
    Inline,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered => "delivered",
            DeliveryOutcome::Retried => "retried",
            DeliveryOutcome::DeadLettered => "dead_lettered",
            DeliveryOutcome::Skipped => "skipped",
            DeliveryOutcome::Discarded => "discarded",
            DeliveryOutcome::Inline => "inline",
        }
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metrics collector for the mail queue.
///
/// Every method is a no-op until [`init_metrics`](super::init_metrics) has run,
/// so library code can record unconditionally.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Counts one delivery outcome.
    pub fn record_delivery(&self, outcome: DeliveryOutcome) {
        if let Some(deliveries) = DELIVERIES_TOTAL.get() {
            deliveries.with_label_values(&[outcome.as_str()]).inc();
        }

        tracing::trace!(outcome = %outcome, "Recorded delivery metric");
    }

    /// Observes the duration of one transport call.
    pub fn observe_send(&self, elapsed: Duration) {
        if let Some(send_duration) = SEND_DURATION.get() {
            send_duration.observe(elapsed.as_secs_f64());
        }
    }

    /// Update the depth gauge of one queue (`ready`, `failed` or `delayed`).
    pub fn update_queue_depth(&self, queue: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.with_label_values(&[queue]).set(depth as f64);
        }

        tracing::trace!(queue = queue, depth = depth, "Updated queue depth metric");
    }

    /// Update the live worker gauge.
    pub fn update_workers(&self, count: usize) {
        if let Some(workers) = WORKERS.get() {
            workers.set(count as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_outcome_labels() {
        assert_eq!(DeliveryOutcome::Delivered.as_str(), "delivered");
        assert_eq!(DeliveryOutcome::DeadLettered.to_string(), "dead_lettered");
        assert_eq!(DeliveryOutcome::Inline.as_str(), "inline");
    }

    #[test]
    fn test_collector_is_zero_sized() {
        let collector = MetricsCollector::new();
        assert_eq!(std::mem::size_of_val(&collector), 0);
    }

    #[test]
    fn test_recording_shows_up_in_export() {
        let _ = init_metrics();
        let collector = MetricsCollector::new();

        collector.record_delivery(DeliveryOutcome::Delivered);
        collector.record_delivery(DeliveryOutcome::Retried);
        collector.observe_send(Duration::from_millis(120));
        collector.update_queue_depth("ready", 42);
        collector.update_workers(4);

        let text = export_metrics();
        assert!(text.contains("mailqueue_deliveries_total"));
        assert!(text.contains("outcome=\"delivered\""));
        assert!(text.contains("queue=\"ready\""));
        assert!(text.contains("mailqueue_send_duration_seconds"));
    }
}
