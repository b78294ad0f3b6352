//! Prometheus metrics registration and export.
//!
//! All mailqueue metrics live in one process-wide registry. Registration is
//! explicit via [`init_metrics`]; until then every recording call is a no-op.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all mailqueue metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Entries per queue, labeled `ready`, `failed` or `delayed`.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Live workers in the pool.
pub static WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Delivery outcomes, labeled by outcome.
pub static DELIVERIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Time spent inside the mail transport per send.
pub static SEND_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls build a fresh registry but leave the
/// first one installed.
///
/// # Errors
///
/// Returns a `prometheus::Error` if a metric definition is invalid.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let queue_depth = GaugeVec::new(
        Opts::new("mailqueue_queue_depth", "Number of entries per queue"),
        &["queue"],
    )?;

    let workers = Gauge::new("mailqueue_workers", "Number of live delivery workers")?;

    let deliveries_total = CounterVec::new(
        Opts::new("mailqueue_deliveries_total", "Delivery outcomes by kind"),
        &["outcome"],
    )?;

    let send_duration = Histogram::with_opts(
        HistogramOpts::new(
            "mailqueue_send_duration_seconds",
            "Mail transport call duration in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
    )?;

    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(workers.clone()))?;
    registry.register(Box::new(deliveries_total.clone()))?;
    registry.register(Box::new(send_duration.clone()))?;

    // Already-set cells mean metrics were initialized earlier
    let _ = REGISTRY.set(registry);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = WORKERS.set(workers);
    let _ = DELIVERIES_TOTAL.set(deliveries_total);
    let _ = SEND_DURATION.set(send_duration);

    tracing::info!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of failing when the registry is missing or
/// encoding goes wrong.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_repeatable() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_after_init() {
        let _ = init_metrics();

        if let Some(workers) = WORKERS.get() {
            workers.set(3.0);
        }

        let text = export_metrics();
        assert!(!text.starts_with("# Error"));
        assert!(text.contains("mailqueue_workers"));
    }
}
