//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks queue depths, live workers, delivery outcomes and transport latency.
//!
//! # Example
//!
//! ```ignore
//! use mailqueue::metrics::{init_metrics, export_metrics, DeliveryOutcome, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_delivery(DeliveryOutcome::Delivered);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use self::collectors::{DeliveryOutcome, MetricsCollector};
pub use self::prometheus::{export_metrics, init_metrics};

pub use self::prometheus::{DELIVERIES_TOTAL, QUEUE_DEPTH, REGISTRY, SEND_DURATION, WORKERS};
