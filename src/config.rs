//! Configuration for the mail queue.
//!
//! Every tunable of the delivery subsystem lives in [`QueueConfig`]. Worker
//! bounds and scaling thresholds are normally derived from a single baseline
//! worker count via [`QueueConfig::from_baseline`]; each field can still be
//! overridden individually, either with the `with_*` setters or from a YAML
//! file where durations are given in whole seconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default key prefix for every store key owned by the queue.
pub const DEFAULT_KEY_PREFIX: &str = "mailqueue:email";

/// Default baseline worker count.
pub const DEFAULT_BASELINE_WORKERS: usize = 3;

/// Default maximum number of retries for a task.
pub const DEFAULT_MAX_RETRY: u32 = 3;

/// Configuration for the mail queue and its worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Prefix applied to all store keys.
    pub key_prefix: String,
    /// Worker count the scaling policy was derived from.
    pub baseline_workers: usize,
    /// Floor of the worker pool.
    pub min_workers: usize,
    /// Ceiling of the worker pool.
    pub max_workers: usize,
    /// Queue depth above which one worker is added per monitor tick.
    pub scale_up_threshold: usize,
    /// Queue depth below which an idle worker may be removed.
    pub scale_down_threshold: usize,
    /// How long a worker must be idle before it can be scaled down.
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,
    /// Interval between scaling checks.
    #[serde(with = "duration_secs")]
    pub scale_interval: Duration,
    /// Bound on the blocking pop a worker performs.
    #[serde(with = "duration_secs")]
    pub fetch_timeout: Duration,
    /// Pause after a store error during fetch.
    #[serde(with = "duration_secs")]
    pub error_backoff: Duration,
    /// Linear backoff step between retries.
    #[serde(with = "duration_secs")]
    pub base_retry_delay: Duration,
    /// Retries allowed before a task is dead-lettered.
    pub max_retry: u32,
    /// Interval between delayed-queue scans.
    #[serde(with = "duration_secs")]
    pub dispatch_interval: Duration,
    /// Maximum due entries promoted per scan.
    pub dispatch_batch: usize,
    /// Window during which identical content is suppressed.
    #[serde(with = "duration_secs")]
    pub dedupe_window: Duration,
    /// TTL of the in-flight marker set at submission.
    #[serde(with = "duration_secs")]
    pub processing_ttl: Duration,
    /// TTL of the per-task "sent" marker.
    #[serde(with = "duration_secs")]
    pub sent_ttl: Duration,
    /// Upper bound on graceful shutdown.
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from_baseline(DEFAULT_BASELINE_WORKERS)
    }
}

impl QueueConfig {
    /// Derives worker bounds and scaling thresholds from a baseline count.
    ///
    /// - floor: `max(1, baseline / 2)`
    /// - ceiling: `3 * baseline`
    /// - scale up when depth exceeds `10 * baseline`
    /// - scale down when depth drops below `2 * baseline`
    pub fn from_baseline(baseline: usize) -> Self {
        let baseline = baseline.max(1);
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            baseline_workers: baseline,
            min_workers: (baseline / 2).max(1),
            max_workers: baseline * 3,
            scale_up_threshold: baseline * 10,
            scale_down_threshold: baseline * 2,
            idle_timeout: Duration::from_secs(5 * 60),
            scale_interval: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
            base_retry_delay: Duration::from_secs(30),
            max_retry: DEFAULT_MAX_RETRY,
            dispatch_interval: Duration::from_secs(5),
            dispatch_batch: 100,
            dedupe_window: Duration::from_secs(24 * 60 * 60),
            processing_ttl: Duration::from_secs(10 * 60),
            sent_ttl: Duration::from_secs(24 * 60 * 60),
            shutdown_timeout: Duration::from_secs(10),
        }
    }

    /// Loads a configuration from a YAML file and validates it.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// Parses a configuration from YAML text and validates it.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: QueueConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants the worker pool and scaler rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_workers == 0 {
            return Err(ConfigError::Invalid(
                "min_workers must be at least 1".to_string(),
            ));
        }
        if self.min_workers > self.max_workers {
            return Err(ConfigError::Invalid(format!(
                "min_workers ({}) must be <= max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if self.scale_down_threshold > self.scale_up_threshold {
            return Err(ConfigError::Invalid(format!(
                "scale_down_threshold ({}) must be <= scale_up_threshold ({})",
                self.scale_down_threshold, self.scale_up_threshold
            )));
        }
        if self.fetch_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "fetch_timeout must be greater than zero".to_string(),
            ));
        }
        if self.fetch_timeout >= self.shutdown_timeout {
            return Err(ConfigError::Invalid(format!(
                "fetch_timeout ({:?}) must be shorter than shutdown_timeout ({:?})",
                self.fetch_timeout, self.shutdown_timeout
            )));
        }
        if self.dispatch_batch == 0 {
            return Err(ConfigError::Invalid(
                "dispatch_batch must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Sets the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Sets the worker floor and ceiling.
    pub fn with_worker_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max;
        self
    }

    /// Sets the scale-up and scale-down queue depth thresholds.
    pub fn with_thresholds(mut self, scale_up: usize, scale_down: usize) -> Self {
        self.scale_up_threshold = scale_up;
        self.scale_down_threshold = scale_down;
        self
    }

    /// Sets the idle timeout before scale-down.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the scaling check interval.
    pub fn with_scale_interval(mut self, interval: Duration) -> Self {
        self.scale_interval = interval;
        self
    }

    /// Sets the blocking fetch timeout.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Sets the base retry delay.
    pub fn with_base_retry_delay(mut self, delay: Duration) -> Self {
        self.base_retry_delay = delay;
        self
    }

    /// Sets the retry ceiling.
    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Sets the delayed-queue scan interval.
    pub fn with_dispatch_interval(mut self, interval: Duration) -> Self {
        self.dispatch_interval = interval;
        self
    }

    /// Sets the dedupe window.
    pub fn with_dedupe_window(mut self, window: Duration) -> Self {
        self.dedupe_window = window;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Serializes a `Duration` as whole seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
