//! Store key construction.

/// Builds every store key owned by the queue from a common prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// List of ready tasks.
    pub fn queue(&self) -> String {
        format!("{}:queue", self.prefix)
    }

    /// Dead-letter list.
    pub fn failed(&self) -> String {
        format!("{}:failed", self.prefix)
    }

    /// Sorted set of tasks waiting for a retry.
    pub fn delayed(&self) -> String {
        format!("{}:delayed", self.prefix)
    }

    /// Per-task processing/sent marker.
    pub fn sent_task(&self, task_id: &str) -> String {
        format!("{}:sent:task:{}", self.prefix, task_id)
    }

    /// Content fingerprint marker, namespaced by calendar day.
    pub fn dedupe(&self, date: &str, fingerprint: &str) -> String {
        format!("{}:dedupe:{}:{}", self.prefix, date, fingerprint)
    }
}
