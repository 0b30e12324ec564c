//! Counter sink injected into the store and the log driver.

use parking_lot::Mutex;
use std::collections::HashMap;

pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &str);
}

/// Discards every increment.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &str) {}
}

/// Keeps counters in memory; useful for tests and for status endpoints.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.counters.lock().clone()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, name: &str) {
        *self.counters.lock().entry(name.to_string()).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_counters() {
        let metrics = InMemoryMetrics::new();
        metrics.increment("restore");
        metrics.increment("restore");
        metrics.increment("backup");

        assert_eq!(metrics.get("restore"), 2);
        assert_eq!(metrics.get("backup"), 1);
        assert_eq!(metrics.get("snapshot"), 0);
        assert_eq!(metrics.snapshot().len(), 2);
    }
}
