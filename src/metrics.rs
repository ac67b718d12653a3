use crate::telemetry::{runtime_counters, RuntimeCounters};
use std::sync::OnceLock;

pub use crate::telemetry::{QueueInflightSnapshot, RuntimeCountersSnapshot};

/// Collector that wraps the runtime counter APIs with a single entrypoint.
pub struct MetricsCollector {
    counters: &'static RuntimeCounters,
}

impl MetricsCollector {
    fn new() -> Self {
        Self {
            counters: runtime_counters(),
        }
    }

    pub fn global() -> &'static Self {
        static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
        INSTANCE.get_or_init(Self::new)
    }

    pub fn snapshot(&self) -> RuntimeCountersSnapshot {
        self.counters.snapshot()
    }

    pub fn inc_published(&self) {
        self.counters.inc_published();
    }

    pub fn inc_publish_failure(&self) {
        self.counters.inc_publish_failure();
    }

    pub fn inc_dedup_rejected(&self) {
        self.counters.inc_dedup_rejected();
    }

    pub fn inc_acked(&self) {
        self.counters.inc_acked();
    }

    pub fn inc_retried(&self) {
        self.counters.inc_retried();
    }

    pub fn inc_failed(&self) {
        self.counters.inc_failed();
    }

    pub fn inc_leaked(&self) {
        self.counters.inc_leaked();
    }

    pub fn inc_dropped(&self) {
        self.counters.inc_dropped();
    }

    pub fn inc_reconnects(&self) {
        self.counters.inc_reconnects();
    }

    pub fn add_inflight(&self, queue: &str, count: usize) {
        self.counters.add_inflight(queue, count as u64);
    }

    pub fn sub_inflight(&self, queue: &str, count: usize) {
        self.counters.sub_inflight(queue, count as u64);
    }
}

pub fn metrics() -> &'static MetricsCollector {
    MetricsCollector::global()
}
