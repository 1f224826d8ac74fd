//! Cross-component counters surfaced on `/api/health` (spec.md §7:
//! "Operators see structured logs for every drop/suppression/retry and a
//! per-category counter"). Per-source parse misses live in
//! `parser::ParseMetrics`; this covers the categories that don't belong to
//! a single component.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct Metrics {
    pub eligibility_rejected: AtomicU64,
    pub dedup_suppressed: AtomicU64,
    pub durable_write_failures: AtomicU64,
    pub mirror_failures: AtomicU64,
    pub fanout_dropped: AtomicU64,
    pub ingest_latency_drops: AtomicU64,
    pub ingest_reconnects: AtomicU64,
    pub ingest_auth_failures: AtomicU64,
    pub ingest_buffer_dropped: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eligibility_rejected(&self) {
        Self::bump(&self.eligibility_rejected);
    }

    pub fn record_dedup_suppressed(&self) {
        Self::bump(&self.dedup_suppressed);
    }

    pub fn record_durable_write_failure(&self) {
        Self::bump(&self.durable_write_failures);
    }

    pub fn record_mirror_failure(&self) {
        Self::bump(&self.mirror_failures);
    }

    pub fn record_fanout_dropped(&self) {
        Self::bump(&self.fanout_dropped);
    }

    pub fn record_ingest_latency_drop(&self) {
        Self::bump(&self.ingest_latency_drops);
    }

    pub fn record_ingest_reconnect(&self) {
        Self::bump(&self.ingest_reconnects);
    }

    pub fn record_ingest_auth_failure(&self) {
        Self::bump(&self.ingest_auth_failures);
    }

    pub fn record_ingest_buffer_dropped(&self) {
        Self::bump(&self.ingest_buffer_dropped);
    }

    fn load(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            eligibility_rejected: Self::load(&self.eligibility_rejected),
            dedup_suppressed: Self::load(&self.dedup_suppressed),
            durable_write_failures: Self::load(&self.durable_write_failures),
            mirror_failures: Self::load(&self.mirror_failures),
            fanout_dropped: Self::load(&self.fanout_dropped),
            ingest_latency_drops: Self::load(&self.ingest_latency_drops),
            ingest_reconnects: Self::load(&self.ingest_reconnects),
            ingest_auth_failures: Self::load(&self.ingest_auth_failures),
            ingest_buffer_dropped: Self::load(&self.ingest_buffer_dropped),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub eligibility_rejected: u64,
    pub dedup_suppressed: u64,
    pub durable_write_failures: u64,
    pub mirror_failures: u64,
    pub fanout_dropped: u64,
    pub ingest_latency_drops: u64,
    pub ingest_reconnects: u64,
    pub ingest_auth_failures: u64,
    pub ingest_buffer_dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let m = Metrics::new();
        assert_eq!(m.snapshot().dedup_suppressed, 0);
        m.record_dedup_suppressed();
        m.record_dedup_suppressed();
        assert_eq!(m.snapshot().dedup_suppressed, 2);
    }
}
