//! Cumulative pipeline counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated once per resolved batch.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    batches: AtomicU64,
    events: AtomicU64,
    applied: AtomicU64,
    dead_lettered: AtomicU64,
    retried: AtomicU64,
    skipped: AtomicU64,
    lag: AtomicU64,
}

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub batches: u64,
    pub events: u64,
    pub applied: u64,
    pub dead_lettered: u64,
    pub retried: u64,
    pub skipped: u64,
    /// Change-log entries between the source head and the checkpoint.
    pub lag: u64,
}

impl PipelineMetrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the outcome of one batch.
    pub fn record_batch(&self, events: usize, applied: usize, dead_lettered: usize, retried: usize, skipped: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.events.fetch_add(events as u64, Ordering::Relaxed);
        self.applied.fetch_add(applied as u64, Ordering::Relaxed);
        self.dead_lettered.fetch_add(dead_lettered as u64, Ordering::Relaxed);
        self.retried.fetch_add(retried as u64, Ordering::Relaxed);
        self.skipped.fetch_add(skipped as u64, Ordering::Relaxed);
    }

    /// Set the current checkpoint lag.
    pub fn set_lag(&self, lag: u64) {
        self.lag.store(lag, Ordering::Relaxed);
    }

    /// Read all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            lag: self.lag.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = PipelineMetrics::new();
        metrics.record_batch(10, 8, 1, 3, 1);
        metrics.record_batch(5, 5, 0, 0, 0);
        metrics.set_lag(7);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.batches, 2);
        assert_eq!(snapshot.events, 15);
        assert_eq!(snapshot.applied, 13);
        assert_eq!(snapshot.dead_lettered, 1);
        assert_eq!(snapshot.retried, 3);
        assert_eq!(snapshot.lag, 7);
    }
}
