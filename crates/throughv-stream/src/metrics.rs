//! Per-stream counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics snapshot for one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThroughvMetrics {
    pub batches_completed: u64,
    pub entries_transformed: u64,
    pub results_pushed: u64,
    /// Entries whose transform produced no output.
    pub results_dropped: u64,
    pub transform_errors: u64,
    /// Size of the biggest batch seen so far, in entries.
    pub largest_batch: u64,
}

#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    batches_completed: AtomicU64,
    entries_transformed: AtomicU64,
    results_pushed: AtomicU64,
    results_dropped: AtomicU64,
    transform_errors: AtomicU64,
    largest_batch: AtomicU64,
}

impl MetricsRecorder {
    pub(crate) fn record_batch(&self, entries: usize, produced: usize, failed: bool) {
        let entries = entries as u64;
        let produced = produced as u64;
        self.batches_completed.fetch_add(1, Ordering::Relaxed);
        self.entries_transformed.fetch_add(entries, Ordering::Relaxed);
        self.results_dropped
            .fetch_add(entries.saturating_sub(produced), Ordering::Relaxed);
        self.largest_batch.fetch_max(entries, Ordering::Relaxed);
        if failed {
            self.transform_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_push(&self) {
        self.results_pushed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ThroughvMetrics {
        ThroughvMetrics {
            batches_completed: self.batches_completed.load(Ordering::Relaxed),
            entries_transformed: self.entries_transformed.load(Ordering::Relaxed),
            results_pushed: self.results_pushed.load(Ordering::Relaxed),
            results_dropped: self.results_dropped.load(Ordering::Relaxed),
            transform_errors: self.transform_errors.load(Ordering::Relaxed),
            largest_batch: self.largest_batch.load(Ordering::Relaxed),
        }
    }
}
