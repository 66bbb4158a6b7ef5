use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Process-wide recursion guard counters, aggregated over all threads.
#[derive(Debug, Default)]
pub struct RecursionStats {
    computations: AtomicU64,
    preventions: AtomicU64,
    memo_hits: AtomicU64,
    memo_stores: AtomicU64,
    memo_evictions: AtomicU64,
}

/// Serializable snapshot of [`RecursionStats`] for diagnostics export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecursionStatsReport {
    /// Guarded computations that actually ran.
    pub computations: u64,
    /// Nested calls short-circuited because their key was already on the stack.
    pub preventions: u64,
    /// Calls answered from the memo table without running the computation.
    pub memo_hits: u64,
    pub memo_stores: u64,
    /// Memo entries dropped because of the per-key bound.
    pub memo_evictions: u64,
}

impl RecursionStats {
    pub fn global() -> &'static RecursionStats {
        static GLOBAL: OnceLock<RecursionStats> = OnceLock::new();
        GLOBAL.get_or_init(RecursionStats::default)
    }

    pub fn report(&self) -> RecursionStatsReport {
        RecursionStatsReport {
            computations: self.computations.load(Ordering::Relaxed),
            preventions: self.preventions.load(Ordering::Relaxed),
            memo_hits: self.memo_hits.load(Ordering::Relaxed),
            memo_stores: self.memo_stores.load(Ordering::Relaxed),
            memo_evictions: self.memo_evictions.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.computations,
            &self.preventions,
            &self.memo_hits,
            &self.memo_stores,
            &self.memo_evictions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_computation(&self) {
        self.computations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_prevention(&self) {
        self.preventions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_memo_hit(&self) {
        self.memo_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_memo_store(&self) {
        self.memo_stores.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_memo_evictions(&self, count: usize) {
        if count > 0 {
            self.memo_evictions
                .fetch_add(count as u64, Ordering::Relaxed);
        }
    }
}
