//! Include cache counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for include cache activity since the manager was created.
#[derive(Debug, Default)]
pub struct IncludeCacheStats {
    /// Stored entries served without fetching
    pub hits: AtomicU64,

    /// Lookups that found nothing usable
    pub misses: AtomicU64,

    /// Synchronous fetches performed by `stream`
    pub fetches: AtomicU64,

    /// Background loads spawned by `load`
    pub parallel_loads: AtomicU64,

    /// Refresh items accepted by the preemptive worker
    pub refreshes_enqueued: AtomicU64,

    /// Sessions that fell back to local storage
    pub fallbacks: AtomicU64,
}

impl IncludeCacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of all counters.
    pub fn snapshot(&self) -> IncludeCacheStatsSnapshot {
        IncludeCacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            parallel_loads: self.parallel_loads.load(Ordering::Relaxed),
            refreshes_enqueued: self.refreshes_enqueued.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of include cache counters at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IncludeCacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub parallel_loads: u64,
    pub refreshes_enqueued: u64,
    pub fallbacks: u64,
}

impl IncludeCacheStatsSnapshot {
    /// Fraction of lookups served from cache, or `None` before any lookup.
    pub fn hit_ratio(&self) -> Option<f64> {
        let lookups = self.hits + self.misses;
        (lookups > 0).then(|| self.hits as f64 / lookups as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = IncludeCacheStats::new();
        assert_eq!(stats.snapshot(), IncludeCacheStatsSnapshot::default());
        assert_eq!(stats.snapshot().hit_ratio(), None);

        IncludeCacheStats::incr(&stats.hits);
        IncludeCacheStats::incr(&stats.hits);
        IncludeCacheStats::incr(&stats.hits);
        IncludeCacheStats::incr(&stats.misses);
        IncludeCacheStats::incr(&stats.fallbacks);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.hits, 3);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.fallbacks, 1);
        assert_eq!(snapshot.hit_ratio(), Some(0.75));
    }
}
