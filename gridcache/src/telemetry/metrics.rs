//! Lock-free atomic metrics collection.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use super::CacheSnapshot;

/// Counters for the tile cache.
///
/// All operations use `Relaxed` ordering; counters are independent.
#[derive(Debug)]
pub struct CacheMetrics {
    start_time: Instant,

    // === Request path ===
    /// Tiles served from cell files
    cache_hits: AtomicU64,
    /// Tiles that fell through to a live query
    cache_misses: AtomicU64,
    /// Live queries issued
    live_queries: AtomicU64,
    /// Live queries that failed
    live_query_failures: AtomicU64,

    // === Population ===
    populations_started: AtomicU64,
    populations_completed: AtomicU64,
    /// Runs that found nothing to do (populated, locked, known oversized)
    populations_skipped: AtomicU64,
    /// Runs that marked the grid oversized
    populations_oversized: AtomicU64,
    populations_failed: AtomicU64,
    populations_active: AtomicUsize,
    /// Full-grid aggregation fetches issued
    aggregation_fetches: AtomicU64,
    /// Cell files written
    cells_written: AtomicU64,

    // === Counts ===
    /// Count queries actually sent to the backend
    count_queries: AtomicU64,
    /// Counts answered from the shared value cache
    count_cache_hits: AtomicU64,
    /// Callers that waited on another caller's count
    count_waits: AtomicU64,
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            live_queries: AtomicU64::new(0),
            live_query_failures: AtomicU64::new(0),
            populations_started: AtomicU64::new(0),
            populations_completed: AtomicU64::new(0),
            populations_skipped: AtomicU64::new(0),
            populations_oversized: AtomicU64::new(0),
            populations_failed: AtomicU64::new(0),
            populations_active: AtomicUsize::new(0),
            aggregation_fetches: AtomicU64::new(0),
            cells_written: AtomicU64::new(0),
            count_queries: AtomicU64::new(0),
            count_cache_hits: AtomicU64::new(0),
            count_waits: AtomicU64::new(0),
        }
    }

    // === Request path ===

    pub fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn live_query(&self) {
        self.live_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn live_query_failed(&self) {
        self.live_query_failures.fetch_add(1, Ordering::Relaxed);
    }

    // === Population ===

    pub fn population_started(&self) {
        self.populations_started.fetch_add(1, Ordering::Relaxed);
        self.populations_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn population_completed(&self, cells: usize) {
        self.populations_completed.fetch_add(1, Ordering::Relaxed);
        self.cells_written.fetch_add(cells as u64, Ordering::Relaxed);
        self.population_finished();
    }

    pub fn population_skipped(&self) {
        self.populations_skipped.fetch_add(1, Ordering::Relaxed);
        self.population_finished();
    }

    pub fn population_oversized(&self) {
        self.populations_oversized.fetch_add(1, Ordering::Relaxed);
        self.population_finished();
    }

    pub fn population_failed(&self) {
        self.populations_failed.fetch_add(1, Ordering::Relaxed);
        self.population_finished();
    }

    fn population_finished(&self) {
        self.populations_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn aggregation_fetch(&self) {
        self.aggregation_fetches.fetch_add(1, Ordering::Relaxed);
    }

    // === Counts ===

    pub fn count_query(&self) {
        self.count_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_cache_hit(&self) {
        self.count_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_wait(&self) {
        self.count_waits.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a point-in-time copy of all counters.
    pub fn snapshot(&self) -> CacheSnapshot {
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.cache_misses.load(Ordering::Relaxed);
        let total = cache_hits + cache_misses;

        CacheSnapshot {
            uptime: self.start_time.elapsed(),
            cache_hits,
            cache_misses,
            hit_rate: if total > 0 {
                cache_hits as f64 / total as f64
            } else {
                0.0
            },
            live_queries: self.live_queries.load(Ordering::Relaxed),
            live_query_failures: self.live_query_failures.load(Ordering::Relaxed),
            populations_started: self.populations_started.load(Ordering::Relaxed),
            populations_completed: self.populations_completed.load(Ordering::Relaxed),
            populations_skipped: self.populations_skipped.load(Ordering::Relaxed),
            populations_oversized: self.populations_oversized.load(Ordering::Relaxed),
            populations_failed: self.populations_failed.load(Ordering::Relaxed),
            populations_active: self.populations_active.load(Ordering::Relaxed),
            aggregation_fetches: self.aggregation_fetches.load(Ordering::Relaxed),
            cells_written: self.cells_written.load(Ordering::Relaxed),
            count_queries: self.count_queries.load(Ordering::Relaxed),
            count_cache_hits: self.count_cache_hits.load(Ordering::Relaxed),
            count_waits: self.count_waits.load(Ordering::Relaxed),
        }
    }
}
