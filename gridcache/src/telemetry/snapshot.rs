//! Point-in-time telemetry snapshot.

use std::fmt;
use std::time::Duration;

/// Immutable copy of [`CacheMetrics`](super::CacheMetrics) counters.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheSnapshot {
    pub uptime: Duration,

    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Cache hit rate (0.0 - 1.0)
    pub hit_rate: f64,
    pub live_queries: u64,
    pub live_query_failures: u64,

    pub populations_started: u64,
    pub populations_completed: u64,
    pub populations_skipped: u64,
    pub populations_oversized: u64,
    pub populations_failed: u64,
    pub populations_active: usize,
    pub aggregation_fetches: u64,
    pub cells_written: u64,

    pub count_queries: u64,
    pub count_cache_hits: u64,
    pub count_waits: u64,
}

impl fmt::Display for CacheSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Uptime:        {:.1}s", self.uptime.as_secs_f64())?;
        writeln!(
            f,
            "Cache:         {} hits, {} misses ({:.1}% hit rate)",
            self.cache_hits,
            self.cache_misses,
            self.hit_rate * 100.0
        )?;
        writeln!(
            f,
            "Live queries:  {} ({} failed)",
            self.live_queries, self.live_query_failures
        )?;
        writeln!(
            f,
            "Populations:   {} started, {} completed, {} skipped, {} oversized, {} failed, {} active",
            self.populations_started,
            self.populations_completed,
            self.populations_skipped,
            self.populations_oversized,
            self.populations_failed,
            self.populations_active
        )?;
        writeln!(
            f,
            "Fetches:       {} aggregations, {} cells written",
            self.aggregation_fetches, self.cells_written
        )?;
        write!(
            f,
            "Counts:        {} queries, {} cached, {} waits",
            self.count_queries, self.count_cache_hits, self.count_waits
        )
    }
}
