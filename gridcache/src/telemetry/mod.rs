//! Cache telemetry.
//!
//! Lock-free counters recorded by the request coordinator, the count
//! coordinator and the population pipeline.
//!
//! # Architecture
//!
//! ```text
//! TileService / Pipeline ─────► CacheMetrics ─────► CacheSnapshot ─────► CLI / logs
//!                               (atomic counters)   (point-in-time copy)
//! ```
//!
//! # Example
//!
//! ```
//! use gridcache::telemetry::CacheMetrics;
//!
//! let metrics = CacheMetrics::new();
//! metrics.cache_hit();
//! metrics.cache_miss();
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.cache_hits, 1);
//! assert!((snapshot.hit_rate - 0.5).abs() < f64::EPSILON);
//! ```

mod metrics;
mod snapshot;

pub use metrics::CacheMetrics;
pub use snapshot::CacheSnapshot;
