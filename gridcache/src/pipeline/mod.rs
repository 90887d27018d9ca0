//! Cache population pipeline.
//!
//! Fetches one full-grid aggregation for a fingerprint and zoom level and
//! fans its records out into per-tile cell files. Runs decoupled from the
//! request that triggered it: every failure ends as a logged
//! [`PopulationOutcome`], never as an error on the request path.
//!
//! # State machine
//!
//! ```text
//!  CheckPopulated ──populated──────────────────────────────► AlreadyPopulated
//!        │
//!  AcquireLock ─────held elsewhere─────────────────────────► Locked
//!        │ guard
//!  ┌─────┴──────────────────── lock held ─────────────────────────────────┐
//!  │ CheckOversized ──live marker──────────────────────────► KnownOversized│
//!  │      │                                                                │
//!  │    Count ──above threshold──► mark oversized ─────────► MarkedOversized
//!  │      │                                                                │
//!  │    Clear                                                              │
//!  │      │                                                                │
//!  │    Fetch ──timeout──────────► mark oversized ─────────► MarkedOversized
//!  │      │                                                                │
//!  │    FanOut (bounded write pool)                                        │
//!  │      │                                                                │
//!  │    MarkDone ──────────────────────────────────────────► Populated     │
//!  │                                                                       │
//!  │    any error ─────────────────────────────────────────► Failed        │
//!  └─────┬─────────────────────────────────────────────────────────────────┘
//!   ReleaseLock (every exit from the locked region)
//! ```

mod limiter;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::backend::{BackendError, FeatureRecord, RecordMapper, SearchBackend, SearchOptions};
use crate::cache::{self, CacheError, CacheStore, PrecisionCache};
use crate::fingerprint::Fingerprint;
use crate::geo::TileCoord;
use crate::query::QueryBuilder;
use crate::request::{DataType, TileRequest};
use crate::reservation::{Acquire, CountCoordinator, ReservationGuard};
use crate::store::StoreError;
use crate::telemetry::CacheMetrics;

pub use limiter::{ConcurrencyLimiter, ConcurrencyPermit, DEFAULT_WRITE_CONCURRENCY};

/// Default timeout for the count query.
pub const DEFAULT_COUNT_TIMEOUT: Duration = Duration::from_secs(15);
/// Default timeout for the full aggregation fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(90);
/// Count above which fine grids (precision > 5) are not cached.
pub const DEFAULT_LOWER_THRESHOLD: u64 = 300_000;
/// Count above which grids at precision > 4 are not cached.
pub const DEFAULT_HIGH_THRESHOLD: u64 = 2_000_000;

/// Pipeline tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub count_timeout: Duration,
    pub fetch_timeout: Duration,
    pub lower_threshold: u64,
    pub high_threshold: u64,
    /// Width of the cell write pool.
    pub write_concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            count_timeout: DEFAULT_COUNT_TIMEOUT,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            lower_threshold: DEFAULT_LOWER_THRESHOLD,
            high_threshold: DEFAULT_HIGH_THRESHOLD,
            write_concurrency: DEFAULT_WRITE_CONCURRENCY,
        }
    }
}

impl PipelineConfig {
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_count_timeout(mut self, timeout: Duration) -> Self {
        self.count_timeout = timeout;
        self
    }

    pub fn with_thresholds(mut self, lower: u64, high: u64) -> Self {
        self.lower_threshold = lower;
        self.high_threshold = high;
        self
    }

    pub fn with_write_concurrency(mut self, width: usize) -> Self {
        self.write_concurrency = width;
        self
    }

    /// True when `count` documents are too many to cache at `precision`.
    pub fn is_oversized(&self, count: u64, precision: u8) -> bool {
        (precision > 5 && count > self.lower_threshold) || (precision > 4 && count > self.high_threshold)
    }
}

/// How a population run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopulationOutcome {
    /// `saved.done` was already live.
    AlreadyPopulated,
    /// Another run holds the global lock.
    Locked,
    /// `oversized.done` was already live.
    KnownOversized,
    /// This run decided the grid is too large; `count` is `None` when the
    /// fetch timed out.
    MarkedOversized { count: Option<u64> },
    /// Cells were written and `saved.done` set.
    Populated { cells: usize, records: usize },
    /// The run aborted without caching.
    Failed { reason: String },
}

impl PopulationOutcome {
    /// True when the precision directory is usable after this outcome.
    pub fn is_populated(&self) -> bool {
        matches!(self, PopulationOutcome::AlreadyPopulated | PopulationOutcome::Populated { .. })
    }
}

impl fmt::Display for PopulationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PopulationOutcome::AlreadyPopulated => write!(f, "already populated"),
            PopulationOutcome::Locked => write!(f, "locked by another run"),
            PopulationOutcome::KnownOversized => write!(f, "known oversized"),
            PopulationOutcome::MarkedOversized { count: Some(n) } => {
                write!(f, "marked oversized ({} documents)", n)
            }
            PopulationOutcome::MarkedOversized { count: None } => write!(f, "marked oversized (fetch timed out)"),
            PopulationOutcome::Populated { cells, records } => {
                write!(f, "populated {} cells from {} records", cells, records)
            }
            PopulationOutcome::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// Failures inside the locked region of a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("lock store error: {0}")]
    Store(#[from] StoreError),

    #[error("global lock lost during population")]
    LockLost,

    #[error("write pool closed")]
    PoolClosed,

    #[error("cell write task failed: {0}")]
    Join(String),
}

/// Immutable inputs for one population run.
///
/// Built once from the triggering request; stages only read it.
#[derive(Debug, Clone)]
pub struct PopulationJob {
    fingerprint: Fingerprint,
    zoom: u8,
    precision: u8,
    count_query: Value,
    fetch_query: Value,
    mapper: RecordMapper,
}

impl PopulationJob {
    pub fn new(request: &TileRequest, queries: &QueryBuilder) -> Self {
        let includes = queries.source_includes(request);
        Self {
            fingerprint: Fingerprint::for_request(request),
            zoom: request.zoom(),
            precision: request.geohash_precision(),
            count_query: queries.count_query(request),
            fetch_query: queries.cache_fetch_query(request),
            mapper: RecordMapper::new(queries.geo_point_field(), &includes, DataType::Search),
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn zoom(&self) -> u8 {
        self.zoom
    }

    pub fn precision(&self) -> u8 {
        self.precision
    }
}

/// Stages inside the global lock. Each carries what the next one needs.
enum Stage {
    CheckOversized,
    Count,
    Clear,
    Fetch,
    FanOut(Vec<FeatureRecord>),
    MarkDone { cells: usize, records: usize },
    Finished(PopulationOutcome),
}

/// Runs population jobs against one cache root.
#[derive(Clone)]
pub struct PopulationPipeline {
    backend: Arc<dyn SearchBackend>,
    cache: CacheStore,
    counts: CountCoordinator,
    config: PipelineConfig,
    metrics: Arc<CacheMetrics>,
}

impl PopulationPipeline {
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        cache: CacheStore,
        counts: CountCoordinator,
        config: PipelineConfig,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            backend,
            cache,
            counts,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Runs one job to completion.
    ///
    /// The global lock, once taken, is released on every exit path.
    #[instrument(skip(self, job), fields(fingerprint = %job.fingerprint, zoom = job.zoom))]
    pub async fn run(&self, job: &PopulationJob) -> PopulationOutcome {
        self.metrics.population_started();
        let outcome = self.run_inner(job).await;
        self.record(&outcome);
        outcome
    }

    async fn run_inner(&self, job: &PopulationJob) -> PopulationOutcome {
        let precision_cache = match self.cache.precision(&job.fingerprint, job.zoom).await {
            Ok(c) => c,
            Err(e) => return PopulationOutcome::Failed { reason: e.to_string() },
        };
        if precision_cache.is_populated().await {
            return PopulationOutcome::AlreadyPopulated;
        }

        let mut guard = match self.cache.global_lock().acquire().await {
            Acquire::Acquired(guard) => guard,
            Acquire::Held => return PopulationOutcome::Locked,
            Acquire::Unavailable(e) => return PopulationOutcome::Failed { reason: e.to_string() },
        };

        let outcome = match self.run_locked(job, &precision_cache, &mut guard).await {
            Ok(outcome) => outcome,
            Err(e) => PopulationOutcome::Failed { reason: e.to_string() },
        };

        if let Err(e) = guard.release().await {
            warn!(error = %e, "global lock release failed; it will expire");
        }
        outcome
    }

    async fn run_locked(
        &self,
        job: &PopulationJob,
        cache: &PrecisionCache,
        guard: &mut ReservationGuard,
    ) -> Result<PopulationOutcome, PipelineError> {
        let mut stage = Stage::CheckOversized;
        loop {
            stage = match stage {
                Stage::CheckOversized => {
                    if cache.is_known_oversized().await {
                        Stage::Finished(PopulationOutcome::KnownOversized)
                    } else {
                        Stage::Count
                    }
                }
                Stage::Count => {
                    let count = self.count(job).await?;
                    if self.config.is_oversized(count, job.precision) {
                        debug!(count, precision = job.precision, "count above threshold");
                        cache.mark_oversized().await?;
                        Stage::Finished(PopulationOutcome::MarkedOversized { count: Some(count) })
                    } else {
                        Stage::Clear
                    }
                }
                Stage::Clear => {
                    cache.clear().await?;
                    Stage::Fetch
                }
                Stage::Fetch => match self.fetch(job).await {
                    Ok(records) => Stage::FanOut(records),
                    Err(BackendError::Timeout) => {
                        debug!("aggregation fetch timed out");
                        cache.mark_oversized().await?;
                        Stage::Finished(PopulationOutcome::MarkedOversized { count: None })
                    }
                    Err(e) => return Err(e.into()),
                },
                Stage::FanOut(records) => {
                    if !guard.renew().await? {
                        return Err(PipelineError::LockLost);
                    }
                    let total = records.len();
                    let cells = self.fan_out(cache, records).await?;
                    Stage::MarkDone { cells, records: total }
                }
                Stage::MarkDone { cells, records } => {
                    cache.mark_populated().await?;
                    Stage::Finished(PopulationOutcome::Populated { cells, records })
                }
                Stage::Finished(outcome) => return Ok(outcome),
            };
        }
    }

    async fn count(&self, job: &PopulationJob) -> Result<u64, BackendError> {
        let options = SearchOptions::with_timeout(self.config.count_timeout);
        self.counts
            .count(&job.fingerprint, || self.backend.count(job.count_query.clone(), options))
            .await
    }

    async fn fetch(&self, job: &PopulationJob) -> Result<Vec<FeatureRecord>, BackendError> {
        self.metrics.aggregation_fetch();
        let options = SearchOptions::with_timeout(self.config.fetch_timeout);
        let response = self.backend.search(job.fetch_query.clone(), options).await?;
        Ok(job.mapper.map(&response))
    }

    /// Groups records by cell and appends each group through the write pool.
    ///
    /// Returns the number of cells written. All writes finish before this
    /// returns, including when one of them fails.
    async fn fan_out(&self, cache: &PrecisionCache, records: Vec<FeatureRecord>) -> Result<usize, PipelineError> {
        let zoom = cache.zoom();
        let margin = self.cache.edge_margin();
        let mut by_cell: HashMap<TileCoord, Vec<FeatureRecord>> = HashMap::new();
        for record in records {
            let (Some(lon), Some(lat)) = (record.longitude(), record.latitude()) else {
                continue;
            };
            let targets = match cache::cells_for_point(lon, lat, zoom, margin) {
                Ok(t) => t,
                Err(e) => {
                    debug!(lat, lon, error = %e, "record outside the tile grid, skipped");
                    continue;
                }
            };
            for cell in targets {
                by_cell.entry(cell).or_default().push(record.clone());
            }
        }

        let limiter = ConcurrencyLimiter::new(self.config.write_concurrency, "cell_writes");
        let cells = by_cell.len();
        let mut tasks = JoinSet::new();
        let mut first_error: Option<PipelineError> = None;

        for (cell, group) in by_cell {
            let permit = match limiter.acquire().await {
                Ok(p) => p,
                Err(_) => {
                    first_error = Some(PipelineError::PoolClosed);
                    break;
                }
            };
            let cache = cache.clone();
            tasks.spawn(async move {
                let _permit = permit;
                cache.append_cell(cell.x, cell.y, group).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(r) => r.map_err(PipelineError::from),
                Err(e) => Err(PipelineError::Join(e.to_string())),
            };
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }

        debug!(cells, peak_writes = limiter.peak_in_flight(), "fan-out finished");
        match first_error {
            Some(e) => Err(e),
            None => Ok(cells),
        }
    }

    fn record(&self, outcome: &PopulationOutcome) {
        match outcome {
            PopulationOutcome::Populated { cells, records } => {
                self.metrics.population_completed(*cells);
                info!(cells, records, "grid cache populated");
            }
            PopulationOutcome::MarkedOversized { count } => {
                self.metrics.population_oversized();
                info!(count = ?count, "grid marked oversized");
            }
            PopulationOutcome::AlreadyPopulated | PopulationOutcome::Locked | PopulationOutcome::KnownOversized => {
                self.metrics.population_skipped();
                debug!(%outcome, "population skipped");
            }
            PopulationOutcome::Failed { reason } => {
                self.metrics.population_failed();
                warn!(reason = %reason, "grid cache population failed");
            }
        }
    }
}
