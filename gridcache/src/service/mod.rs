//! Request coordinator.
//!
//! [`TileService`] is the composition root for the engine. Every
//! collaborator (search backend, cache root, coordination store) is injected
//! through a [`ServiceContext`]; nothing is held in process globals.
//!
//! # Request flow
//!
//! ```text
//!   TileRequest
//!       │
//!       ├── postgis ───────────────────────────────────► Passthrough (no query)
//!       │
//!       ├── eligible? ── populated and unlocked ──► read cell ──► Cached
//!       │        │
//!       │        ├── known oversized ──► (live)
//!       │        └── not populated ──► spawn PopulationPipeline (background)
//!       │
//!       └── live query ────────────────────────────────► Live
//! ```

mod render;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::task::TaskTracker;
use tracing::{debug, instrument, warn};

use crate::backend::{BackendError, FeatureRecord, RecordMapper, SearchBackend, SearchOptions};
use crate::cache::{CacheStore, DEFAULT_DATA_TTL};
use crate::fingerprint::{self, Eligibility, Fingerprint};
use crate::pipeline::{PipelineConfig, PopulationJob, PopulationOutcome, PopulationPipeline};
use crate::query::QueryBuilder;
use crate::request::{DataType, OutputFormat, TileRequest, ValidationError};
use crate::reservation::{CountCoordinator, ReservationConfig};
use crate::store::CoordinationStore;
use crate::telemetry::CacheMetrics;

pub use render::{grid_fields, RenderError, Renderer};

/// Default rendered tile edge in pixels.
pub const DEFAULT_TILE_SIZE: u32 = 256;

/// Errors on the request path.
#[derive(Debug, Error)]
pub enum TileError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("live query failed: {0}")]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Render(#[from] RenderError),
}

/// Everything a [`TileService`] is built from.
pub struct ServiceContext {
    pub backend: Arc<dyn SearchBackend>,
    /// Grid cache root; `None` disables caching.
    pub cache: Option<CacheStore>,
    /// Shared store for count values and count locks.
    pub coordination: Arc<dyn CoordinationStore>,
    pub queries: QueryBuilder,
    pub pipeline: PipelineConfig,
    pub reservations: ReservationConfig,
    pub metrics: Arc<CacheMetrics>,
    pub tile_size: u32,
}

impl ServiceContext {
    /// Context with default tuning and no cache root.
    pub fn new(backend: Arc<dyn SearchBackend>, coordination: Arc<dyn CoordinationStore>) -> Self {
        Self {
            backend,
            cache: None,
            coordination,
            queries: QueryBuilder::default(),
            pipeline: PipelineConfig::default(),
            reservations: ReservationConfig::default(),
            metrics: Arc::new(CacheMetrics::new()),
            tile_size: DEFAULT_TILE_SIZE,
        }
    }

    pub fn with_cache(mut self, cache: CacheStore) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_queries(mut self, queries: QueryBuilder) -> Self {
        self.queries = queries;
        self
    }

    pub fn with_pipeline(mut self, config: PipelineConfig) -> Self {
        self.pipeline = config;
        self
    }

    pub fn with_reservations(mut self, config: ReservationConfig) -> Self {
        self.reservations = config;
        self
    }
}

/// Where a tile's records came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSource {
    /// Read from a populated cell file.
    Cached,
    /// Queried from the search backend for this request.
    Live,
    /// The renderer supplies its own data.
    Passthrough,
}

/// Records for one tile.
#[derive(Debug, Clone, PartialEq)]
pub struct TileRecords {
    pub source: RecordSource,
    pub records: Vec<FeatureRecord>,
}

/// Serves tile records from the grid cache or the search backend.
pub struct TileService {
    backend: Arc<dyn SearchBackend>,
    cache: Option<CacheStore>,
    queries: QueryBuilder,
    counts: CountCoordinator,
    pipeline: Option<PopulationPipeline>,
    pipeline_config: PipelineConfig,
    metrics: Arc<CacheMetrics>,
    tracker: TaskTracker,
    tile_size: u32,
}

impl TileService {
    pub fn new(context: ServiceContext) -> Self {
        let counts = CountCoordinator::new(
            Arc::clone(&context.coordination),
            context.reservations,
            Arc::clone(&context.metrics),
        );
        let pipeline = context.cache.clone().map(|cache| {
            PopulationPipeline::new(
                Arc::clone(&context.backend),
                cache,
                counts.clone(),
                context.pipeline,
                Arc::clone(&context.metrics),
            )
        });
        Self {
            backend: context.backend,
            cache: context.cache,
            queries: context.queries,
            counts,
            pipeline,
            pipeline_config: context.pipeline,
            metrics: context.metrics,
            tracker: TaskTracker::new(),
            tile_size: context.tile_size,
        }
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    pub fn queries(&self) -> &QueryBuilder {
        &self.queries
    }

    pub fn cache(&self) -> Option<&CacheStore> {
        self.cache.as_ref()
    }

    /// Whether `request` may use the grid cache, and why not.
    pub fn eligibility(&self, request: &TileRequest) -> Eligibility {
        let data_ttl = self.cache.as_ref().map(CacheStore::data_ttl).unwrap_or(DEFAULT_DATA_TTL);
        fingerprint::eligibility(request, self.cache.is_some(), data_ttl)
    }

    /// Records for one tile.
    ///
    /// A populated, unlocked grid cache answers without touching the
    /// backend. Otherwise population starts in the background and this
    /// request is served by a live query.
    #[instrument(skip(self, request), fields(tile = %request.tile(), style = %request.style()))]
    pub async fn records_for(&self, request: &TileRequest) -> Result<TileRecords, TileError> {
        if request.data_type() == DataType::Postgis {
            return Ok(TileRecords {
                source: RecordSource::Passthrough,
                records: Vec::new(),
            });
        }

        let eligibility = self.eligibility(request);
        if let (Eligibility::Eligible, Some(cache)) = (eligibility, self.cache.as_ref()) {
            if let Some(records) = self.cached_records(cache, request).await {
                self.metrics.cache_hit();
                return Ok(TileRecords {
                    source: RecordSource::Cached,
                    records,
                });
            }
            self.metrics.cache_miss();
        } else {
            debug!(%eligibility, "grid cache not used");
        }

        let records = self.live_records(request).await?;
        Ok(TileRecords {
            source: RecordSource::Live,
            records,
        })
    }

    /// Reads the request's cell, or starts population and returns `None`.
    async fn cached_records(&self, cache: &CacheStore, request: &TileRequest) -> Option<Vec<FeatureRecord>> {
        let fingerprint = Fingerprint::for_request(request);
        let precision = cache.precision_handle(&fingerprint, request.zoom());

        let status = precision.status().await;
        if status.oversized {
            return None;
        }
        if !status.populated {
            self.spawn_population(request);
            return None;
        }
        if cache.is_locked().await {
            debug!(%fingerprint, "population in progress, serving live");
            return None;
        }

        let tile = request.tile();
        match precision.read_cell(tile.x, tile.y).await {
            Ok(records) => Some(records),
            Err(e) => {
                warn!(%fingerprint, error = %e, "cell read failed, serving live");
                None
            }
        }
    }

    async fn live_records(&self, request: &TileRequest) -> Result<Vec<FeatureRecord>, TileError> {
        self.metrics.live_query();
        let body = self.queries.live_query(request);
        let response = match self.backend.search(body, SearchOptions::default()).await {
            Ok(r) => r,
            Err(e) => {
                self.metrics.live_query_failed();
                return Err(e.into());
            }
        };
        let includes = self.queries.source_includes(request);
        let mapper = RecordMapper::new(self.queries.geo_point_field(), &includes, request.data_type());
        Ok(mapper.map(&response))
    }

    /// Starts a tracked background population for `request`'s grid.
    ///
    /// No-op when caching is disabled.
    pub fn spawn_population(&self, request: &TileRequest) {
        let Some(pipeline) = self.pipeline.clone() else {
            return;
        };
        let job = PopulationJob::new(request, &self.queries);
        self.tracker.spawn(async move {
            pipeline.run(&job).await;
        });
    }

    /// Runs population for `request`'s grid in the foreground.
    ///
    /// Returns `None` when caching is disabled.
    pub async fn populate(&self, request: &TileRequest) -> Option<PopulationOutcome> {
        let pipeline = self.pipeline.as_ref()?;
        let job = PopulationJob::new(request, &self.queries);
        Some(pipeline.run(&job).await)
    }

    /// Renders one tile through `renderer`.
    pub async fn render(&self, request: &TileRequest, renderer: &dyn Renderer) -> Result<Vec<u8>, TileError> {
        let tile = self.records_for(request).await?;
        let bbox = request.bbox();

        if request.format() == OutputFormat::VectorGrid {
            let skip_top_hits = tile.source == RecordSource::Live && self.queries.skips_top_hits(request);
            let fields = grid_fields(request, &self.queries, skip_top_hits);
            return Ok(renderer.render_grid(request, &bbox, self.tile_size, &tile.records, &fields)?);
        }
        if tile.records.is_empty() && tile.source != RecordSource::Passthrough {
            return Ok(renderer.blank(self.tile_size)?);
        }
        Ok(renderer.render(request, &bbox, self.tile_size, &tile.records)?)
    }

    /// Documents matching the request's parameters, deduplicated across
    /// callers sharing the coordination store.
    pub async fn total_hits(&self, request: &TileRequest) -> Result<u64, TileError> {
        let fingerprint = Fingerprint::for_request(request);
        let body = self.queries.count_query(request);
        let options = SearchOptions::with_timeout(self.pipeline_config.count_timeout);
        let n = self
            .counts
            .count(&fingerprint, || self.backend.count(body, options))
            .await?;
        Ok(n)
    }

    /// Number of background populations still running.
    pub fn pending_populations(&self) -> usize {
        self.tracker.len()
    }

    /// Waits for background populations, bounded by `timeout`.
    ///
    /// # Returns
    ///
    /// `false` if populations were still running when the timeout elapsed.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.tracker.close();
        tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok()
    }
}
