//! Configuration sections and their conversions into library settings.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::backend::ElasticsearchConfig;
use crate::cache::{CacheConfig, DEFAULT_DATA_TTL, DEFAULT_EDGE_MARGIN, DEFAULT_LOCK_TTL};
use crate::pipeline::{
    PipelineConfig, DEFAULT_COUNT_TIMEOUT, DEFAULT_FETCH_TIMEOUT, DEFAULT_HIGH_THRESHOLD, DEFAULT_LOWER_THRESHOLD,
    DEFAULT_WRITE_CONCURRENCY,
};
use crate::query::{QueryConfig, DEFAULT_GEO_POINT_FIELD};
use crate::reservation::ReservationConfig;
use crate::service::DEFAULT_TILE_SIZE;

/// Whole configuration file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConfigFile {
    pub elasticsearch: ElasticsearchSettings,
    pub cache: CacheSettings,
    pub coordination: CoordinationSettings,
    pub render: RenderSettings,
}

/// `[elasticsearch]`
#[derive(Debug, Clone, PartialEq)]
pub struct ElasticsearchSettings {
    pub url: String,
    pub index: String,
    pub geo_point_field: String,
    pub preference: String,
    /// Seconds.
    pub request_timeout: u64,
}

impl Default for ElasticsearchSettings {
    fn default() -> Self {
        let es = ElasticsearchConfig::default();
        Self {
            url: es.url,
            index: es.index,
            geo_point_field: DEFAULT_GEO_POINT_FIELD.to_string(),
            preference: es.preference,
            request_timeout: es.request_timeout.as_secs(),
        }
    }
}

/// `[cache]`. Durations are in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSettings {
    /// Grid cache root; unset disables grid caching.
    pub directory: Option<PathBuf>,
    pub data_ttl: u64,
    pub lock_ttl: u64,
    pub count_timeout: u64,
    pub fetch_timeout: u64,
    pub lower_threshold: u64,
    pub high_threshold: u64,
    pub write_concurrency: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            directory: None,
            data_ttl: DEFAULT_DATA_TTL.as_secs(),
            lock_ttl: DEFAULT_LOCK_TTL.as_secs(),
            count_timeout: DEFAULT_COUNT_TIMEOUT.as_secs(),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT.as_secs(),
            lower_threshold: DEFAULT_LOWER_THRESHOLD,
            high_threshold: DEFAULT_HIGH_THRESHOLD,
            write_concurrency: DEFAULT_WRITE_CONCURRENCY,
        }
    }
}

/// Where count values and count locks live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoordinationBackend {
    /// Marker files under the configuration directory.
    #[default]
    File,
    /// Process-local; only deduplicates within one process.
    Memory,
    /// Shared Redis server.
    Redis,
}

impl CoordinationBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinationBackend::File => "file",
            CoordinationBackend::Memory => "memory",
            CoordinationBackend::Redis => "redis",
        }
    }
}

impl FromStr for CoordinationBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "file" => Ok(CoordinationBackend::File),
            "memory" => Ok(CoordinationBackend::Memory),
            "redis" => Ok(CoordinationBackend::Redis),
            _ => Err(()),
        }
    }
}

/// `[coordination]`
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinationSettings {
    pub backend: CoordinationBackend,
    pub redis_url: Option<String>,
    /// Seconds a count value is reused.
    pub count_ttl: u64,
    /// Seconds a count waiter waits before counting itself.
    pub wait_timeout: u64,
    pub poll_interval_ms: u64,
}

impl Default for CoordinationSettings {
    fn default() -> Self {
        let reservations = ReservationConfig::default();
        Self {
            backend: CoordinationBackend::default(),
            redis_url: None,
            count_ttl: reservations.count_ttl.as_secs(),
            wait_timeout: reservations.wait_timeout.as_secs(),
            poll_interval_ms: reservations.poll_interval.as_millis() as u64,
        }
    }
}

/// `[render]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderSettings {
    pub tile_size: u32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
        }
    }
}

impl ConfigFile {
    pub fn elasticsearch_config(&self) -> ElasticsearchConfig {
        ElasticsearchConfig {
            url: self.elasticsearch.url.clone(),
            index: self.elasticsearch.index.clone(),
            preference: self.elasticsearch.preference.clone(),
            request_timeout: Duration::from_secs(self.elasticsearch.request_timeout),
        }
    }

    pub fn query_config(&self) -> QueryConfig {
        QueryConfig::default().with_geo_point_field(self.elasticsearch.geo_point_field.clone())
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            directory: self.cache.directory.clone(),
            data_ttl: Duration::from_secs(self.cache.data_ttl),
            lock_ttl: Duration::from_secs(self.cache.lock_ttl),
            edge_margin: DEFAULT_EDGE_MARGIN,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig::default()
            .with_count_timeout(Duration::from_secs(self.cache.count_timeout))
            .with_fetch_timeout(Duration::from_secs(self.cache.fetch_timeout))
            .with_thresholds(self.cache.lower_threshold, self.cache.high_threshold)
            .with_write_concurrency(self.cache.write_concurrency)
    }

    pub fn reservation_config(&self) -> ReservationConfig {
        ReservationConfig::default()
            .with_count_ttl(Duration::from_secs(self.coordination.count_ttl))
            .with_wait_timeout(Duration::from_secs(self.coordination.wait_timeout))
            .with_poll_interval(Duration::from_millis(self.coordination.poll_interval_ms))
    }
}
