//! Arguments and wiring shared across commands.

use std::sync::Arc;

use clap::Args;
use serde_json::Value;

use gridcache::backend::ElasticsearchClient;
use gridcache::cache::CacheStore;
use gridcache::config::{ConfigFile, CoordinationBackend};
use gridcache::query::QueryBuilder;
use gridcache::request::TileRequest;
use gridcache::service::{ServiceContext, TileService};
use gridcache::store::{CoordinationStore, FileStore, MemoryStore};

use crate::error::CliError;

/// Key prefix for Redis coordination keys.
#[cfg(feature = "redis-store")]
const REDIS_PREFIX: &str = "gridcache:";

/// One tile, as the HTTP layer would receive it.
#[derive(Debug, Clone, Args)]
pub struct TileArgs {
    /// Style: points, geohash or geotile
    pub style: String,

    /// Zoom level
    pub z: i64,

    /// Tile column
    pub x: i64,

    /// Tile row
    pub y: i64,

    /// Output format: png, grid.json or torque.json
    #[arg(long, default_value = "png")]
    pub format: String,

    /// Data type: search, geojson or postgis
    #[arg(long, default_value = "search")]
    pub data_type: String,

    /// Query parameter as key=value (repeatable)
    #[arg(short = 'p', long = "param", value_parser = parse_key_value)]
    pub params: Vec<(String, String)>,

    /// Search filter clause as JSON (repeatable)
    #[arg(long = "filter", value_parser = parse_filter)]
    pub filters: Vec<Value>,
}

impl TileArgs {
    pub fn to_request(&self) -> Result<TileRequest, CliError> {
        let mut builder = TileRequest::builder(self.style.as_str(), self.z, self.x, self.y, self.format.as_str())
            .params(self.params.iter().cloned())
            .data_type(self.data_type.as_str());
        for filter in &self.filters {
            builder = builder.filter(filter.clone());
        }
        Ok(builder.build()?)
    }
}

/// Parses `key=value`.
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}

fn parse_filter(s: &str) -> Result<Value, String> {
    match serde_json::from_str(s) {
        Ok(v @ Value::Object(_)) => Ok(v),
        Ok(_) => Err("filter must be a JSON object".to_string()),
        Err(e) => Err(format!("invalid JSON: {}", e)),
    }
}

/// Opens the configured coordination store.
pub async fn coordination_store(config: &ConfigFile) -> Result<Arc<dyn CoordinationStore>, CliError> {
    match config.coordination.backend {
        CoordinationBackend::File => Ok(Arc::new(FileStore::new(config.coordination_directory()))),
        CoordinationBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        CoordinationBackend::Redis => redis_store(config).await,
    }
}

#[cfg(feature = "redis-store")]
async fn redis_store(config: &ConfigFile) -> Result<Arc<dyn CoordinationStore>, CliError> {
    let url = config
        .coordination
        .redis_url
        .as_deref()
        .ok_or_else(|| CliError::Config("coordination.redis_url is not set".to_string()))?;
    let store = gridcache::store::RedisStore::connect(url, REDIS_PREFIX).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis-store"))]
async fn redis_store(_config: &ConfigFile) -> Result<Arc<dyn CoordinationStore>, CliError> {
    Err(CliError::Config(
        "coordination.backend = redis requires building with --features redis-store".to_string(),
    ))
}

/// Builds the tile service from configuration.
pub async fn build_service(config: &ConfigFile) -> Result<TileService, CliError> {
    let backend = Arc::new(ElasticsearchClient::new(config.elasticsearch_config())?);
    let coordination = coordination_store(config).await?;

    let mut context = ServiceContext::new(backend, coordination)
        .with_queries(QueryBuilder::new(config.query_config()))
        .with_pipeline(config.pipeline_config())
        .with_reservations(config.reservation_config());
    if let Some(cache) = CacheStore::from_config(&config.cache_config()) {
        context = context.with_cache(cache);
    }
    context.tile_size = config.render.tile_size;
    Ok(TileService::new(context))
}

/// The configured cache root, or a configuration error.
pub fn require_cache(config: &ConfigFile) -> Result<CacheStore, CliError> {
    CacheStore::from_config(&config.cache_config())
        .ok_or_else(|| CliError::Config("cache.directory is not set".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(params: &[(&str, &str)]) -> TileArgs {
        TileArgs {
            style: "geohash".to_string(),
            z: 4,
            x: 8,
            y: 5,
            format: "png".to_string(),
            data_type: "search".to_string(),
            params: params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            filters: vec![serde_json::json!({ "term": { "taxon_id": 47 } })],
        }
    }

    #[test]
    fn test_parse_key_value() {
        assert_eq!(parse_key_value("taxon_id=47").unwrap(), ("taxon_id".to_string(), "47".to_string()));
        assert_eq!(parse_key_value("q=a=b").unwrap(), ("q".to_string(), "a=b".to_string()));
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }

    #[test]
    fn test_parse_filter() {
        assert!(parse_filter(r#"{"term":{"a":1}}"#).is_ok());
        assert!(parse_filter("[1]").is_err());
        assert!(parse_filter("{").is_err());
    }

    #[test]
    fn test_to_request() {
        let request = args(&[("taxon_id", "47"), ("cache", "true")]).to_request().unwrap();
        assert_eq!(request.zoom(), 4);
        assert!(request.cache_requested());
        assert_eq!(request.filters().len(), 1);

        let mut bad = args(&[]);
        bad.x = 99;
        assert!(matches!(bad.to_request(), Err(CliError::Request(_))));
    }

    #[tokio::test]
    async fn test_file_coordination_store() {
        let dir = TempDir::new().unwrap();
        let mut config = ConfigFile::default();
        config.cache.directory = Some(dir.path().to_path_buf());
        let store = coordination_store(&config).await.unwrap();
        store
            .set("marker", "1", std::time::Duration::from_secs(5))
            .await
            .unwrap();
        assert!(dir.path().join("coordination").is_dir());
    }

    #[test]
    fn test_require_cache() {
        assert!(require_cache(&ConfigFile::default()).is_err());
    }
}
