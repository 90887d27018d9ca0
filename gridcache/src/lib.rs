//! gridcache - tile cache and query deduplication for aggregation-backed maps
//!
//! Map tiles rendered from a search backend's grid aggregations are costly to
//! compute. This library caches one whole-zoom aggregation per query as
//! per-tile cell files, and keeps concurrent servers from running the same
//! expensive query twice.
//!
//! # High-Level API
//!
//! [`service::TileService`] is the entry point:
//!
//! ```ignore
//! use std::sync::Arc;
//! use gridcache::backend::{ElasticsearchClient, ElasticsearchConfig};
//! use gridcache::cache::CacheStore;
//! use gridcache::request::TileRequest;
//! use gridcache::service::{ServiceContext, TileService};
//! use gridcache::store::MemoryStore;
//!
//! let backend = Arc::new(ElasticsearchClient::new(ElasticsearchConfig::default())?);
//! let context = ServiceContext::new(backend, Arc::new(MemoryStore::new()))
//!     .with_cache(CacheStore::new("/var/cache/tiles", ttl, lock_ttl));
//! let service = TileService::new(context);
//!
//! let request = TileRequest::builder("geohash", 4, 8, 5, "png")
//!     .param("taxon_id", "47")
//!     .param("cache", "true")
//!     .build()?;
//! let tile = service.records_for(&request).await?;
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod backend;
pub mod cache;
pub mod config;
pub mod fingerprint;
pub mod geo;
pub mod logging;
pub mod pipeline;
pub mod query;
pub mod request;
pub mod reservation;
pub mod service;
pub mod store;
pub mod telemetry;

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Version of the library and CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
