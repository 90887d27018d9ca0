//! Search backend contract.
//!
//! The engine only needs two calls from the search backend: a search that
//! returns hits and aggregations, and a count. [`SearchBackend`] captures
//! that contract so the production [`ElasticsearchClient`] and test doubles
//! are interchangeable behind an `Arc<dyn SearchBackend>`.
//!
//! Responses are normalized at this boundary: `hits.total` may arrive as a
//! bare number or as `{ "value": n }` and is always exposed as a `u64`.

mod elasticsearch;
mod mapper;
mod response;

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::BoxFuture;

pub use elasticsearch::{ElasticsearchClient, ElasticsearchConfig};
pub use mapper::{FeatureRecord, RecordMapper, FIELD_CELL_COUNT, FIELD_HISTOGRAM, FIELD_LATITUDE, FIELD_LONGITUDE};
pub use response::{
    Aggregations, CountResponse, GridAggregation, GridBucket, Hit, Hits, SearchResponse, TermsBucket,
    TermsAggregation, TopHits, TotalHits,
};

/// Errors from the search backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The request did not complete within its timeout.
    #[error("search request timed out")]
    Timeout,

    /// Transport-level failure (connect, TLS, body read).
    #[error("HTTP error: {0}")]
    Http(String),

    /// The backend answered with a non-success status.
    #[error("search backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body did not have the expected shape.
    #[error("malformed search response: {0}")]
    Malformed(String),
}

impl BackendError {
    /// True for timeouts, which the population pipeline treats as "too big".
    pub fn is_timeout(&self) -> bool {
        matches!(self, BackendError::Timeout)
    }
}

/// Per-call options for a search or count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchOptions {
    /// Request timeout; `None` uses the client's default.
    pub timeout: Option<Duration>,
}

impl SearchOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// Search backend consumed by the query and population paths.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so implementations can be shared as
/// `Arc<dyn SearchBackend>` through the service context.
pub trait SearchBackend: Send + Sync {
    /// Runs a search body and returns hits and aggregations.
    fn search(&self, body: Value, options: SearchOptions) -> BoxFuture<'_, Result<SearchResponse, BackendError>>;

    /// Counts the documents matching a `{ "query": ... }` body.
    fn count(&self, body: Value, options: SearchOptions) -> BoxFuture<'_, Result<u64, BackendError>>;
}
