//! Search response types.

use serde::Deserialize;
use serde_json::{Map, Value};

/// `hits.total` in either of the shapes backends return.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TotalHits {
    Object {
        value: u64,
        #[serde(default)]
        relation: Option<String>,
    },
    Number(u64),
}

impl TotalHits {
    pub fn value(&self) -> u64 {
        match self {
            TotalHits::Object { value, .. } => *value,
            TotalHits::Number(n) => *n,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Hit {
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    #[serde(rename = "_source", default)]
    pub source: Option<Map<String, Value>>,
    #[serde(default)]
    pub sort: Option<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct Hits {
    #[serde(default)]
    total: Option<TotalHits>,
    #[serde(default)]
    pub hits: Vec<Hit>,
}

impl Hits {
    pub fn new(total: u64, hits: Vec<Hit>) -> Self {
        Self {
            total: Some(TotalHits::Number(total)),
            hits,
        }
    }

    /// Normalized total hit count (0 when absent).
    pub fn total(&self) -> u64 {
        self.total.as_ref().map(TotalHits::value).unwrap_or(0)
    }
}

/// `top_hits` sub-aggregation result.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TopHits {
    pub hits: Hits,
}

impl TopHits {
    pub fn first(&self) -> Option<&Hit> {
        self.hits.hits.first()
    }
}

/// One bucket of a time-series terms aggregation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TermsBucket {
    pub key: Value,
    pub doc_count: u64,
    #[serde(rename = "geohash", default)]
    pub top_hits: Option<TopHits>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct TermsAggregation {
    #[serde(default)]
    pub buckets: Vec<TermsBucket>,
}

/// One geohash or geotile grid cell.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GridBucket {
    /// Geohash string or `z/x/y` geotile key.
    pub key: String,
    pub doc_count: u64,
    #[serde(rename = "geohash", default)]
    pub top_hits: Option<TopHits>,
    #[serde(default)]
    pub histogram: Option<TermsAggregation>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct GridAggregation {
    #[serde(default)]
    pub buckets: Vec<GridBucket>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct Aggregations {
    #[serde(rename = "zoom1", default)]
    pub grid: Option<GridAggregation>,
}

/// Body of a search response.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub hits: Hits,
    #[serde(default)]
    pub aggregations: Option<Aggregations>,
}

impl SearchResponse {
    /// Grid buckets, if the response carries a grid aggregation.
    pub fn grid_buckets(&self) -> Option<&[GridBucket]> {
        self.aggregations
            .as_ref()
            .and_then(|a| a.grid.as_ref())
            .map(|g| g.buckets.as_slice())
    }
}

/// Body of a count response: `{ "count": n }`, also accepted as `{ "value": n }`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct CountResponse {
    #[serde(alias = "value")]
    pub count: u64,
}
