//! Search request bodies.
//!
//! [`QueryBuilder`] turns a [`TileRequest`] into JSON bodies for the search
//! backend. It is stateless apart from its configuration and never touches
//! the network.
//!
//! Three bodies are produced:
//!
//! - the **live query** for a single tile, filtered to the tile's (smoothed)
//!   bounding box;
//! - the **cache fetch**, a world-wide geohash grid with one representative
//!   document per cell, fanned out into cell files by the population
//!   pipeline;
//! - the **count query**, the filter part of the cache fetch, sent to the
//!   count endpoint before the fetch is attempted.

use serde_json::{json, Map, Value};

use crate::geo::{self, BoundingBox};
use crate::request::{DataType, OutputFormat, Style, TileRequest};

/// Name of the grid aggregation in every body.
pub const GRID_AGGREGATION: &str = "zoom1";
/// Name of the per-cell top hit sub-aggregation.
pub const TOP_HITS_AGGREGATION: &str = "geohash";
/// Name of the time-series terms sub-aggregation.
pub const HISTOGRAM_AGGREGATION: &str = "histogram";

/// Default bucket cap for live grid aggregations.
pub const DEFAULT_LIVE_BUCKET_SIZE: u32 = 30_000;
/// Default bucket cap for the cache fetch.
pub const DEFAULT_CACHE_BUCKET_SIZE: u32 = 3_000_000;
/// Default hit count for the points style.
pub const DEFAULT_POINTS_HIT_SIZE: u32 = 10_000;
/// Terms returned per cell in a time-series aggregation.
pub const TIME_SERIES_TERMS_SIZE: u32 = 100;
/// Default indexed geo_point field.
pub const DEFAULT_GEO_POINT_FIELD: &str = "location";

/// Query builder settings.
#[derive(Debug, Clone)]
pub struct QueryConfig {
    pub geo_point_field: String,
    pub live_bucket_size: u32,
    pub cache_bucket_size: u32,
    pub points_hit_size: u32,
    pub smoothing_factor: f64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            geo_point_field: DEFAULT_GEO_POINT_FIELD.to_string(),
            live_bucket_size: DEFAULT_LIVE_BUCKET_SIZE,
            cache_bucket_size: DEFAULT_CACHE_BUCKET_SIZE,
            points_hit_size: DEFAULT_POINTS_HIT_SIZE,
            smoothing_factor: geo::DEFAULT_SMOOTHING_FACTOR,
        }
    }
}

impl QueryConfig {
    pub fn with_geo_point_field(mut self, field: impl Into<String>) -> Self {
        self.geo_point_field = field.into();
        self
    }

    pub fn with_live_bucket_size(mut self, size: u32) -> Self {
        self.live_bucket_size = size;
        self
    }

    pub fn with_cache_bucket_size(mut self, size: u32) -> Self {
        self.cache_bucket_size = size;
        self
    }
}

/// Builds search bodies for tile requests.
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    config: QueryConfig,
}

impl QueryBuilder {
    pub fn new(config: QueryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub fn geo_point_field(&self) -> &str {
        &self.config.geo_point_field
    }

    /// Fields returned for each document: the `source` parameter when given,
    /// otherwise the id and the geo field.
    pub fn source_includes(&self, request: &TileRequest) -> Vec<String> {
        match request.source_fields() {
            Some(fields) if !fields.is_empty() => fields,
            _ => vec!["id".to_string(), self.config.geo_point_field.clone()],
        }
    }

    /// Bounding-box filter clause.
    ///
    /// With `smoothing` the box is first grown by the configured factor. A
    /// box that then wraps the antimeridian becomes a `bool.should` over its
    /// two halves; the halves are never smoothed again.
    pub fn bbox_filter(&self, bbox: &BoundingBox, smoothing: bool) -> Value {
        let bbox = if smoothing {
            geo::expand_for_smoothing(bbox, self.config.smoothing_factor)
        } else {
            *bbox
        };

        if let Some((east, west)) = geo::split_antimeridian(&bbox) {
            return json!({
                "bool": {
                    "should": [
                        self.bbox_filter(&east, false),
                        self.bbox_filter(&west, false),
                    ]
                }
            });
        }

        let mut inner = Map::new();
        inner.insert(
            self.config.geo_point_field.clone(),
            json!({
                "bottom_left": [bbox.min_lon, bbox.min_lat],
                "top_right": [bbox.max_lon, bbox.max_lat],
            }),
        );
        inner.insert("type".to_string(), json!("indexed"));
        json!({ "geo_bounding_box": Value::Object(inner) })
    }

    fn top_hits(&self, request: &TileRequest) -> Value {
        json!({
            "top_hits": {
                "sort": { "id": { "order": "desc" } },
                "_source": { "includes": self.source_includes(request) },
                "size": 1
            }
        })
    }

    fn grid_clause(&self, style: Style, request: &TileRequest, size: u32) -> Value {
        match style {
            Style::Geotile => json!({
                "geotile_grid": {
                    "field": self.config.geo_point_field,
                    "size": size,
                    "precision": geo::geotile_precision(request.zoom(), request.precision_offset()),
                }
            }),
            _ => json!({
                "geohash_grid": {
                    "field": self.config.geo_point_field,
                    "size": size,
                    "precision": request.geohash_precision(),
                }
            }),
        }
    }

    /// Grid aggregation for the request's style.
    ///
    /// # Arguments
    ///
    /// * `request` - Request supplying zoom, offset and source fields
    /// * `size` - Maximum bucket count
    /// * `include_top_hits` - Attach one representative document per cell
    pub fn grid_aggregation(&self, request: &TileRequest, size: u32, include_top_hits: bool) -> Value {
        self.grid_aggregation_for(request.style(), request, size, include_top_hits)
    }

    fn grid_aggregation_for(
        &self,
        style: Style,
        request: &TileRequest,
        size: u32,
        include_top_hits: bool,
    ) -> Value {
        let mut grid = self.grid_clause(style, request, size);
        if include_top_hits {
            grid["aggs"] = json!({ TOP_HITS_AGGREGATION: self.top_hits(request) });
        }
        json!({ GRID_AGGREGATION: grid })
    }

    /// Grid aggregation bucketing each cell's documents by week or month.
    pub fn time_series_aggregation(&self, request: &TileRequest, size: u32) -> Value {
        let mut grid = self.grid_clause(request.style(), request, size);
        grid["aggs"] = json!({
            HISTOGRAM_AGGREGATION: {
                "terms": {
                    "field": format!("observed_on_details.{}", request.interval().field_suffix()),
                    "size": TIME_SERIES_TERMS_SIZE,
                },
                "aggs": { TOP_HITS_AGGREGATION: self.top_hits(request) }
            }
        });
        json!({ GRID_AGGREGATION: grid })
    }

    /// Filter clauses shared by every body: the caller's filters.
    fn base_filters(&self, request: &TileRequest) -> Vec<Value> {
        request.filters().to_vec()
    }

    fn base_body(&self, request: &TileRequest, filters: Vec<Value>) -> Value {
        json!({
            "sort": { "id": "desc" },
            "_source": { "includes": self.source_includes(request) },
            "query": { "bool": { "filter": filters } },
        })
    }

    /// True when the live query can skip per-cell top hits.
    pub fn skips_top_hits(&self, request: &TileRequest) -> bool {
        request.style().is_grid() && request.format() == OutputFormat::Image
    }

    /// Body for serving one tile directly from the backend.
    pub fn live_query(&self, request: &TileRequest) -> Value {
        let mut filters = self.base_filters(request);
        if request.data_type() == DataType::Search {
            let smoothing = request.format() != OutputFormat::TimeSeries;
            filters.push(self.bbox_filter(&request.bbox(), smoothing));
        }
        let mut body = self.base_body(request, filters);

        match request.style() {
            Style::Points => {
                body["size"] = json!(self.config.points_hit_size);
            }
            Style::Geohash | Style::Geotile => {
                body["size"] = json!(0);
                body["aggregations"] = if request.format() == OutputFormat::TimeSeries {
                    self.time_series_aggregation(request, self.config.live_bucket_size)
                } else {
                    self.grid_aggregation(
                        request,
                        self.config.live_bucket_size,
                        !self.skips_top_hits(request),
                    )
                };
            }
        }
        body
    }

    /// Body for fetching a whole zoom level's grid in one query.
    ///
    /// Unbounded by tile and always a geohash grid with top hits, so the
    /// cells it produces can serve every grid style and output format.
    pub fn cache_fetch_query(&self, request: &TileRequest) -> Value {
        let mut body = self.base_body(request, self.base_filters(request));
        body["size"] = json!(0);
        body["aggregations"] = self.grid_aggregation_for(
            Style::Geohash,
            request,
            self.config.cache_bucket_size,
            true,
        );
        body
    }

    /// Body for the count endpoint matching the cache fetch's documents.
    pub fn count_query(&self, request: &TileRequest) -> Value {
        json!({ "query": { "bool": { "filter": self.base_filters(request) } } })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> QueryBuilder {
        QueryBuilder::new(QueryConfig::default())
    }

    fn request(style: &str, format: &str) -> TileRequest {
        TileRequest::builder(style, 8, 40, 90, format)
            .param("taxon_id", "3")
            .filter(json!({ "term": { "taxon_id": 3 } }))
            .build()
            .unwrap()
    }

    #[test]
    fn test_bbox_filter_shape() {
        let filter = builder().bbox_filter(&BoundingBox::new(0.0, 0.0, 1.0, 1.0), false);
        assert_eq!(
            filter,
            json!({
                "geo_bounding_box": {
                    "location": { "bottom_left": [0.0, 0.0], "top_right": [1.0, 1.0] },
                    "type": "indexed"
                }
            })
        );
    }

    #[test]
    fn test_bbox_filter_smoothed() {
        let filter = builder().bbox_filter(&BoundingBox::new(0.0, 0.0, 1.0, 1.0), true);
        let bl = filter["geo_bounding_box"]["location"]["bottom_left"][0].as_f64().unwrap();
        let tr = filter["geo_bounding_box"]["location"]["top_right"][1].as_f64().unwrap();
        assert!((bl + 0.07).abs() < 1e-9);
        assert!((tr - 1.07).abs() < 1e-9);
    }

    #[test]
    fn test_bbox_filter_wrapped_splits() {
        let filter = builder().bbox_filter(&BoundingBox::new(179.0, 1.0, -179.0, 2.0), false);
        let should = filter["bool"]["should"].as_array().unwrap();
        assert_eq!(should.len(), 2);
        assert_eq!(
            should[0]["geo_bounding_box"]["location"]["top_right"],
            json!([180.0, 2.0])
        );
        assert_eq!(
            should[1]["geo_bounding_box"]["location"]["bottom_left"],
            json!([-180.0, 1.0])
        );
    }

    #[test]
    fn test_custom_geo_field() {
        let qb = QueryBuilder::new(QueryConfig::default().with_geo_point_field("geo"));
        let filter = qb.bbox_filter(&BoundingBox::new(0.0, 0.0, 1.0, 1.0), false);
        assert!(filter["geo_bounding_box"].get("geo").is_some());
    }

    #[test]
    fn test_live_points_query() {
        let body = builder().live_query(&request("points", "png"));
        assert_eq!(body["size"], json!(10_000));
        assert!(body.get("aggregations").is_none());
        assert_eq!(body["sort"], json!({ "id": "desc" }));
        assert_eq!(body["_source"]["includes"], json!(["id", "location"]));
        let filters = body["query"]["bool"]["filter"].as_array().unwrap();
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0], json!({ "term": { "taxon_id": 3 } }));
    }

    #[test]
    fn test_live_geohash_png_skips_top_hits() {
        let body = builder().live_query(&request("geohash", "png"));
        assert_eq!(body["size"], json!(0));
        let grid = &body["aggregations"]["zoom1"];
        assert_eq!(grid["geohash_grid"]["precision"], json!(6));
        assert_eq!(grid["geohash_grid"]["size"], json!(30_000));
        assert!(grid.get("aggs").is_none());
    }

    #[test]
    fn test_live_geohash_grid_json_has_top_hits() {
        let req = TileRequest::builder("geohash", 8, 40, 90, "grid.json")
            .param("source", "id,user.login")
            .build()
            .unwrap();
        let body = builder().live_query(&req);
        let top = &body["aggregations"]["zoom1"]["aggs"]["geohash"]["top_hits"];
        assert_eq!(top["size"], json!(1));
        assert_eq!(top["_source"]["includes"], json!(["id", "user.login"]));
        assert_eq!(top["sort"], json!({ "id": { "order": "desc" } }));
    }

    #[test]
    fn test_live_geotile_uses_tile_precision() {
        let body = builder().live_query(&request("geotile", "grid.json"));
        let grid = &body["aggregations"]["zoom1"]["geotile_grid"];
        assert_eq!(grid["precision"], json!(13));
    }

    #[test]
    fn test_time_series_aggregation() {
        let req = TileRequest::builder("geohash", 8, 40, 90, "torque.json")
            .param("interval", "weekly")
            .build()
            .unwrap();
        let body = builder().live_query(&req);
        let hist = &body["aggregations"]["zoom1"]["aggs"]["histogram"];
        assert_eq!(hist["terms"]["field"], json!("observed_on_details.week"));
        assert_eq!(hist["terms"]["size"], json!(100));
        assert!(hist["aggs"]["geohash"]["top_hits"].is_object());
    }

    #[test]
    fn test_passthrough_data_type_has_no_bbox_filter() {
        let req = TileRequest::builder("points", 8, 40, 90, "png")
            .data_type("geojson")
            .build()
            .unwrap();
        let body = builder().live_query(&req);
        assert!(body["query"]["bool"]["filter"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_cache_fetch_query() {
        let body = builder().cache_fetch_query(&request("geotile", "png"));
        let grid = &body["aggregations"]["zoom1"];
        assert_eq!(grid["geohash_grid"]["size"], json!(3_000_000));
        assert_eq!(grid["geohash_grid"]["precision"], json!(6));
        assert!(grid["aggs"]["geohash"]["top_hits"].is_object());
        // world-wide: only the caller's filters
        assert_eq!(body["query"]["bool"]["filter"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_count_query() {
        let body = builder().count_query(&request("geohash", "png"));
        assert_eq!(
            body,
            json!({ "query": { "bool": { "filter": [{ "term": { "taxon_id": 3 } }] } } })
        );
    }
}
