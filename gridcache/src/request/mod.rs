//! Tile request model.
//!
//! A [`TileRequest`] is built once per inbound call through
//! [`TileRequestBuilder`], validated, and never mutated afterwards. Stages
//! that need derived values (bounding box, precision, fingerprint) compute
//! them from the request instead of attaching them to it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use thiserror::Error;

use crate::geo::{self, BoundingBox, GeoError, TileCoord, MAX_ZOOM};

/// Query parameter: comma-separated `_source` fields to return.
pub const PARAM_SOURCE: &str = "source";
/// Query parameter: non-negative precision coarsening offset.
pub const PARAM_PRECISION_OFFSET: &str = "precision_offset";
/// Query parameter: time-series bucketing interval (`weekly` or `monthly`).
pub const PARAM_INTERVAL: &str = "interval";
/// Query parameter: requested cache lifetime in seconds.
pub const PARAM_TTL: &str = "ttl";
/// Query parameter: opt in to grid caching.
pub const PARAM_CACHE: &str = "cache";

/// Errors raised while validating a tile request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Invalid zoom: {0}")]
    InvalidZoom(i64),

    #[error("Invalid x value: {0}")]
    InvalidX(i64),

    #[error("Invalid y value: {0}")]
    InvalidY(i64),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("unknown style: {0}")]
    UnknownStyle(String),

    #[error("Invalid data type: {0}")]
    InvalidDataType(String),

    #[error("Invalid parameter {key}={value}: {reason}")]
    InvalidParam {
        key: String,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Geo(#[from] GeoError),
}

/// Tile style, which decides the shape of the backend query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Style {
    /// Raw documents, one per hit.
    Points,
    /// Documents bucketed by geohash cell.
    Geohash,
    /// Documents bucketed by map tile cell.
    Geotile,
}

impl Style {
    /// True for styles served by a grid aggregation.
    pub fn is_grid(&self) -> bool {
        matches!(self, Style::Geohash | Style::Geotile)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Style::Points => "points",
            Style::Geohash => "geohash",
            Style::Geotile => "geotile",
        }
    }
}

impl FromStr for Style {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "points" => Ok(Style::Points),
            "geohash" => Ok(Style::Geohash),
            "geotile" => Ok(Style::Geotile),
            other => Err(ValidationError::UnknownStyle(other.to_string())),
        }
    }
}

impl fmt::Display for Style {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output encoding requested for the tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    /// Raster image (`png`).
    Image,
    /// UTF grid of feature attributes (`grid.json`).
    VectorGrid,
    /// Per-cell time histogram (`torque.json`).
    TimeSeries,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Image => "png",
            OutputFormat::VectorGrid => "grid.json",
            OutputFormat::TimeSeries => "torque.json",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "png" => Ok(OutputFormat::Image),
            "grid.json" => Ok(OutputFormat::VectorGrid),
            "torque.json" => Ok(OutputFormat::TimeSeries),
            other => Err(ValidationError::InvalidFormat(other.to_string())),
        }
    }
}

/// Where a request's features come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataType {
    /// Search backend documents filtered to the tile.
    #[default]
    Search,
    /// Search backend shapes, not bounding-box filtered.
    GeoJson,
    /// Features the renderer loads itself; no search query is issued.
    Postgis,
}

impl DataType {
    /// True when the tile's bounding box must not be added as a filter.
    pub fn is_passthrough(&self) -> bool {
        matches!(self, DataType::GeoJson | DataType::Postgis)
    }
}

impl FromStr for DataType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "search" => Ok(DataType::Search),
            "geojson" => Ok(DataType::GeoJson),
            "postgis" => Ok(DataType::Postgis),
            other => Err(ValidationError::InvalidDataType(other.to_string())),
        }
    }
}

/// Time-series bucketing interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interval {
    Weekly,
    #[default]
    Monthly,
}

impl Interval {
    /// Name of the date-detail field component for this interval.
    pub fn field_suffix(&self) -> &'static str {
        match self {
            Interval::Weekly => "week",
            Interval::Monthly => "month",
        }
    }
}

/// Raw query parameters, ordered by key.
pub type QueryParams = BTreeMap<String, String>;

/// A validated, immutable tile request.
#[derive(Debug, Clone, PartialEq)]
pub struct TileRequest {
    style: Style,
    tile: TileCoord,
    format: OutputFormat,
    data_type: DataType,
    params: QueryParams,
    filters: Vec<Value>,
    precision_offset: u8,
    interval: Interval,
    ttl: Option<u64>,
}

impl TileRequest {
    /// Starts building a request for `style/zoom/x/y.format`.
    pub fn builder(
        style: impl Into<String>,
        zoom: i64,
        x: i64,
        y: i64,
        format: impl Into<String>,
    ) -> TileRequestBuilder {
        TileRequestBuilder {
            style: style.into(),
            zoom,
            x,
            y,
            format: format.into(),
            data_type: None,
            params: QueryParams::new(),
            filters: Vec::new(),
        }
    }

    pub fn style(&self) -> Style {
        self.style
    }

    pub fn tile(&self) -> TileCoord {
        self.tile
    }

    pub fn zoom(&self) -> u8 {
        self.tile.zoom
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// All query parameters as received.
    pub fn params(&self) -> &QueryParams {
        &self.params
    }

    /// Pre-built filter clauses supplied by the request layer.
    pub fn filters(&self) -> &[Value] {
        &self.filters
    }

    pub fn precision_offset(&self) -> u8 {
        self.precision_offset
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    /// Cache lifetime requested by the caller, in seconds.
    pub fn ttl(&self) -> Option<u64> {
        self.ttl
    }

    /// True when the caller opted in to grid caching.
    pub fn cache_requested(&self) -> bool {
        self.params
            .get(PARAM_CACHE)
            .map(|v| matches!(v.as_str(), "true" | "1" | "yes"))
            .unwrap_or(false)
    }

    /// Fields explicitly requested through the `source` parameter.
    pub fn source_fields(&self) -> Option<Vec<String>> {
        self.params.get(PARAM_SOURCE).map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(String::from)
                .collect()
        })
    }

    /// Geohash precision for this request's zoom and offset.
    pub fn geohash_precision(&self) -> u8 {
        geo::precision_for_zoom(self.tile.zoom, self.precision_offset)
    }

    /// Lon/lat box covered by the requested tile.
    pub fn bbox(&self) -> BoundingBox {
        geo::bbox_from_tile(&self.tile)
    }
}

/// Builder for [`TileRequest`]; `build()` performs all validation.
#[derive(Debug, Clone)]
pub struct TileRequestBuilder {
    style: String,
    zoom: i64,
    x: i64,
    y: i64,
    format: String,
    data_type: Option<String>,
    params: QueryParams,
    filters: Vec<Value>,
}

impl TileRequestBuilder {
    /// Adds a query parameter, replacing any previous value for the key.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Adds several query parameters.
    pub fn params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in params {
            self.params.insert(k.into(), v.into());
        }
        self
    }

    /// Adds a pre-built filter clause.
    pub fn filter(mut self, clause: Value) -> Self {
        self.filters.push(clause);
        self
    }

    /// Overrides the data type (`search`, `geojson`, `postgis`).
    pub fn data_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = Some(data_type.into());
        self
    }

    pub fn build(self) -> Result<TileRequest, ValidationError> {
        if self.zoom < 0 || self.zoom > MAX_ZOOM as i64 {
            return Err(ValidationError::InvalidZoom(self.zoom));
        }
        let zoom = self.zoom as u8;
        let dimension = geo::grid_size(zoom) as i64;
        if self.x < 0 || self.x >= dimension {
            return Err(ValidationError::InvalidX(self.x));
        }
        if self.y < 0 || self.y >= dimension {
            return Err(ValidationError::InvalidY(self.y));
        }
        let format: OutputFormat = self.format.parse()?;
        let style: Style = self.style.parse()?;
        let data_type: DataType = match self.data_type {
            Some(ref d) => d.parse()?,
            None => DataType::default(),
        };
        let tile = TileCoord::new(self.x as u32, self.y as u32, zoom)?;

        let precision_offset = match self.params.get(PARAM_PRECISION_OFFSET) {
            Some(v) => v.parse::<u8>().map_err(|_| ValidationError::InvalidParam {
                key: PARAM_PRECISION_OFFSET.to_string(),
                value: v.clone(),
                reason: "must be a non-negative integer".to_string(),
            })?,
            None => 0,
        };

        let interval = match self.params.get(PARAM_INTERVAL).map(String::as_str) {
            Some("weekly") => Interval::Weekly,
            Some("monthly") | None => Interval::Monthly,
            Some(other) => {
                return Err(ValidationError::InvalidParam {
                    key: PARAM_INTERVAL.to_string(),
                    value: other.to_string(),
                    reason: "must be 'weekly' or 'monthly'".to_string(),
                })
            }
        };

        let ttl = match self.params.get(PARAM_TTL) {
            Some(v) => Some(v.parse::<u64>().map_err(|_| ValidationError::InvalidParam {
                key: PARAM_TTL.to_string(),
                value: v.clone(),
                reason: "must be a positive integer (seconds)".to_string(),
            })?),
            None => None,
        };

        Ok(TileRequest {
            style,
            tile,
            format,
            data_type,
            params: self.params,
            filters: self.filters,
            precision_offset,
            interval,
            ttl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_valid_request() {
        let req = TileRequest::builder("geohash", 10, 511, 340, "png")
            .param("taxon_id", "3")
            .build()
            .unwrap();
        assert_eq!(req.style(), Style::Geohash);
        assert_eq!(req.zoom(), 10);
        assert_eq!(req.tile().x, 511);
        assert_eq!(req.tile().y, 340);
        assert_eq!(req.format(), OutputFormat::Image);
        assert_eq!(req.data_type(), DataType::Search);
        assert_eq!(req.params().get("taxon_id").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_rejects_bad_zoom() {
        let err = TileRequest::builder("points", 22, 0, 0, "png").build().unwrap_err();
        assert_eq!(err, ValidationError::InvalidZoom(22));
        let err = TileRequest::builder("points", -1, 0, 0, "png").build().unwrap_err();
        assert_eq!(err, ValidationError::InvalidZoom(-1));
    }

    #[test]
    fn test_rejects_out_of_grid_xy() {
        let err = TileRequest::builder("points", 2, 4, 0, "png").build().unwrap_err();
        assert_eq!(err, ValidationError::InvalidX(4));
        let err = TileRequest::builder("points", 2, 0, -1, "png").build().unwrap_err();
        assert_eq!(err, ValidationError::InvalidY(-1));
    }

    #[test]
    fn test_rejects_unknown_format_and_style() {
        let err = TileRequest::builder("points", 1, 0, 0, "jpg").build().unwrap_err();
        assert_eq!(err, ValidationError::InvalidFormat("jpg".to_string()));
        let err = TileRequest::builder("heatmap", 1, 0, 0, "png").build().unwrap_err();
        assert_eq!(err, ValidationError::UnknownStyle("heatmap".to_string()));
        assert_eq!(err.to_string(), "unknown style: heatmap");
    }

    #[test]
    fn test_parses_optional_params() {
        let req = TileRequest::builder("geohash", 8, 0, 0, "torque.json")
            .params([
                ("precision_offset", "2"),
                ("interval", "weekly"),
                ("ttl", "3600"),
                ("cache", "true"),
                ("source", "id, location ,user.name"),
            ])
            .build()
            .unwrap();
        assert_eq!(req.precision_offset(), 2);
        assert_eq!(req.geohash_precision(), 4);
        assert_eq!(req.interval(), Interval::Weekly);
        assert_eq!(req.ttl(), Some(3600));
        assert!(req.cache_requested());
        assert_eq!(
            req.source_fields().unwrap(),
            vec!["id", "location", "user.name"]
        );
    }

    #[test]
    fn test_rejects_bad_params() {
        let err = TileRequest::builder("geohash", 8, 0, 0, "png")
            .param("precision_offset", "-1")
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidParam { ref key, .. } if key == "precision_offset"));

        let err = TileRequest::builder("geohash", 8, 0, 0, "png")
            .param("interval", "daily")
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidParam { ref key, .. } if key == "interval"));
    }

    #[test]
    fn test_data_type_override() {
        let req = TileRequest::builder("points", 3, 1, 1, "grid.json")
            .data_type("geojson")
            .filter(json!({ "term": { "user_id": 1 } }))
            .build()
            .unwrap();
        assert_eq!(req.data_type(), DataType::GeoJson);
        assert!(req.data_type().is_passthrough());
        assert_eq!(req.filters().len(), 1);

        let err = TileRequest::builder("points", 3, 1, 1, "png")
            .data_type("shapefile")
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidDataType(_)));
    }

    #[test]
    fn test_cache_not_requested_by_default() {
        let req = TileRequest::builder("geohash", 3, 1, 1, "png").build().unwrap();
        assert!(!req.cache_requested());
        assert!(req.source_fields().is_none());
    }
}
