//! Renderer collaborator.
//!
//! Rendering lives outside this crate. [`TileService::render`] only decides
//! which records and which grid fields go to the renderer.
//!
//! [`TileService::render`]: super::TileService::render

use thiserror::Error;

use crate::backend::{FeatureRecord, FIELD_CELL_COUNT, FIELD_LATITUDE, FIELD_LONGITUDE};
use crate::geo::BoundingBox;
use crate::query::QueryBuilder;
use crate::request::{DataType, TileRequest};

/// Failure reported by a renderer.
#[derive(Debug, Error)]
#[error("render failed: {0}")]
pub struct RenderError(pub String);

/// Turns records into tile bytes.
pub trait Renderer: Send + Sync {
    /// Renders an image or time-series tile.
    fn render(
        &self,
        request: &TileRequest,
        bbox: &BoundingBox,
        tile_size: u32,
        records: &[FeatureRecord],
    ) -> Result<Vec<u8>, RenderError>;

    /// Renders a UTF grid carrying `fields` for each record.
    fn render_grid(
        &self,
        request: &TileRequest,
        bbox: &BoundingBox,
        tile_size: u32,
        records: &[FeatureRecord],
        fields: &[String],
    ) -> Result<Vec<u8>, RenderError>;

    /// A transparent tile.
    fn blank(&self, tile_size: u32) -> Result<Vec<u8>, RenderError>;
}

/// Fields exposed in a UTF grid.
///
/// * `skip_top_hits` - Records carry only counts and coordinates
pub fn grid_fields(request: &TileRequest, queries: &QueryBuilder, skip_top_hits: bool) -> Vec<String> {
    if skip_top_hits {
        return vec![
            FIELD_CELL_COUNT.to_string(),
            FIELD_LATITUDE.to_string(),
            FIELD_LONGITUDE.to_string(),
        ];
    }
    if request.data_type() == DataType::GeoJson {
        return vec!["id".to_string(), "geojson".to_string()];
    }

    let mut fields: Vec<String> = queries
        .source_includes(request)
        .into_iter()
        .filter(|f| f != queries.geo_point_field())
        .collect();
    if request.style().is_grid() {
        fields.push(FIELD_CELL_COUNT.to_string());
    }
    fields.push(FIELD_LATITUDE.to_string());
    fields.push(FIELD_LONGITUDE.to_string());
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(style: &str, data_type: &str) -> TileRequest {
        TileRequest::builder(style, 3, 1, 1, "grid.json")
            .param("source", "id,name,location")
            .data_type(data_type)
            .build()
            .unwrap()
    }

    #[test]
    fn test_skip_top_hits_fields() {
        let fields = grid_fields(&request("geohash", "search"), &QueryBuilder::default(), true);
        assert_eq!(fields, vec!["cellCount", "latitude", "longitude"]);
    }

    #[test]
    fn test_geojson_fields() {
        let fields = grid_fields(&request("points", "geojson"), &QueryBuilder::default(), false);
        assert_eq!(fields, vec!["id", "geojson"]);
    }

    #[test]
    fn test_grid_fields_drop_geo_field() {
        let fields = grid_fields(&request("geohash", "search"), &QueryBuilder::default(), false);
        assert_eq!(fields, vec!["id", "name", "cellCount", "latitude", "longitude"]);

        let fields = grid_fields(&request("points", "search"), &QueryBuilder::default(), false);
        assert_eq!(fields, vec!["id", "name", "latitude", "longitude"]);
    }
}
