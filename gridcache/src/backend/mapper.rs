//! Maps search responses to flat feature records.
//!
//! Records are what the cache stores and the renderer consumes: a JSON
//! object per feature holding the requested source fields plus `latitude`,
//! `longitude` and, for grid buckets, `cellCount`.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::{GridBucket, Hit, SearchResponse};
use crate::geo;
use crate::request::DataType;

pub const FIELD_LATITUDE: &str = "latitude";
pub const FIELD_LONGITUDE: &str = "longitude";
pub const FIELD_CELL_COUNT: &str = "cellCount";
pub const FIELD_HISTOGRAM: &str = "histogram";

/// One mapped feature.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureRecord(Map<String, Value>);

impl FeatureRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Convenience constructor for a bare point.
    pub fn point(lon: f64, lat: f64) -> Self {
        let mut fields = Map::new();
        fields.insert(FIELD_LATITUDE.to_string(), Value::from(lat));
        fields.insert(FIELD_LONGITUDE.to_string(), Value::from(lon));
        Self(fields)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn latitude(&self) -> Option<f64> {
        self.0.get(FIELD_LATITUDE).and_then(Value::as_f64)
    }

    pub fn longitude(&self) -> Option<f64> {
        self.0.get(FIELD_LONGITUDE).and_then(Value::as_f64)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }
}

/// Converts responses into [`FeatureRecord`]s.
#[derive(Debug, Clone)]
pub struct RecordMapper {
    geo_point_field: String,
    fields: Vec<String>,
    data_type: DataType,
}

impl RecordMapper {
    /// # Arguments
    ///
    /// * `geo_point_field` - Indexed geo field holding document coordinates
    /// * `source_includes` - Fields requested from the backend
    /// * `data_type` - Request data type
    pub fn new(geo_point_field: impl Into<String>, source_includes: &[String], data_type: DataType) -> Self {
        let geo_point_field = geo_point_field.into();
        let fields = source_includes
            .iter()
            .filter(|f| **f != geo_point_field)
            .cloned()
            .collect();
        Self {
            geo_point_field,
            fields,
            data_type,
        }
    }

    /// Fields copied from each document, excluding the geo field.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Maps a whole response.
    ///
    /// Grid buckets take precedence over plain hits. Buckets are ordered by
    /// their top hit's first sort value; records that cannot be placed on
    /// the map are dropped.
    pub fn map(&self, response: &SearchResponse) -> Vec<FeatureRecord> {
        if self.data_type == DataType::GeoJson {
            return response.hits.hits.iter().map(geojson_record).collect();
        }

        match response.grid_buckets() {
            Some(buckets) => {
                let mut sorted: Vec<&GridBucket> = buckets.iter().collect();
                sorted.sort_by(|a, b| compare_sort_values(bucket_sort_value(a), bucket_sort_value(b)));
                sorted.into_iter().filter_map(|b| self.map_bucket(b)).collect()
            }
            None => response
                .hits
                .hits
                .iter()
                .filter_map(|h| self.map_hit(h))
                .collect(),
        }
    }

    fn map_hit(&self, hit: &Hit) -> Option<FeatureRecord> {
        let empty = Map::new();
        let source = hit.source.as_ref().unwrap_or(&empty);
        let mut record = self.project(source);
        match self.coordinates(source) {
            Some((lat, lon)) => {
                record.insert(FIELD_LATITUDE, Value::from(lat));
                record.insert(FIELD_LONGITUDE, Value::from(lon));
                Some(record)
            }
            None => {
                debug!(id = ?hit.id, "dropping hit without coordinates");
                None
            }
        }
    }

    fn map_bucket(&self, bucket: &GridBucket) -> Option<FeatureRecord> {
        let top_hit = match &bucket.histogram {
            Some(hist) => hist
                .buckets
                .iter()
                .find_map(|b| b.top_hits.as_ref().and_then(|t| t.first())),
            None => bucket.top_hits.as_ref().and_then(|t| t.first()),
        };
        let empty = Map::new();
        let source = top_hit.and_then(|h| h.source.as_ref()).unwrap_or(&empty);

        let mut record = self.project(source);
        let cell_count = match (&bucket.histogram, &bucket.top_hits) {
            (None, Some(top)) if top_hit.is_some() => top.hits.total(),
            _ => bucket.doc_count,
        };
        record.insert(FIELD_CELL_COUNT, Value::from(cell_count));

        if let Some(hist) = &bucket.histogram {
            let mut counts = Map::new();
            for b in &hist.buckets {
                let key = match &b.key {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                counts.insert(key, Value::from(b.doc_count));
            }
            record.insert(FIELD_HISTOGRAM, Value::Object(counts));
        }

        let coords = self.coordinates(source).or_else(|| bucket_center(&bucket.key));
        match coords {
            Some((lat, lon)) => {
                record.insert(FIELD_LATITUDE, Value::from(lat));
                record.insert(FIELD_LONGITUDE, Value::from(lon));
                Some(record)
            }
            None => {
                debug!(key = %bucket.key, "dropping bucket with undecodable key");
                None
            }
        }
    }

    /// Copies the requested fields, following one level of dotted path.
    fn project(&self, source: &Map<String, Value>) -> FeatureRecord {
        let mut record = FeatureRecord::default();
        for field in &self.fields {
            let value = match field.split_once('.') {
                Some((outer, inner)) => source.get(outer).and_then(|o| o.get(inner)),
                None => source.get(field.as_str()),
            };
            record.insert(field.clone(), normalize(value));
        }
        record
    }

    /// Reads `(lat, lon)` from a `{lat, lon}` object or a `"lat,lon"` string.
    fn coordinates(&self, source: &Map<String, Value>) -> Option<(f64, f64)> {
        match source.get(&self.geo_point_field)? {
            Value::Object(point) => {
                let lat = point.get("lat").and_then(number)?;
                let lon = point.get("lon").and_then(number)?;
                Some((lat, lon))
            }
            Value::String(s) => {
                let (lat, lon) = s.split_once(',')?;
                Some((lat.trim().parse().ok()?, lon.trim().parse().ok()?))
            }
            _ => None,
        }
    }
}

fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// `"T"` and `"F"` flags become booleans; missing becomes null.
fn normalize(value: Option<&Value>) -> Value {
    match value {
        Some(Value::String(s)) if s == "T" => Value::Bool(true),
        Some(Value::String(s)) if s == "F" => Value::Bool(false),
        Some(v) => v.clone(),
        None => Value::Null,
    }
}

fn geojson_record(hit: &Hit) -> FeatureRecord {
    let mut record = FeatureRecord::default();
    let source = hit.source.as_ref();
    record.insert("id", source.and_then(|s| s.get("id")).cloned().unwrap_or(Value::Null));
    record.insert(
        "geojson",
        source
            .and_then(|s| s.get("geometry_geojson"))
            .cloned()
            .unwrap_or(Value::Null),
    );
    record
}

fn bucket_sort_value(bucket: &GridBucket) -> Option<&Value> {
    bucket
        .top_hits
        .as_ref()
        .and_then(|t| t.first())
        .and_then(|h| h.sort.as_ref())
        .and_then(|s| s.first())
}

fn compare_sort_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

/// Center of a geohash cell or `z/x/y` geotile bucket.
fn bucket_center(key: &str) -> Option<(f64, f64)> {
    if key.contains('/') {
        geo::decode_geotile_key(key).ok()
    } else {
        geo::decode_geohash(key).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapper(includes: &[&str]) -> RecordMapper {
        let includes: Vec<String> = includes.iter().map(|s| s.to_string()).collect();
        RecordMapper::new("location", &includes, DataType::Search)
    }

    fn response(v: Value) -> SearchResponse {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_maps_plain_hits() {
        let rsp = response(json!({
            "hits": { "total": 1, "hits": [
                { "_source": { "id": 1, "captive": "F", "location": "10.5,-20.25" } }
            ] }
        }));
        let records = mapper(&["id", "captive", "location"]).map(&rsp);
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.get("id"), Some(&json!(1)));
        assert_eq!(r.get("captive"), Some(&json!(false)));
        assert_eq!(r.latitude(), Some(10.5));
        assert_eq!(r.longitude(), Some(-20.25));
        assert!(r.get(FIELD_CELL_COUNT).is_none());
        assert!(r.get("location").is_none());
    }

    #[test]
    fn test_dotted_fields_and_missing() {
        let rsp = response(json!({
            "hits": { "hits": [
                { "_source": { "user": { "login": "ada" }, "location": { "lat": 1.0, "lon": 2.0 } } }
            ] }
        }));
        let r = &mapper(&["user.login", "taxon.id", "quality"]).map(&rsp)[0];
        assert_eq!(r.get("user.login"), Some(&json!("ada")));
        assert_eq!(r.get("taxon.id"), Some(&Value::Null));
        assert_eq!(r.get("quality"), Some(&Value::Null));
        assert_eq!(r.latitude(), Some(1.0));
    }

    #[test]
    fn test_maps_and_sorts_buckets() {
        let rsp = response(json!({
            "hits": { "total": 5, "hits": [] },
            "aggregations": { "zoom1": { "buckets": [
                { "key": "u4pr", "doc_count": 3, "geohash": { "hits": { "total": 3, "hits": [
                    { "_source": { "id": 20, "location": { "lat": 57.6, "lon": 10.4 } }, "sort": [20] }
                ] } } },
                { "key": "u4ps", "doc_count": 2, "geohash": { "hits": { "total": { "value": 2 }, "hits": [
                    { "_source": { "id": 10, "location": { "lat": 57.7, "lon": 10.5 } }, "sort": [10] }
                ] } } }
            ] } }
        }));
        let records = mapper(&["id", "location"]).map(&rsp);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("id"), Some(&json!(10)));
        assert_eq!(records[0].get(FIELD_CELL_COUNT), Some(&json!(2)));
        assert_eq!(records[1].get(FIELD_CELL_COUNT), Some(&json!(3)));
    }

    #[test]
    fn test_bucket_without_top_hits_uses_key_center() {
        let rsp = response(json!({
            "aggregations": { "zoom1": { "buckets": [
                { "key": "s", "doc_count": 4 },
                { "key": "1/1/0", "doc_count": 2 },
                { "key": "!!", "doc_count": 1 }
            ] } }
        }));
        let records = mapper(&["id", "location"]).map(&rsp);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get(FIELD_CELL_COUNT), Some(&json!(4)));
        // geohash "s" covers lon 0..45, lat 0..45
        assert!((records[0].latitude().unwrap() - 22.5).abs() < 1e-9);
        assert!((records[0].longitude().unwrap() - 22.5).abs() < 1e-9);
        assert!((records[1].longitude().unwrap() - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_time_series_bucket() {
        let rsp = response(json!({
            "aggregations": { "zoom1": { "buckets": [
                { "key": "s", "doc_count": 5, "histogram": { "buckets": [
                    { "key": 3, "doc_count": 4, "geohash": { "hits": { "total": 4, "hits": [
                        { "_source": { "id": 1, "location": "1.0,2.0" } }
                    ] } } },
                    { "key": 7, "doc_count": 1 }
                ] } }
            ] } }
        }));
        let records = mapper(&["id", "location"]).map(&rsp);
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.get(FIELD_CELL_COUNT), Some(&json!(5)));
        assert_eq!(r.get(FIELD_HISTOGRAM), Some(&json!({ "3": 4, "7": 1 })));
        assert_eq!(r.latitude(), Some(1.0));
    }

    #[test]
    fn test_geojson_data_type() {
        let rsp = response(json!({
            "hits": { "hits": [
                { "_source": { "id": 4, "geometry_geojson": { "type": "Point", "coordinates": [1, 2] } } }
            ] }
        }));
        let m = RecordMapper::new("location", &[], DataType::GeoJson);
        let records = m.map(&rsp);
        assert_eq!(records[0].get("id"), Some(&json!(4)));
        assert_eq!(records[0].get("geojson").unwrap()["type"], json!("Point"));
    }

    #[test]
    fn test_record_serializes_transparently() {
        let r = FeatureRecord::point(2.0, 1.0);
        let line = serde_json::to_string(&r).unwrap();
        let back: FeatureRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(back, r);
        assert!(line.starts_with('{'));
    }
}
