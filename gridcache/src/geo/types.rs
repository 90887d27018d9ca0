//! Core geometry types: tile coordinates and lon/lat bounding boxes.

use std::fmt;

use thiserror::Error;

/// Minimum latitude representable in Web Mercator.
pub const MIN_LAT: f64 = -85.051_128_78;

/// Maximum latitude representable in Web Mercator.
pub const MAX_LAT: f64 = 85.051_128_78;

/// Minimum longitude.
pub const MIN_LON: f64 = -180.0;

/// Maximum longitude.
pub const MAX_LON: f64 = 180.0;

/// Lowest supported zoom level.
pub const MIN_ZOOM: u8 = 0;

/// Highest supported zoom level.
pub const MAX_ZOOM: u8 = 21;

/// Errors from coordinate validation and key decoding.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeoError {
    #[error("invalid zoom level {0} (must be {MIN_ZOOM}..={MAX_ZOOM})")]
    InvalidZoom(u8),

    #[error("tile {x}/{y} is outside the grid at zoom {zoom}")]
    InvalidTile { x: u32, y: u32, zoom: u8 },

    #[error("invalid latitude {0}")]
    InvalidLatitude(f64),

    #[error("invalid longitude {0}")]
    InvalidLongitude(f64),

    #[error("invalid geohash '{0}'")]
    InvalidGeohash(String),

    #[error("invalid geotile key '{0}'")]
    InvalidGeotileKey(String),
}

/// Number of tiles along one axis at the given zoom.
#[inline]
pub fn grid_size(zoom: u8) -> u32 {
    1u32 << zoom
}

/// A tile in the square Web Mercator tiling scheme.
///
/// `x` increases eastward from the antimeridian, `y` increases southward
/// from the northern edge of the projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
    pub zoom: u8,
}

impl TileCoord {
    /// Creates a validated tile coordinate.
    pub fn new(x: u32, y: u32, zoom: u8) -> Result<Self, GeoError> {
        if zoom > MAX_ZOOM {
            return Err(GeoError::InvalidZoom(zoom));
        }
        let n = grid_size(zoom);
        if x >= n || y >= n {
            return Err(GeoError::InvalidTile { x, y, zoom });
        }
        Ok(Self { x, y, zoom })
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.x, self.y)
    }
}

/// A lon/lat rectangle in degrees.
///
/// A box whose `max_lon` is smaller than its `min_lon` wraps across the
/// antimeridian.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    /// Returns `[min_lon, min_lat, max_lon, max_lat]`.
    pub fn to_array(&self) -> [f64; 4] {
        [self.min_lon, self.min_lat, self.max_lon, self.max_lat]
    }

    /// True when the box crosses the antimeridian.
    pub fn wraps_antimeridian(&self) -> bool {
        self.max_lon < self.min_lon
    }

    /// Longitudinal extent in degrees, accounting for antimeridian wrap.
    pub fn lon_span(&self) -> f64 {
        if self.wraps_antimeridian() {
            self.max_lon + 360.0 - self.min_lon
        } else {
            self.max_lon - self.min_lon
        }
    }

    /// Latitudinal extent in degrees.
    pub fn lat_span(&self) -> f64 {
        (self.max_lat - self.min_lat).abs()
    }

    /// True when the point lies inside the box (edges inclusive).
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        if lat < self.min_lat || lat > self.max_lat {
            return false;
        }
        if self.wraps_antimeridian() {
            lon >= self.min_lon || lon <= self.max_lon
        } else {
            lon >= self.min_lon && lon <= self.max_lon
        }
    }
}

impl From<[f64; 4]> for BoundingBox {
    fn from(v: [f64; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}
