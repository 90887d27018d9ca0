//! Geometry and precision math.
//!
//! Pure functions converting between Web Mercator tiles and lon/lat boxes,
//! growing boxes so queries pick up points just outside a tile, splitting
//! boxes that wrap the antimeridian, and choosing aggregation precision for a
//! zoom level.

mod types;

pub use types::{
    grid_size, BoundingBox, GeoError, TileCoord, MAX_LAT, MAX_LON, MAX_ZOOM, MIN_LAT, MIN_LON,
    MIN_ZOOM,
};

use std::f64::consts::PI;

/// Default fraction of a box's span added on each side by smoothing.
pub const DEFAULT_SMOOTHING_FACTOR: f64 = 0.07;

/// Zoom breakpoints for geohash precision: `(first_zoom, precision)`.
///
/// Each entry applies from its zoom up to the next entry's zoom.
pub const GEOHASH_PRECISION_STEPS: &[(u8, u8)] = &[
    (0, 3),
    (3, 4),
    (6, 5),
    (8, 6),
    (11, 7),
    (12, 8),
    (13, 9),
    (15, 10),
    (16, 12),
];

/// Zoom levels added to the tile zoom to get geotile grid precision.
pub const GEOTILE_ZOOM_STEP: u8 = 5;

/// Finest precision accepted by a geotile grid aggregation.
pub const MAX_GEOTILE_PRECISION: u8 = 29;

const GEOHASH_ALPHABET: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Latitude of a tile row edge (row may be fractional).
#[inline]
fn row_to_lat(row: f64, n: f64) -> f64 {
    let lat_rad = (PI * (1.0 - 2.0 * row / n)).sinh().atan();
    lat_rad.to_degrees()
}

/// Longitude of a tile column edge (column may be fractional).
#[inline]
fn col_to_lon(col: f64, n: f64) -> f64 {
    col / n * 360.0 - 180.0
}

/// Returns the lon/lat bounding box of a tile.
///
/// Rows count southward, so the tile's north edge is row `y` and its south
/// edge is row `y + 1`.
pub fn bbox_from_tile(tile: &TileCoord) -> BoundingBox {
    let n = grid_size(tile.zoom) as f64;
    BoundingBox {
        min_lon: col_to_lon(tile.x as f64, n),
        min_lat: row_to_lat(tile.y as f64 + 1.0, n),
        max_lon: col_to_lon(tile.x as f64 + 1.0, n),
        max_lat: row_to_lat(tile.y as f64, n),
    }
}

/// Converts a point to the tile containing it.
///
/// Latitudes beyond the Mercator limits are clamped to the first or last row.
#[inline]
pub fn tile_for_point(lon: f64, lat: f64, zoom: u8) -> Result<TileCoord, GeoError> {
    if !(-90.0..=90.0).contains(&lat) {
        return Err(GeoError::InvalidLatitude(lat));
    }
    if !(MIN_LON..=MAX_LON).contains(&lon) {
        return Err(GeoError::InvalidLongitude(lon));
    }
    if zoom > MAX_ZOOM {
        return Err(GeoError::InvalidZoom(zoom));
    }

    let n = grid_size(zoom);
    let nf = n as f64;
    let lat = lat.clamp(MIN_LAT, MAX_LAT);

    let x = ((lon + 180.0) / 360.0 * nf).floor() as u32;
    let lat_rad = lat.to_radians();
    let y = ((1.0 - lat_rad.tan().asinh() / PI) / 2.0 * nf).floor().max(0.0) as u32;

    Ok(TileCoord {
        x: x.min(n - 1),
        y: y.min(n - 1),
        zoom,
    })
}

/// Grows a box by `factor` of its span on every side, clamped to the globe.
///
/// A wrapped box grows across the antimeridian; if the growth makes the two
/// ends meet, the result spans every longitude.
pub fn expand_for_smoothing(bbox: &BoundingBox, factor: f64) -> BoundingBox {
    let lon_pad = bbox.lon_span() * factor;
    let lat_pad = bbox.lat_span() * factor;

    let mut expanded = BoundingBox {
        min_lon: bbox.min_lon - lon_pad,
        min_lat: bbox.min_lat - lat_pad,
        max_lon: bbox.max_lon + lon_pad,
        max_lat: bbox.max_lat + lat_pad,
    };

    if bbox.wraps_antimeridian() && expanded.max_lon >= expanded.min_lon {
        expanded.min_lon = MIN_LON;
        expanded.max_lon = MAX_LON;
    }

    expanded.min_lon = expanded.min_lon.max(MIN_LON);
    expanded.min_lat = expanded.min_lat.max(-90.0);
    expanded.max_lon = expanded.max_lon.min(MAX_LON);
    expanded.max_lat = expanded.max_lat.min(90.0);
    expanded
}

/// Splits a box that wraps the antimeridian into its eastern and western
/// halves. Returns `None` for boxes that don't wrap.
pub fn split_antimeridian(bbox: &BoundingBox) -> Option<(BoundingBox, BoundingBox)> {
    if !bbox.wraps_antimeridian() {
        return None;
    }
    let east = BoundingBox {
        max_lon: MAX_LON,
        ..*bbox
    };
    let west = BoundingBox {
        min_lon: MIN_LON,
        ..*bbox
    };
    Some((east, west))
}

/// Geohash grid precision for a zoom level.
///
/// Non-decreasing in `zoom`; `offset` coarsens the grid, never below 1.
pub fn precision_for_zoom(zoom: u8, offset: u8) -> u8 {
    let base = GEOHASH_PRECISION_STEPS
        .iter()
        .take_while(|(first_zoom, _)| zoom >= *first_zoom)
        .last()
        .map(|(_, precision)| *precision)
        .unwrap_or(GEOHASH_PRECISION_STEPS[0].1);
    base.saturating_sub(offset).max(1)
}

/// Geotile grid precision for a zoom level.
pub fn geotile_precision(zoom: u8, offset: u8) -> u8 {
    zoom.saturating_add(GEOTILE_ZOOM_STEP)
        .min(MAX_GEOTILE_PRECISION)
        .saturating_sub(offset)
        .max(1)
}

/// Decodes a geohash to the `(lat, lon)` center of its cell.
pub fn decode_geohash(hash: &str) -> Result<(f64, f64), GeoError> {
    if hash.is_empty() {
        return Err(GeoError::InvalidGeohash(hash.to_string()));
    }

    let (mut lat_lo, mut lat_hi) = (-90.0_f64, 90.0_f64);
    let (mut lon_lo, mut lon_hi) = (-180.0_f64, 180.0_f64);
    let mut even = true;

    for c in hash.bytes() {
        let c = c.to_ascii_lowercase();
        let value = GEOHASH_ALPHABET
            .iter()
            .position(|&a| a == c)
            .ok_or_else(|| GeoError::InvalidGeohash(hash.to_string()))?;

        for bit in (0..5).rev() {
            let set = (value >> bit) & 1 == 1;
            let (lo, hi) = if even {
                (&mut lon_lo, &mut lon_hi)
            } else {
                (&mut lat_lo, &mut lat_hi)
            };
            let mid = (*lo + *hi) / 2.0;
            if set {
                *lo = mid;
            } else {
                *hi = mid;
            }
            even = !even;
        }
    }

    Ok(((lat_lo + lat_hi) / 2.0, (lon_lo + lon_hi) / 2.0))
}

/// Decodes a `zoom/x/y` geotile bucket key to the `(lat, lon)` tile center.
pub fn decode_geotile_key(key: &str) -> Result<(f64, f64), GeoError> {
    let invalid = || GeoError::InvalidGeotileKey(key.to_string());

    let mut parts = key.split('/');
    let zoom: u8 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
    let x: u32 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
    let y: u32 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
    if parts.next().is_some() || zoom > MAX_GEOTILE_PRECISION {
        return Err(invalid());
    }

    let n = 2f64.powi(zoom as i32);
    if x as f64 >= n || y as f64 >= n {
        return Err(invalid());
    }
    Ok((
        row_to_lat(y as f64 + 0.5, n),
        col_to_lon(x as f64 + 0.5, n),
    ))
}
