//! Edge fan-out.
//!
//! A record is cached in the cell that contains it and, when it lies within
//! a margin of that cell's edge, in the neighbor across that edge as well, so
//! symbols straddling a tile border render on both tiles.
//!
//! ```text
//!            y - 1 (north)
//!          ┌───────────────┐
//!          │▒▒▒▒▒▒▒▒▒▒▒▒▒▒▒│
//!  x - 1   │▒             ▒│   x + 1
//!  (west)  │▒    home     ▒│   (east)
//!          │▒             ▒│
//!          │▒▒▒▒▒▒▒▒▒▒▒▒▒▒▒│
//!          └───────────────┘
//!            y + 1 (south)
//! ```
//!
//! Columns wrap around the antimeridian; rows beyond the poles are dropped.

use crate::geo::{self, GeoError, TileCoord};

/// Default edge margin as a fraction of cell width and height.
pub const DEFAULT_EDGE_MARGIN: f64 = 0.1;

/// Cells a point at `(lon, lat)` is written to at `zoom`.
///
/// The home cell comes first, followed by up to four distinct neighbors.
pub fn cells_for_point(lon: f64, lat: f64, zoom: u8, margin: f64) -> Result<Vec<TileCoord>, GeoError> {
    let home = geo::tile_for_point(lon, lat, zoom)?;
    let bbox = geo::bbox_from_tile(&home);
    let n = geo::grid_size(zoom);
    let d_lon = (bbox.max_lon - bbox.min_lon) * margin;
    let d_lat = (bbox.max_lat - bbox.min_lat) * margin;

    let mut cells = Vec::with_capacity(5);
    cells.push(home);

    let mut push = |x: u32, y: u32| {
        let cell = TileCoord { x, y, zoom };
        if !cells.contains(&cell) {
            cells.push(cell);
        }
    };

    if lat < bbox.min_lat + d_lat && home.y + 1 < n {
        push(home.x, home.y + 1);
    }
    if lat > bbox.max_lat - d_lat && home.y > 0 {
        push(home.x, home.y - 1);
    }
    if lon > bbox.max_lon - d_lon {
        push((home.x + 1) % n, home.y);
    }
    if lon < bbox.min_lon + d_lon {
        push((home.x + n - 1) % n, home.y);
    }

    Ok(cells)
}
