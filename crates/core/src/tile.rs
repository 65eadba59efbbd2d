//! Tile addressing for layer coordinate spaces.
//!
//! A layer is a square of `size` units cut into square tiles of `tile_size`
//! units. Tiles are addressed by integer column/row; the y axis grows
//! downward, so `north` is the smaller y value of a bounding box.

use geo::{BoundingRect, LineString};

/// Axis-aligned bounding box in layer coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub west: f64,
    pub east: f64,
    pub north: f64,
    pub south: f64,
}

impl Bounds {
    /// Create a new bounding box
    pub fn new(west: f64, east: f64, north: f64, south: f64) -> Self {
        Self {
            west,
            east,
            north,
            south,
        }
    }

    /// Create an empty/invalid bounding box
    pub fn empty() -> Self {
        Self {
            west: f64::INFINITY,
            east: f64::NEG_INFINITY,
            north: f64::INFINITY,
            south: f64::NEG_INFINITY,
        }
    }

    /// The whole `[0, size] x [0, size]` extent of a layer.
    pub fn full_extent(size: f64) -> Self {
        Self::new(0.0, size, 0.0, size)
    }

    /// Bounding box of a ring's vertices, `None` for an empty ring.
    pub fn of_ring(ring: &LineString<f64>) -> Option<Self> {
        ring.bounding_rect()
            .map(|rect| Self::new(rect.min().x, rect.max().x, rect.min().y, rect.max().y))
    }

    /// Check if this is a valid bounding box
    pub fn is_valid(&self) -> bool {
        self.west <= self.east && self.north <= self.south
    }
}

/// Tiling parameters of one layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileGrid {
    /// Full extent of the layer, in layer units
    pub size: f64,
    /// Edge length of one tile, in layer units
    pub tile_size: f64,
    /// Added to the column index when filling URL templates
    pub x0: i64,
    /// Added to the row index when filling URL templates
    pub y0: i64,
}

impl TileGrid {
    pub fn new(size: f64, tile_size: f64) -> Self {
        Self {
            size,
            tile_size,
            x0: 0,
            y0: 0,
        }
    }

    /// Set the template origin offset.
    pub fn with_origin(mut self, x0: i64, y0: i64) -> Self {
        self.x0 = x0;
        self.y0 = y0;
        self
    }
}

/// One tile to visit: its grid address and the offset of its origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileRef {
    pub col: i64,
    pub row: i64,
    /// `col * tile_size`, added to every coordinate read from the tile
    pub x: f64,
    /// `row * tile_size`, added to every coordinate read from the tile
    pub y: f64,
    /// `col + x0`, substituted for `{x}` in URL templates
    pub template_x: i64,
    /// `row + y0`, substituted for `{y}` in URL templates
    pub template_y: i64,
}

impl TileRef {
    pub fn new(col: i64, row: i64, grid: &TileGrid) -> Self {
        Self {
            col,
            row,
            x: col as f64 * grid.tile_size,
            y: row as f64 * grid.tile_size,
            template_x: col + grid.x0,
            template_y: row + grid.y0,
        }
    }

    /// Fill `{x}` and `{y}` in a URL template with this tile's indices.
    pub fn resolve_url(&self, template: &str) -> String {
        template
            .replace("{x}", &self.template_x.to_string())
            .replace("{y}", &self.template_y.to_string())
    }
}

/// Inclusive index range covered by `[lo, hi]` on one axis.
///
/// An upper edge sitting exactly on a tile boundary does not open the next
/// tile.
fn index_range(lo: f64, hi: f64, tile_size: f64) -> (i64, i64) {
    let first = (lo / tile_size).floor() as i64;
    let mut last = (hi / tile_size).floor() as i64;
    if (hi / tile_size).fract() == 0.0 && last > first {
        last -= 1;
    }
    (first, last)
}

/// Get all tiles of `grid` intersecting `bounds`, column-major.
///
/// Without bounds the full layer extent is used. An invalid (empty) box or a
/// non-positive tile size yields no tiles.
pub fn tiles_for(bounds: Option<&Bounds>, grid: &TileGrid) -> Vec<TileRef> {
    let bounds = bounds
        .copied()
        .unwrap_or_else(|| Bounds::full_extent(grid.size));

    if !bounds.is_valid() || !(grid.tile_size > 0.0) {
        return Vec::new();
    }

    let (col_min, col_max) = index_range(bounds.west, bounds.east, grid.tile_size);
    let (row_min, row_max) = index_range(bounds.north, bounds.south, grid.tile_size);

    (col_min..=col_max)
        .flat_map(|col| (row_min..=row_max).map(move |row| TileRef::new(col, row, grid)))
        .collect()
}
