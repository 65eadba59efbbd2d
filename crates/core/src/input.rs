//! Reading region rings from JSON documents.
//!
//! Accepted inputs:
//! - GeoJSON: a `Polygon` (or a `MultiPolygon` of one polygon), a `Feature`
//!   carrying one, or a `FeatureCollection` whose first polygon feature is
//!   used
//! - a raw ring `[[x, y], ...]` or a ring list `[[[x, y], ...], ...]`
//!
//! Only exterior rings are read; holes are ignored.

use std::path::Path;

use geo::{Coord, Geometry, LineString};
use geojson::GeoJson;
use serde_json::Value;

use crate::geometry::ring_from_lat_lng;
use crate::{Error, Result};

/// How positions of a region document are to be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoordOrder {
    /// Positions are map coordinates `[x, y]`
    #[default]
    Xy,
    /// Positions are lat/lng of a simple map CRS: raw rings as `[lat, lng]`,
    /// GeoJSON positions as `[lng, lat]`
    LatLng,
}

/// Read a region ring from a JSON file.
pub fn read_region<P: AsRef<Path>>(path: P, order: CoordOrder) -> Result<LineString<f64>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| Error::File {
        path: path.to_path_buf(),
        source,
    })?;
    parse_region(&content, order)
}

/// Parse a region ring from a JSON document.
pub fn parse_region(json: &str, order: CoordOrder) -> Result<LineString<f64>> {
    let value: Value = serde_json::from_str(json)?;

    if value.is_array() {
        return parse_raw_ring(value, order);
    }

    let geojson = GeoJson::from_json_value(value)
        .map_err(|e| Error::Region(format!("GeoJSON parse error: {}", e)))?;

    let geometry = match geojson {
        GeoJson::Geometry(geom) => geom,
        GeoJson::Feature(f) => f
            .geometry
            .ok_or_else(|| Error::Region("Feature has no geometry".to_string()))?,
        GeoJson::FeatureCollection(fc) => fc
            .features
            .into_iter()
            .filter_map(|f| f.geometry)
            .find(|g| {
                matches!(
                    g.value,
                    geojson::Value::Polygon(_) | geojson::Value::MultiPolygon(_)
                )
            })
            .ok_or_else(|| {
                Error::Region("FeatureCollection has no polygon feature".to_string())
            })?,
    };

    let geometry: Geometry<f64> = geometry
        .try_into()
        .map_err(|e| Error::Region(format!("Geometry conversion error: {}", e)))?;

    let exterior = match geometry {
        Geometry::Polygon(polygon) => polygon.exterior().clone(),
        Geometry::MultiPolygon(multi) => {
            if multi.0.len() > 1 {
                log::warn!(
                    "MultiPolygon has {} polygons, using the first",
                    multi.0.len()
                );
            }
            multi
                .0
                .first()
                .map(|p| p.exterior().clone())
                .ok_or_else(|| Error::Region("MultiPolygon is empty".to_string()))?
        }
        other => {
            return Err(Error::Region(format!(
                "expected a Polygon, got {}",
                geometry_name(&other)
            )))
        }
    };

    Ok(match order {
        CoordOrder::Xy => exterior,
        // GeoJSON positions are [lng, lat]
        CoordOrder::LatLng => {
            let pairs: Vec<(f64, f64)> = exterior.coords().map(|c| (c.y, c.x)).collect();
            ring_from_lat_lng(&pairs)
        }
    })
}

fn parse_raw_ring(value: Value, order: CoordOrder) -> Result<LineString<f64>> {
    let positions: Vec<[f64; 2]> = match serde_json::from_value::<Vec<[f64; 2]>>(value.clone()) {
        Ok(ring) => ring,
        Err(_) => serde_json::from_value::<Vec<Vec<[f64; 2]>>>(value)
            .map_err(|e| Error::Region(format!("not a coordinate ring: {}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Region("ring list is empty".to_string()))?,
    };

    Ok(match order {
        CoordOrder::Xy => positions.into_iter().map(|[x, y]| Coord { x, y }).collect(),
        CoordOrder::LatLng => {
            let pairs: Vec<(f64, f64)> = positions.into_iter().map(|[lat, lng]| (lat, lng)).collect();
            ring_from_lat_lng(&pairs)
        }
    })
}

fn geometry_name(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::GeometryCollection(_) => "GeometryCollection",
        _ => "another geometry",
    }
}
