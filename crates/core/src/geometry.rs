//! Planar geometry on region rings.
//!
//! Rings are `geo::LineString`s in map coordinates (x right, y down). The
//! closing vertex may or may not repeat the first one; every function here
//! accepts both forms.

use geo::{Area, Coord, LineString, MapCoords, Polygon};

use crate::{Error, Result};

/// Minimum number of distinct vertices for a region ring
pub const MIN_RING_VERTICES: usize = 3;

/// Even-odd ray casting test of `point` against `ring`.
///
/// An empty ring matches every point; it stands for "no spatial
/// restriction". Membership of points lying exactly on an edge is whatever
/// the crossing arithmetic yields.
pub fn contains(point: Coord<f64>, ring: &[Coord<f64>]) -> bool {
    if ring.is_empty() {
        return true;
    }

    let (x, y) = (point.x, point.y);
    let mut inside = false;
    let mut j = ring.len() - 1;

    for i in 0..ring.len() {
        let (xi, yi) = (ring[i].x, ring[i].y);
        let (xj, yj) = (ring[j].x, ring[j].y);

        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }

    inside
}

/// Absolute shoelace area of a ring.
pub fn shoelace_area(ring: &LineString<f64>) -> f64 {
    Polygon::new(ring.clone(), vec![]).unsigned_area()
}

/// Number of distinct vertices, ignoring a repeated closing vertex.
pub fn distinct_vertex_count(ring: &LineString<f64>) -> usize {
    let coords = &ring.0;
    match (coords.first(), coords.last()) {
        (Some(first), Some(last)) if coords.len() > 1 && first == last => coords.len() - 1,
        _ => coords.len(),
    }
}

/// Check that a ring can describe a region.
pub fn validate_ring(ring: &LineString<f64>) -> Result<()> {
    let count = distinct_vertex_count(ring);
    if count < MIN_RING_VERTICES {
        return Err(Error::Region(format!(
            "ring has {} distinct vertices, at least {} required",
            count, MIN_RING_VERTICES
        )));
    }
    if ring.coords().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
        return Err(Error::Region("ring has non-finite coordinates".to_string()));
    }
    Ok(())
}

/// Scale every vertex by `factor` about the origin.
pub fn scale_ring(ring: &LineString<f64>, factor: f64) -> LineString<f64> {
    ring.map_coords(|c| Coord {
        x: c.x * factor,
        y: c.y * factor,
    })
}

/// Convert `(lat, lng)` pairs of a simple (non-geographic) map CRS to ring
/// coordinates: `x = lng`, `y = -lat`.
pub fn ring_from_lat_lng(lat_lngs: &[(f64, f64)]) -> LineString<f64> {
    lat_lngs
        .iter()
        .map(|&(lat, lng)| Coord { x: lng, y: -lat })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{coord, line_string};

    fn unit_square() -> LineString<f64> {
        line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0)]
    }

    // ========== contains Tests ==========

    #[test]
    fn test_contains_unit_square() {
        let ring = unit_square();
        assert!(contains(coord! { x: 0.5, y: 0.5 }, &ring.0));
        assert!(!contains(coord! { x: 2.0, y: 2.0 }, &ring.0));
        assert!(!contains(coord! { x: -0.1, y: 0.5 }, &ring.0));
    }

    #[test]
    fn test_contains_closed_and_open_rings_agree() {
        let open = unit_square();
        let mut closed = unit_square();
        closed.close();
        assert_eq!(closed.0.len(), 5);

        for (x, y) in [(0.5, 0.5), (0.9, 0.1), (1.5, 0.5), (0.5, -3.0)] {
            let p = coord! { x: x, y: y };
            assert_eq!(contains(p, &open.0), contains(p, &closed.0));
        }
    }

    #[test]
    fn test_contains_concave_ring() {
        // U shape opening upward (y down): notch between x=1 and x=2
        let ring = line_string![
            (x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 2.0), (x: 2.0, y: 2.0),
            (x: 2.0, y: 0.0), (x: 3.0, y: 0.0), (x: 3.0, y: 3.0), (x: 0.0, y: 3.0)
        ];
        assert!(contains(coord! { x: 0.5, y: 1.0 }, &ring.0));
        assert!(!contains(coord! { x: 1.5, y: 1.0 }, &ring.0));
        assert!(contains(coord! { x: 1.5, y: 2.5 }, &ring.0));
    }

    #[test]
    fn test_contains_empty_ring_matches_everything() {
        assert!(contains(coord! { x: 1e9, y: -1e9 }, &[]));
    }

    // ========== Area Tests ==========

    #[test]
    fn test_shoelace_area_unit_square() {
        assert_eq!(shoelace_area(&unit_square()), 1.0);
    }

    #[test]
    fn test_shoelace_area_ignores_orientation() {
        let mut reversed = unit_square();
        reversed.0.reverse();
        assert_eq!(shoelace_area(&reversed), 1.0);

        let triangle = line_string![(x: 0.0, y: 0.0), (x: 4.0, y: 0.0), (x: 0.0, y: 3.0)];
        assert_eq!(shoelace_area(&triangle), 6.0);
    }

    // ========== Ring Helpers Tests ==========

    #[test]
    fn test_validate_ring() {
        assert!(validate_ring(&unit_square()).is_ok());

        let mut closed_triangle =
            line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 0.0, y: 1.0)];
        closed_triangle.close();
        assert!(validate_ring(&closed_triangle).is_ok());

        let mut segment = line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0)];
        segment.close();
        assert!(matches!(validate_ring(&segment), Err(Error::Region(_))));

        let nan = line_string![(x: 0.0, y: 0.0), (x: f64::NAN, y: 0.0), (x: 0.0, y: 1.0)];
        assert!(validate_ring(&nan).is_err());
    }

    #[test]
    fn test_scale_ring() {
        let scaled = scale_ring(&unit_square(), 4.0);
        assert_eq!(scaled.0[2], coord! { x: 4.0, y: 4.0 });
        assert_eq!(shoelace_area(&scaled), 16.0);
    }

    #[test]
    fn test_ring_from_lat_lng() {
        let ring = ring_from_lat_lng(&[(-10.0, 5.0), (-20.0, 7.0)]);
        assert_eq!(ring.0, vec![coord! { x: 5.0, y: 10.0 }, coord! { x: 7.0, y: 20.0 }]);
    }
}
