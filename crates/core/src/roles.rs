//! Metrics derived from raw pixel sums once every job of a region reports.
//!
//! A pixel layer's values mean different things depending on its
//! [`PixelRole`]. [`CalibratedRoles`] converts the raw sums into calibrated
//! quantities; other strategies can be plugged into
//! [`RegionAnalyzer`](crate::RegionAnalyzer) through [`RoleDerivation`].

use crate::config::{LayerDescriptor, MapContext, PixelRole};
use crate::region::{sum_key, GeometryStats, RegionStats};

/// Inputs available to a derivation.
#[derive(Debug, Clone, Copy)]
pub struct DerivationContext<'a> {
    pub geometry: &'a GeometryStats,
    pub map: &'a MapContext,
}

impl DerivationContext<'_> {
    /// Physical length of one unit of `layer`.
    pub fn unit_length(&self, layer: &LayerDescriptor) -> f64 {
        self.map.calibration.size_cal / layer.size
    }

    /// Number of `layer` cells covering the region.
    pub fn cell_count(&self, layer: &LayerDescriptor) -> f64 {
        let scale = self.map.scale_for(layer);
        self.geometry.area_px * scale * scale
    }
}

/// Post-processing run on a region's stats after all its jobs reported.
pub trait RoleDerivation: Send + Sync {
    fn derive(&self, ctx: &DerivationContext<'_>, stats: &mut RegionStats);
}

/// Leaves the raw sums as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDerivation;

impl RoleDerivation for NoDerivation {
    fn derive(&self, _ctx: &DerivationContext<'_>, _stats: &mut RegionStats) {}
}

/// Calibrated metrics per pixel role.
///
/// With `u` the physical length of one layer cell and `n` the number of
/// cells covering the region:
///
/// - `area`: `<layer>_area_cal_<unit> = sum * u²` and
///   `<layer>_area_fraction` of the region's calibrated area
/// - `holes`: `<layer>_holes_area_cal_<unit> = sum * u²` and
///   `area_cal_net_<unit>`, the region area minus the holes
/// - `density`: `<layer>_density_mean = sum / n`
/// - `probability`: `<layer>_expected_count = sum` and
///   `<layer>_probability_mean = sum / n`
///
/// Ratios with a zero denominator are left out.
#[derive(Debug, Clone, Copy, Default)]
pub struct CalibratedRoles;

impl RoleDerivation for CalibratedRoles {
    fn derive(&self, ctx: &DerivationContext<'_>, stats: &mut RegionStats) {
        let unit = &ctx.map.calibration.unit;

        for layer in ctx.map.pixels_layers() {
            let Some(role) = layer.role else { continue };
            let Some(sum) = stats.get(&sum_key(&layer.name, role)) else {
                continue;
            };

            let u = ctx.unit_length(layer);
            let n = ctx.cell_count(layer);

            match role {
                PixelRole::Area => {
                    let area = sum * u * u;
                    stats.insert(format!("{}_area_cal_{}", layer.name, unit), area);
                    insert_ratio(
                        stats,
                        format!("{}_area_fraction", layer.name),
                        area,
                        ctx.geometry.area_cal,
                    );
                }
                PixelRole::Holes => {
                    let holes = sum * u * u;
                    stats.insert(format!("{}_holes_area_cal_{}", layer.name, unit), holes);
                    stats.insert(
                        format!("area_cal_net_{}", unit),
                        ctx.geometry.area_cal - holes,
                    );
                }
                PixelRole::Density => {
                    insert_ratio(stats, format!("{}_density_mean", layer.name), sum, n);
                }
                PixelRole::Probability => {
                    stats.insert(format!("{}_expected_count", layer.name), sum);
                    insert_ratio(stats, format!("{}_probability_mean", layer.name), sum, n);
                }
            }
        }
    }
}

fn insert_ratio(stats: &mut RegionStats, key: String, numerator: f64, denominator: f64) {
    if denominator > 0.0 && denominator.is_finite() {
        stats.insert(key, numerator / denominator);
    } else {
        stats.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Calibration;

    fn map() -> MapContext {
        // One reference unit is 2 um; layers at twice the reference resolution
        MapContext::new(256.0, Calibration::new(512.0, 1.0, "um"))
            .with_layer(LayerDescriptor::pixels("a", "a/{x}_{y}.png", 512.0, 256.0, PixelRole::Area))
            .with_layer(LayerDescriptor::pixels("h", "h/{x}_{y}.png", 512.0, 256.0, PixelRole::Holes))
            .with_layer(LayerDescriptor::pixels("d", "d/{x}_{y}.png", 512.0, 256.0, PixelRole::Density))
            .with_layer(LayerDescriptor::pixels(
                "p",
                "p/{x}_{y}.png",
                512.0,
                256.0,
                PixelRole::Probability,
            ))
    }

    fn geometry(area_px: f64) -> GeometryStats {
        GeometryStats {
            area_px,
            area_cal: area_px * 4.0,
            volume_cal: area_px * 4.0,
        }
    }

    #[test]
    fn test_calibrated_roles() {
        let map = map();
        let geometry = geometry(100.0);
        let mut stats = RegionStats::new();
        stats.insert("a_area_sum_raw", 200.0);
        stats.insert("h_holes_sum_raw", 40.0);
        stats.insert("d_density_sum_raw", 80.0);
        stats.insert("p_probability_sum_raw", 20.0);

        let ctx = DerivationContext {
            geometry: &geometry,
            map: &map,
        };
        CalibratedRoles.derive(&ctx, &mut stats);

        // One layer cell is 1 um across; 400 cells cover the region
        assert_eq!(ctx.unit_length(&map.layers[0]), 1.0);
        assert_eq!(ctx.cell_count(&map.layers[0]), 400.0);

        assert_eq!(stats.get("a_area_cal_um"), Some(200.0));
        assert_eq!(stats.get("a_area_fraction"), Some(0.5));
        assert_eq!(stats.get("h_holes_area_cal_um"), Some(40.0));
        assert_eq!(stats.get("area_cal_net_um"), Some(360.0));
        assert_eq!(stats.get("d_density_mean"), Some(0.2));
        assert_eq!(stats.get("p_expected_count"), Some(20.0));
        assert_eq!(stats.get("p_probability_mean"), Some(0.05));
    }

    #[test]
    fn test_layers_without_sums_are_skipped() {
        let map = map();
        let geometry = geometry(100.0);
        let mut stats = RegionStats::new();
        stats.insert("a_area_sum_raw", 4.0);

        CalibratedRoles.derive(
            &DerivationContext {
                geometry: &geometry,
                map: &map,
            },
            &mut stats,
        );

        assert_eq!(stats.get("a_area_cal_um"), Some(4.0));
        assert_eq!(stats.get("area_cal_net_um"), None);
        assert_eq!(stats.get("d_density_mean"), None);
    }

    #[test]
    fn test_zero_area_leaves_out_ratios() {
        let map = map();
        let geometry = geometry(0.0);
        let mut stats = RegionStats::new();
        stats.insert("a_area_sum_raw", 4.0);
        stats.insert("p_probability_sum_raw", 3.0);

        CalibratedRoles.derive(
            &DerivationContext {
                geometry: &geometry,
                map: &map,
            },
            &mut stats,
        );

        assert_eq!(stats.get("a_area_fraction"), None);
        assert_eq!(stats.get("p_probability_mean"), None);
        assert_eq!(stats.get("p_expected_count"), Some(3.0));
    }

    #[test]
    fn test_no_derivation() {
        let map = map();
        let geometry = geometry(1.0);
        let mut stats = RegionStats::new();
        stats.insert("a_area_sum_raw", 4.0);

        NoDerivation.derive(
            &DerivationContext {
                geometry: &geometry,
                map: &map,
            },
            &mut stats,
        );
        assert_eq!(stats.len(), 1);
    }
}
