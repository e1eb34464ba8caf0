//! Percent of a region explored.
//!
//! Computed from stored geometry alone, so it can be queried at any time
//! without replaying history.

use geo::MultiPolygon;
use serde::{Deserialize, Serialize};

use crate::kernel::GeometryKernel;
use crate::reference::Region;

/// Exploration score for one owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreReport {
    pub region_id: u32,
    pub region_name: String,
    /// Full precision, clamped to [0, 100]
    pub percent_explored: f64,
    /// Rounded half-up to two decimals
    pub percent_display: f64,
    pub total_area_m2: f64,
    pub unveiled_area_m2: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreCalculator;

impl ScoreCalculator {
    /// Score `geometry` (metric, region projection) against `region`.
    pub fn score<K: GeometryKernel + ?Sized>(
        &self,
        kernel: &K,
        region: &Region,
        geometry: &MultiPolygon<f64>,
    ) -> ScoreReport {
        let unveiled_area_m2 = kernel.intersection_area(geometry, region.projected_boundary());
        let percent_explored = percent(unveiled_area_m2, region.total_area_m2());

        ScoreReport {
            region_id: region.id,
            region_name: region.name.clone(),
            percent_explored,
            percent_display: round_half_up(percent_explored, 2),
            total_area_m2: region.total_area_m2(),
            unveiled_area_m2,
        }
    }
}

/// `unveiled / total * 100`, clamped; 0 for a non-positive total.
pub fn percent(unveiled: f64, total: f64) -> f64 {
    if total.is_nan() || total <= 0.0 || !unveiled.is_finite() {
        return 0.0;
    }
    (unveiled / total * 100.0).clamp(0.0, 100.0)
}

/// Round half away from zero at `decimals` places, for non-negative input.
pub fn round_half_up(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    // Nudge absorbs binary representation error (0.125 * 100 = 12.499999...)
    ((value * factor) + 0.5 + 1e-9).floor() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::PlanarKernel;
    use geo::{polygon, Coord};

    #[test]
    fn test_percent_clamped() {
        assert_eq!(percent(50.0, 100.0), 50.0);
        assert_eq!(percent(100.000001, 100.0), 100.0);
        assert_eq!(percent(-1.0, 100.0), 0.0);
        assert_eq!(percent(10.0, 0.0), 0.0);
        assert_eq!(percent(f64::NAN, 100.0), 0.0);
    }

    #[test]
    fn test_round_half_up() {
        assert_eq!(round_half_up(0.125, 2), 0.13);
        assert_eq!(round_half_up(0.124, 2), 0.12);
        assert_eq!(round_half_up(0.025, 2), 0.03);
        assert_eq!(round_half_up(99.999, 2), 100.0);
        assert_eq!(round_half_up(0.0, 2), 0.0);
    }

    #[test]
    fn test_score_against_region() {
        let region = Region::new(
            1,
            "Box",
            MultiPolygon::new(vec![polygon![
                (x: -73.96, y: 40.64),
                (x: -73.94, y: 40.64),
                (x: -73.94, y: 40.66),
                (x: -73.96, y: 40.66),
            ]]),
            Some(100_000_000.0),
        )
        .unwrap();
        let kernel = PlanarKernel::default();
        let disc = kernel.buffer_point(Coord { x: 0.0, y: 0.0 }, 100.0);

        let report = ScoreCalculator.score(&kernel, &region, &disc);
        assert_eq!(report.region_name, "Box");
        // Boolean ops may shift vertices slightly, so compare relatively
        let disc_area = kernel.area(&disc);
        assert!((report.unveiled_area_m2 - disc_area).abs() / disc_area < 1e-6);
        assert!((report.percent_explored - 0.0314).abs() < 0.0002);
        assert_eq!(report.percent_display, 0.03);

        let empty = ScoreCalculator.score(&kernel, &region, &MultiPolygon::new(vec![]));
        assert_eq!(empty.percent_explored, 0.0);
    }
}
