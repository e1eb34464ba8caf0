//! # Geometry Kernel
//!
//! Planar polygon/polyline primitives behind the [`GeometryKernel`] trait so
//! the pipeline never depends on a particular geometry engine.
//!
//! All kernel inputs and outputs are in a metric [`LocalProjection`].
//! Feeding lat/lng geometry to a kernel gives meaningless buffers and areas.
//!
//! ## Contract
//! - `repair` is idempotent: `repair(repair(x)) == repair(x)` up to tolerance
//! - `union` is commutative, associative and idempotent up to tolerance
//! - buffers use round joins and round caps

mod projection;
mod repair;

use std::f64::consts::PI;

use geo::{Area, BooleanOps, Coord, Intersects, LineString, MultiLineString, MultiPolygon, Polygon};

use crate::config::KernelConfig;
use crate::error::Result;

pub use projection::{LocalProjection, EARTH_RADIUS_M};
pub use repair::RepairPolicy;
pub(crate) use repair::union_all;

/// Capability interface over a planar geometry engine.
pub trait GeometryKernel: Send + Sync {
    /// Round-capped, round-joined buffer around a polyline.
    ///
    /// A line whose vertices collapse to one point is buffered as a disc.
    fn buffer_line(&self, line: &LineString<f64>, radius: f64) -> MultiPolygon<f64>;

    /// Disc of `radius` around `center`.
    fn buffer_point(&self, center: Coord<f64>, radius: f64) -> MultiPolygon<f64>;

    fn union(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> MultiPolygon<f64>;

    fn intersection(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> MultiPolygon<f64>;

    /// Set difference `a - b`.
    fn difference(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> MultiPolygon<f64>;

    /// Unsigned area in m².
    fn area(&self, geometry: &MultiPolygon<f64>) -> f64;

    fn intersection_area(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> f64 {
        self.area(&self.intersection(a, b))
    }

    /// Fix self-intersections and degenerate rings.
    fn repair(&self, geometry: &MultiPolygon<f64>) -> Result<MultiPolygon<f64>>;

    /// Length in meters of `line` lying inside `area`.
    fn covered_length(&self, area: &MultiPolygon<f64>, line: &LineString<f64>) -> f64;

    /// Whether `a` and `b` share at least one point.
    fn intersects(&self, a: &MultiPolygon<f64>, b: &Polygon<f64>) -> bool;
}

/// [`GeometryKernel`] backed by the `geo` crate's boolean operations.
#[derive(Debug, Clone)]
pub struct PlanarKernel {
    arc_segments: usize,
    repair: RepairPolicy,
}

impl PlanarKernel {
    pub fn new(config: &KernelConfig) -> Self {
        Self {
            arc_segments: config.arc_segments.max(8) as usize,
            repair: RepairPolicy {
                grid_steps_m: config.repair_grid_steps_m.clone(),
                min_ring_area_m2: config.min_ring_area_m2,
            },
        }
    }

    fn disc(&self, center: Coord<f64>, radius: f64) -> Polygon<f64> {
        let n = self.arc_segments;
        let ring: Vec<Coord<f64>> = (0..n)
            .map(|k| {
                let theta = 2.0 * PI * k as f64 / n as f64;
                Coord {
                    x: center.x + radius * theta.cos(),
                    y: center.y + radius * theta.sin(),
                }
            })
            .collect();
        Polygon::new(LineString::new(ring), vec![])
    }

    /// Rectangle of half-width `radius` around segment `a -> b`, counter-clockwise.
    fn segment_body(a: Coord<f64>, b: Coord<f64>, radius: f64) -> Polygon<f64> {
        let (dx, dy) = (b.x - a.x, b.y - a.y);
        let len = (dx * dx + dy * dy).sqrt();
        let (nx, ny) = (-dy / len * radius, dx / len * radius);
        Polygon::new(
            LineString::new(vec![
                Coord { x: a.x - nx, y: a.y - ny },
                Coord { x: b.x - nx, y: b.y - ny },
                Coord { x: b.x + nx, y: b.y + ny },
                Coord { x: a.x + nx, y: a.y + ny },
            ]),
            vec![],
        )
    }
}

impl Default for PlanarKernel {
    fn default() -> Self {
        Self::new(&KernelConfig::default())
    }
}

/// Drop consecutive vertices closer than `tolerance` (meters).
pub(crate) fn dedup_coords(line: &LineString<f64>, tolerance: f64) -> Vec<Coord<f64>> {
    let mut out: Vec<Coord<f64>> = Vec::with_capacity(line.0.len());
    for c in line.coords() {
        match out.last() {
            Some(last) if distance(*last, *c) <= tolerance => {}
            _ => out.push(*c),
        }
    }
    out
}

#[inline]
pub(crate) fn distance(a: Coord<f64>, b: Coord<f64>) -> f64 {
    (a.x - b.x).hypot(a.y - b.y)
}

fn line_length(line: &LineString<f64>) -> f64 {
    line.0.windows(2).map(|w| distance(w[0], w[1])).sum()
}

impl GeometryKernel for PlanarKernel {
    fn buffer_line(&self, line: &LineString<f64>, radius: f64) -> MultiPolygon<f64> {
        let coords = dedup_coords(line, 1e-9);
        match coords.len() {
            0 => MultiPolygon::new(vec![]),
            1 => self.buffer_point(coords[0], radius),
            _ => {
                // Discs at every vertex give round joins and caps
                let mut parts: Vec<MultiPolygon<f64>> = coords
                    .iter()
                    .map(|c| MultiPolygon::new(vec![self.disc(*c, radius)]))
                    .collect();
                parts.extend(
                    coords
                        .windows(2)
                        .map(|w| MultiPolygon::new(vec![Self::segment_body(w[0], w[1], radius)])),
                );
                union_all(parts)
            }
        }
    }

    fn buffer_point(&self, center: Coord<f64>, radius: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![self.disc(center, radius)])
    }

    fn union(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> MultiPolygon<f64> {
        if a.0.is_empty() {
            return b.clone();
        }
        if b.0.is_empty() {
            return a.clone();
        }
        a.union(b)
    }

    fn intersection(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> MultiPolygon<f64> {
        if a.0.is_empty() || b.0.is_empty() {
            return MultiPolygon::new(vec![]);
        }
        a.intersection(b)
    }

    fn difference(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> MultiPolygon<f64> {
        if a.0.is_empty() || b.0.is_empty() {
            return a.clone();
        }
        a.difference(b)
    }

    fn area(&self, geometry: &MultiPolygon<f64>) -> f64 {
        geometry.unsigned_area()
    }

    fn repair(&self, geometry: &MultiPolygon<f64>) -> Result<MultiPolygon<f64>> {
        repair::repair(geometry, &self.repair)
    }

    fn covered_length(&self, area: &MultiPolygon<f64>, line: &LineString<f64>) -> f64 {
        if area.0.is_empty() || line.0.len() < 2 {
            return 0.0;
        }
        let inside = area.clip(&MultiLineString::new(vec![line.clone()]), false);
        inside.0.iter().map(line_length).sum()
    }

    fn intersects(&self, a: &MultiPolygon<f64>, b: &Polygon<f64>) -> bool {
        a.0.iter().any(|part| part.intersects(b))
    }
}
