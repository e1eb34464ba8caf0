//! Buffer generation: the area credited for passing near a track.
//!
//! Routes get a round-capped corridor, check-ins a disc. Radii differ by
//! [`ActivityKind`]. Output is in the region's metric projection.

use geo::MultiPolygon;
use log::debug;

use crate::config::BufferConfig;
use crate::ingest::ActivityKind;
use crate::kernel::{GeometryKernel, LocalProjection};
use crate::GpsPoint;

#[derive(Debug, Clone, Default)]
pub struct BufferGenerator {
    config: BufferConfig,
}

impl BufferGenerator {
    pub fn new(config: BufferConfig) -> Self {
        Self { config }
    }

    /// Radius in meters for an activity kind.
    pub fn radius_for(&self, kind: ActivityKind) -> f64 {
        match kind {
            ActivityKind::Route => self.config.route_radius_m,
            ActivityKind::CheckIn => self.config.checkin_radius_m,
        }
    }

    /// Buffer `points` in `projection` space.
    ///
    /// A route that has collapsed to a single point is buffered as a disc with
    /// the route radius.
    pub fn generate<K: GeometryKernel + ?Sized>(
        &self,
        kernel: &K,
        kind: ActivityKind,
        points: &[GpsPoint],
        projection: &LocalProjection,
    ) -> MultiPolygon<f64> {
        let radius = self.radius_for(kind);
        let buffer = match (kind, points) {
            (_, []) => MultiPolygon::new(vec![]),
            (ActivityKind::CheckIn, _) | (_, [_]) => {
                kernel.buffer_point(projection.project(&points[0]), radius)
            }
            (ActivityKind::Route, _) => kernel.buffer_line(&projection.project_points(points), radius),
        };

        debug!(
            "[BufferGenerator] {:?} with {} points, radius {}m -> {} parts",
            kind,
            points.len(),
            radius,
            buffer.0.len()
        );
        buffer
    }
}
