//! # Geographic Utilities
//!
//! Great-circle helpers used on raw GPS input before anything is projected.
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_distance`] | Great-circle distance between two GPS points |
//! | [`implied_speed`] | Speed implied by two timestamped fixes |
//!
//! Distances here are only used for validation (speed checks, deduplication).
//! Areas and buffers are never computed on lat/lng directly; see
//! [`crate::kernel::LocalProjection`].

use geo::{Distance, Haversine, Point};

use crate::{GpsPoint, TrackPoint};

/// Great-circle distance in meters (spherical Earth, mean radius).
///
/// ```rust
/// use fog_engine::{GpsPoint, geo_utils};
///
/// let london = GpsPoint::new(51.5074, -0.1278);
/// let paris = GpsPoint::new(48.8566, 2.3522);
/// let distance = geo_utils::haversine_distance(&london, &paris);
/// assert!((distance - 343_560.0).abs() < 1000.0);
/// ```
#[inline]
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let point1 = Point::new(p1.longitude, p1.latitude);
    let point2 = Point::new(p2.longitude, p2.latitude);
    Haversine::distance(point1, point2)
}

/// Speed in m/s between two fixes, or `None` when either lacks a timestamp.
///
/// A zero time delta with non-zero distance yields `f64::INFINITY`. Deltas
/// are taken in `f64`, so timestamps at the ends of the `i64` range are fine.
pub fn implied_speed(from: &TrackPoint, to: &TrackPoint) -> Option<f64> {
    let (t0, t1) = (from.timestamp?, to.timestamp?);
    let distance = haversine_distance(&from.position(), &to.position());
    let dt = t1 as f64 - t0 as f64;

    if dt <= 0.0 {
        return Some(if distance > 0.0 { f64::INFINITY } else { 0.0 });
    }
    Some(distance / dt)
}
