//! # Road Snapping
//!
//! Boundary to the external map-matching collaborator.
//!
//! - [`RoadSnapper`]: capability trait any matcher implements
//! - [`SnapperAdapter`]: per-attempt timeout, bounded retry with exponential
//!   backoff, and fallback to raw geometry
//! - [`OfflineSnapper`]: deterministic matcher over the street index
//! - `mapbox::MapboxSnapper` (feature `http`): Mapbox Map Matching client
//!
//! The adapter never fails the pipeline. When matching is unavailable the raw
//! points come back flagged [`MatchQuality::UnmatchedFallback`].

#[cfg(feature = "http")]
pub mod mapbox;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::SnapperConfig;
use crate::error::{SnapError, UnveilError};
use crate::ingest::{ActivityKind, Track};
use crate::reference::{ReferenceIndex, Region};
use crate::{GpsPoint, TrackPoint};

/// One point returned by a matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnappedPoint {
    pub position: GpsPoint,
    /// Street segment the point was matched onto, if any
    pub street_id: Option<String>,
}

impl SnappedPoint {
    pub fn new(position: GpsPoint, street_id: Option<String>) -> Self {
        Self {
            position,
            street_id,
        }
    }

    pub fn raw(position: GpsPoint) -> Self {
        Self::new(position, None)
    }
}

/// Confidence of a [`MatchedTrack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchQuality {
    /// Points lie on the road network
    Matched,
    /// Matching failed; points are the raw input
    UnmatchedFallback,
}

/// Snapped (or raw fallback) points in input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedTrack {
    pub kind: ActivityKind,
    /// Same cardinality and order as the input track
    pub points: Vec<TrackPoint>,
    /// Street id per point, aligned with `points`
    pub street_ids: Vec<Option<String>>,
    pub quality: MatchQuality,
    /// Why matching was skipped, for fallback tracks
    pub fallback_reason: Option<SnapError>,
}

impl MatchedTrack {
    fn matched(track: &Track, snapped: Vec<SnappedPoint>) -> Self {
        let mut points = Vec::with_capacity(snapped.len());
        let mut street_ids = Vec::with_capacity(snapped.len());
        for (raw, snap) in track.points.iter().zip(snapped) {
            points.push(TrackPoint {
                latitude: snap.position.latitude,
                longitude: snap.position.longitude,
                timestamp: raw.timestamp,
            });
            street_ids.push(snap.street_id);
        }
        Self {
            kind: track.kind,
            points,
            street_ids,
            quality: MatchQuality::Matched,
            fallback_reason: None,
        }
    }

    fn fallback(track: &Track, reason: SnapError) -> Self {
        Self {
            kind: track.kind,
            points: track.points.clone(),
            street_ids: vec![None; track.points.len()],
            quality: MatchQuality::UnmatchedFallback,
            fallback_reason: Some(reason),
        }
    }

    pub fn positions(&self) -> Vec<GpsPoint> {
        self.points.iter().map(TrackPoint::position).collect()
    }

    /// Distinct street ids in first-seen order.
    pub fn matched_streets(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for id in self.street_ids.iter().flatten() {
            if !seen.contains(&id.as_str()) {
                seen.push(id.as_str());
            }
        }
        seen
    }

    pub fn is_fallback(&self) -> bool {
        self.quality == MatchQuality::UnmatchedFallback
    }
}

/// A road-matching collaborator.
///
/// Implementations must return exactly one point per input point, in order,
/// or a [`SnapError`] that keeps timeouts and rate limits apart from a real
/// no-match.
pub trait RoadSnapper: Send + Sync {
    fn match_track(
        &self,
        region: &Region,
        track: &Track,
    ) -> impl Future<Output = Result<Vec<SnappedPoint>, SnapError>> + Send;
}

/// Wraps a [`RoadSnapper`] with timeout, retry and fallback.
#[derive(Debug, Clone)]
pub struct SnapperAdapter<S> {
    snapper: S,
    config: SnapperConfig,
}

impl<S: RoadSnapper> SnapperAdapter<S> {
    pub fn new(snapper: S, config: SnapperConfig) -> Self {
        Self { snapper, config }
    }

    pub fn snapper(&self) -> &S {
        &self.snapper
    }

    /// Match `track`, falling back to its raw points on any failure.
    pub async fn snap(&self, region: &Region, track: &Track) -> MatchedTrack {
        match self.try_snap(region, track).await {
            Ok(snapped) => {
                debug!(
                    "[SnapperAdapter] Matched {} points in region {}",
                    snapped.len(),
                    region.id
                );
                MatchedTrack::matched(track, snapped)
            }
            Err(reason) => {
                let err = UnveilError::SnappingUnavailable(reason.clone());
                warn!("[SnapperAdapter] {}, using raw geometry", err);
                MatchedTrack::fallback(track, reason)
            }
        }
    }

    async fn try_snap(&self, region: &Region, track: &Track) -> Result<Vec<SnappedPoint>, SnapError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let started = Instant::now();
            let outcome =
                match tokio::time::timeout(self.config.timeout(), self.snapper.match_track(region, track)).await {
                    Ok(result) => result,
                    Err(_) => Err(SnapError::Timeout {
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    }),
                };

            let err = match outcome {
                Ok(points) if points.len() == track.len() => return Ok(points),
                Ok(points) => {
                    return Err(SnapError::InvalidResponse(format!(
                        "{} points returned for {} submitted",
                        points.len(),
                        track.len()
                    )))
                }
                Err(err) => err,
            };

            if !err.is_retryable() || attempt >= max_attempts {
                return Err(err);
            }

            let backoff = self.retry_delay(attempt, &err);
            warn!(
                "[SnapperAdapter] {} on attempt {}/{}, retry after {:?}",
                err, attempt, max_attempts, backoff
            );
            tokio::time::sleep(backoff).await;
        }
    }

    fn retry_delay(&self, attempt: u32, err: &SnapError) -> Duration {
        let backoff = self.config.backoff(attempt);
        match err {
            SnapError::RateLimited {
                retry_after_ms: Some(ms),
            } => backoff
                .max(Duration::from_millis(*ms))
                .min(Duration::from_millis(self.config.max_backoff_ms)),
            _ => backoff,
        }
    }
}

/// Deterministic matcher that snaps each point to the nearest indexed street.
///
/// Points further than `max_snap_distance_m` from any street keep their raw
/// position. If fewer than `min_matched_fraction` of the points snap, the
/// whole track is reported as [`SnapError::NoMatch`].
#[derive(Debug, Clone, Default)]
pub struct OfflineSnapper {
    config: SnapperConfig,
    indexes: HashMap<u32, Arc<ReferenceIndex>>,
}

impl OfflineSnapper {
    pub fn new(config: SnapperConfig) -> Self {
        Self {
            config,
            indexes: HashMap::new(),
        }
    }

    /// Register a region's street index.
    pub fn with_index(mut self, index: Arc<ReferenceIndex>) -> Self {
        self.indexes.insert(index.region_id(), index);
        self
    }

    fn snap_points(&self, region: &Region, track: &Track) -> Result<Vec<SnappedPoint>, SnapError> {
        let index = self.indexes.get(&region.id).ok_or(SnapError::NoMatch)?;
        if track.is_empty() {
            return Err(SnapError::NoMatch);
        }

        let projection = region.projection();
        let mut matched = 0usize;
        let snapped: Vec<SnappedPoint> = track
            .points
            .iter()
            .map(|p| {
                let position = p.position();
                match index.nearest_street(projection.project(&position), self.config.max_snap_distance_m) {
                    Some((street, on_street)) => {
                        matched += 1;
                        SnappedPoint::new(projection.unproject(on_street), Some(street.id.clone()))
                    }
                    None => SnappedPoint::raw(position),
                }
            })
            .collect();

        let fraction = matched as f64 / track.len() as f64;
        if fraction < self.config.min_matched_fraction {
            debug!(
                "[OfflineSnapper] Only {}/{} points near a street",
                matched,
                track.len()
            );
            return Err(SnapError::NoMatch);
        }
        Ok(snapped)
    }
}

impl RoadSnapper for OfflineSnapper {
    async fn match_track(&self, region: &Region, track: &Track) -> Result<Vec<SnappedPoint>, SnapError> {
        self.snap_points(region, track)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::StreetSegment;
    use geo::polygon;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn region() -> Region {
        Region::new(
            1,
            "Test",
            geo::MultiPolygon::new(vec![polygon![
                (x: -74.0, y: 40.6),
                (x: -73.9, y: 40.6),
                (x: -73.9, y: 40.7),
                (x: -74.0, y: 40.7),
            ]]),
            None,
        )
        .unwrap()
    }

    fn track(points: Vec<TrackPoint>) -> Track {
        Track {
            kind: ActivityKind::Route,
            points,
            dropped_points: 0,
        }
    }

    fn fast_config() -> SnapperConfig {
        SnapperConfig {
            timeout_ms: 50,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            ..SnapperConfig::default()
        }
    }

    /// Fails with `error` for the first `failures` calls, then echoes the input.
    struct Flaky {
        calls: AtomicU32,
        failures: u32,
        error: SnapError,
    }

    impl RoadSnapper for Flaky {
        async fn match_track(&self, _region: &Region, track: &Track) -> Result<Vec<SnappedPoint>, SnapError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(self.error.clone());
            }
            Ok(track
                .points
                .iter()
                .map(|p| SnappedPoint::new(p.position(), Some("s".to_string())))
                .collect())
        }
    }

    struct Hanging;

    impl RoadSnapper for Hanging {
        async fn match_track(&self, _region: &Region, _track: &Track) -> Result<Vec<SnappedPoint>, SnapError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(SnapError::NoMatch)
        }
    }

    struct Truncating;

    impl RoadSnapper for Truncating {
        async fn match_track(&self, _region: &Region, track: &Track) -> Result<Vec<SnappedPoint>, SnapError> {
            Ok(track.points[1..].iter().map(|p| SnappedPoint::raw(p.position())).collect())
        }
    }

    fn sample() -> Track {
        track(vec![
            TrackPoint::with_timestamp(40.65, -73.95, 0),
            TrackPoint::with_timestamp(40.651, -73.95, 20),
        ])
    }

    #[tokio::test]
    async fn test_retry_then_match() {
        let adapter = SnapperAdapter::new(
            Flaky {
                calls: AtomicU32::new(0),
                failures: 2,
                error: SnapError::RateLimited { retry_after_ms: None },
            },
            fast_config(),
        );
        let matched = adapter.snap(&region(), &sample()).await;
        assert_eq!(matched.quality, MatchQuality::Matched);
        assert_eq!(matched.points[1].timestamp, Some(20));
        assert_eq!(adapter.snapper().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_match_falls_back_without_retry() {
        let adapter = SnapperAdapter::new(
            Flaky {
                calls: AtomicU32::new(0),
                failures: 10,
                error: SnapError::NoMatch,
            },
            fast_config(),
        );
        let input = sample();
        let matched = adapter.snap(&region(), &input).await;
        assert!(matched.is_fallback());
        assert_eq!(matched.fallback_reason, Some(SnapError::NoMatch));
        assert_eq!(matched.points, input.points);
        assert_eq!(adapter.snapper().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let adapter = SnapperAdapter::new(
            Flaky {
                calls: AtomicU32::new(0),
                failures: 10,
                error: SnapError::Transport("connection reset".to_string()),
            },
            fast_config(),
        );
        let matched = adapter.snap(&region(), &sample()).await;
        assert!(matched.is_fallback());
        assert_eq!(adapter.snapper().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_falls_back() {
        let adapter = SnapperAdapter::new(
            Hanging,
            SnapperConfig {
                max_attempts: 1,
                ..fast_config()
            },
        );
        let matched = adapter.snap(&region(), &sample()).await;
        assert!(matches!(matched.fallback_reason, Some(SnapError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_cardinality_mismatch_falls_back() {
        let adapter = SnapperAdapter::new(Truncating, fast_config());
        let matched = adapter.snap(&region(), &sample()).await;
        assert!(matches!(matched.fallback_reason, Some(SnapError::InvalidResponse(_))));
        assert_eq!(matched.points.len(), 2);
    }

    #[test]
    fn test_fallback_reason_serializes() {
        let matched = MatchedTrack::fallback(
            &sample(),
            SnapError::RateLimited {
                retry_after_ms: Some(1500),
            },
        );
        let json = serde_json::to_value(&matched).unwrap();
        assert_eq!(json["quality"], "unmatched-fallback");
        assert_eq!(json["fallback_reason"]["rate_limited"]["retry_after_ms"], 1500);

        let restored: MatchedTrack = serde_json::from_value(json).unwrap();
        assert_eq!(restored, matched);

        let transport = serde_json::to_string(&SnapError::Transport("reset".to_string())).unwrap();
        assert_eq!(transport, r#"{"transport":"reset"}"#);
        assert_eq!(serde_json::to_string(&SnapError::NoMatch).unwrap(), r#""no_match""#);
    }

    #[tokio::test]
    async fn test_matched_streets_are_distinct_in_order() {
        let adapter = SnapperAdapter::new(
            Flaky {
                calls: AtomicU32::new(0),
                failures: 0,
                error: SnapError::NoMatch,
            },
            fast_config(),
        );
        let matched = adapter.snap(&region(), &sample()).await;
        assert_eq!(matched.street_ids.len(), matched.points.len());
        assert_eq!(matched.matched_streets(), vec!["s"]);

        let fallback = MatchedTrack::fallback(&sample(), SnapError::NoMatch);
        assert!(fallback.matched_streets().is_empty());
    }

    #[tokio::test]
    async fn test_offline_snapper() {
        let region = region();
        let street = StreetSegment::from_points(
            "kent-ave",
            None,
            &[GpsPoint::new(40.65, -73.96), GpsPoint::new(40.66, -73.96)],
            region.projection(),
        );
        let index = Arc::new(ReferenceIndex::new(1, vec![street], vec![]).unwrap());
        let snapper = OfflineSnapper::new(SnapperConfig::default()).with_index(index);

        // ~8m east of the street
        let near = track(vec![TrackPoint::new(40.652, -73.9599), TrackPoint::new(40.654, -73.9599)]);
        let snapped = snapper.match_track(&region, &near).await.unwrap();
        assert_eq!(snapped.len(), 2);
        assert!(snapped.iter().all(|p| p.street_id.as_deref() == Some("kent-ave")));
        assert!((snapped[0].position.longitude - -73.96).abs() < 1e-6);

        // ~850m east: nothing within 30m
        let far = track(vec![TrackPoint::new(40.652, -73.95), TrackPoint::new(40.654, -73.95)]);
        assert_eq!(snapper.match_track(&region, &far).await, Err(SnapError::NoMatch));
    }
}
