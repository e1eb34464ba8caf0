//! Track ingestion: validation and normalisation of raw GPS input.
//!
//! Rejection happens before any geometry work, so a rejected track never
//! touches stored state.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::{IngestConfig, SpeedPolicy};
use crate::error::{InvalidTrackReason, Result, UnveilError};
use crate::geo_utils::{haversine_distance, implied_speed};
use crate::TrackPoint;

/// Where a track came from; selects the buffer radius.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// Recorded route (e.g. GPX upload)
    Route,
    /// Single manual check-in point
    CheckIn,
}

/// A validated, normalised track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub kind: ActivityKind,
    /// Points in original order
    pub points: Vec<TrackPoint>,
    /// Points discarded by the speed filter
    pub dropped_points: usize,
}

impl Track {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Validates raw point sequences into [`Track`]s.
#[derive(Debug, Clone, Default)]
pub struct TrackIngestor {
    config: IngestConfig,
}

impl TrackIngestor {
    pub fn new(config: IngestConfig) -> Self {
        Self { config }
    }

    /// Validate a route: at least 2 points, in-range coordinates,
    /// non-decreasing timestamps and plausible speeds.
    pub fn ingest_route(&self, raw: &[TrackPoint]) -> Result<Track> {
        if raw.len() < 2 {
            return Err(UnveilError::invalid_track(
                InvalidTrackReason::TooFewPoints,
                format!("route has {} points, minimum 2 required", raw.len()),
            ));
        }
        if raw.len() > self.config.max_points {
            return Err(UnveilError::invalid_track(
                InvalidTrackReason::TooManyPoints,
                format!("route has {} points, maximum {}", raw.len(), self.config.max_points),
            ));
        }

        check_coordinates(raw)?;
        check_timestamps(raw)?;

        let (kept, dropped) = self.filter_speed(raw)?;
        if kept.len() < 2 {
            return Err(UnveilError::invalid_track(
                InvalidTrackReason::EmptyAfterFiltering,
                format!("{} of {} points dropped by speed filter", dropped, raw.len()),
            ));
        }

        let points = self.dedup(kept);
        debug!(
            "[Ingestor] Route accepted: {} raw, {} kept, {} dropped",
            raw.len(),
            points.len(),
            dropped
        );

        Ok(Track {
            kind: ActivityKind::Route,
            points,
            dropped_points: dropped,
        })
    }

    /// Validate a check-in: exactly one in-range point.
    pub fn ingest_checkin(&self, raw: &[TrackPoint]) -> Result<Track> {
        match raw.len() {
            0 => {
                return Err(UnveilError::invalid_track(
                    InvalidTrackReason::TooFewPoints,
                    "check-in requires exactly 1 point, got 0",
                ))
            }
            1 => {}
            n => {
                return Err(UnveilError::invalid_track(
                    InvalidTrackReason::TooManyPoints,
                    format!("check-in requires exactly 1 point, got {}", n),
                ))
            }
        }
        check_coordinates(raw)?;

        Ok(Track {
            kind: ActivityKind::CheckIn,
            points: raw.to_vec(),
            dropped_points: 0,
        })
    }

    fn filter_speed(&self, raw: &[TrackPoint]) -> Result<(Vec<TrackPoint>, usize)> {
        let mut kept: Vec<TrackPoint> = Vec::with_capacity(raw.len());
        let mut dropped = 0;

        for (i, point) in raw.iter().enumerate() {
            let speed = kept.last().and_then(|last| implied_speed(last, point));
            match speed {
                Some(speed) if speed > self.config.max_speed_mps => match self.config.speed_policy {
                    SpeedPolicy::Reject => {
                        return Err(UnveilError::invalid_track(
                            InvalidTrackReason::ImpossibleSpeed,
                            format!(
                                "point {} implies {:.1} m/s, limit {:.1} m/s",
                                i, speed, self.config.max_speed_mps
                            ),
                        ));
                    }
                    SpeedPolicy::DropPoint => {
                        warn!(
                            "[Ingestor] Dropping point {}: implied speed {:.1} m/s",
                            i, speed
                        );
                        dropped += 1;
                    }
                },
                _ => kept.push(*point),
            }
        }

        Ok((kept, dropped))
    }

    /// Merge consecutive near-duplicate points, always keeping the final point.
    fn dedup(&self, points: Vec<TrackPoint>) -> Vec<TrackPoint> {
        let tolerance = self.config.dedup_tolerance_m;
        let last = points.last().copied();
        let mut out: Vec<TrackPoint> = Vec::with_capacity(points.len());

        for point in points {
            let duplicate = out
                .last()
                .map(|prev| haversine_distance(&prev.position(), &point.position()) <= tolerance)
                .unwrap_or(false);
            if !duplicate {
                out.push(point);
            }
        }

        // Keep the true endpoint for continuity with the next activity
        if let (Some(end), Some(tail)) = (last, out.last_mut()) {
            if *tail != end {
                *tail = end;
            }
        }
        out
    }
}

fn check_coordinates(raw: &[TrackPoint]) -> Result<()> {
    match raw.iter().position(|p| !p.position().is_valid()) {
        Some(i) => Err(UnveilError::invalid_track(
            InvalidTrackReason::CoordinateOutOfRange,
            format!(
                "point {} ({}, {}) outside valid latitude/longitude range",
                i, raw[i].latitude, raw[i].longitude
            ),
        )),
        None => Ok(()),
    }
}

fn check_timestamps(raw: &[TrackPoint]) -> Result<()> {
    let mut previous: Option<i64> = None;
    for (i, point) in raw.iter().enumerate() {
        if let Some(ts) = point.timestamp {
            if let Some(prev) = previous {
                if ts < prev {
                    return Err(UnveilError::invalid_track(
                        InvalidTrackReason::NonMonotonicTimestamp,
                        format!("point {} timestamp {} precedes {}", i, ts, prev),
                    ));
                }
            }
            previous = Some(ts);
        }
    }
    Ok(())
}
