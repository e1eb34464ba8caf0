//! Mapbox Map Matching API client.
//!
//! Tracks longer than one request allows are split into evenly sized chunks
//! that are matched concurrently and stitched back in order. Tracepoints the
//! service could not match (`null`) keep their raw position.
//!
//! Mapbox reports OSM street names, not reference segment ids, so matched
//! positions are resolved against the region's [`ReferenceIndex`] when one is
//! registered. Without an index every point carries `street_id: None`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use log::{debug, info};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::{RoadSnapper, SnappedPoint};
use crate::error::{Result, SnapError, UnveilError};
use crate::ingest::Track;
use crate::reference::{ReferenceIndex, Region};
use crate::{GpsPoint, TrackPoint};

const MAX_IDLE_CONNECTIONS: usize = 8;

/// Connection settings for the Mapbox matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapboxConfig {
    pub access_token: String,
    /// Default: https://api.mapbox.com/matching/v5/mapbox/cycling
    pub base_url: String,
    /// Mapbox rejects requests above 100 coordinates. Default: 100
    pub max_coordinates_per_request: usize,
    /// Search radius per coordinate (meters). Default: 25
    pub radius_m: f64,
    /// Max distance (meters) from a matched position to the reference
    /// segment it is attributed to. Default: 5
    pub street_tolerance_m: f64,
}

impl Default for MapboxConfig {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            base_url: "https://api.mapbox.com/matching/v5/mapbox/cycling".to_string(),
            max_coordinates_per_request: 100,
            radius_m: 25.0,
            street_tolerance_m: 5.0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MatchResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    tracepoints: Vec<Option<Tracepoint>>,
}

#[derive(Debug, Deserialize)]
struct Tracepoint {
    /// `[lng, lat]`
    location: [f64; 2],
}

/// Network [`RoadSnapper`] backed by the Mapbox Map Matching API v5.
#[derive(Debug, Clone)]
pub struct MapboxSnapper {
    client: Client,
    config: MapboxConfig,
    indexes: HashMap<u32, Arc<ReferenceIndex>>,
}

impl MapboxSnapper {
    pub fn new(config: MapboxConfig) -> Result<Self> {
        if config.access_token.is_empty() {
            return Err(UnveilError::config("mapbox access_token is empty"));
        }
        if config.max_coordinates_per_request < 2 {
            return Err(UnveilError::config(
                "mapbox max_coordinates_per_request must be at least 2",
            ));
        }

        let client = Client::builder()
            .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| UnveilError::config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            indexes: HashMap::new(),
        })
    }

    /// Register a region's street index for segment id lookup.
    pub fn with_index(mut self, index: Arc<ReferenceIndex>) -> Self {
        self.indexes.insert(index.region_id(), index);
        self
    }

    /// Pair matched locations with their raw points and attribute each
    /// matched location to the nearest reference segment.
    fn attach_streets(&self, region: &Region, points: &[TrackPoint], locations: Vec<Option<GpsPoint>>) -> Vec<SnappedPoint> {
        let index = self.indexes.get(&region.id);
        let projection = region.projection();
        points
            .iter()
            .zip(locations)
            .map(|(raw, location)| match location {
                Some(position) => {
                    let street_id = index
                        .and_then(|index| {
                            index.nearest_street(projection.project(&position), self.config.street_tolerance_m)
                        })
                        .map(|(street, _)| street.id.clone());
                    SnappedPoint::new(position, street_id)
                }
                None => SnappedPoint::raw(raw.position()),
            })
            .collect()
    }

    fn request_url(&self, points: &[TrackPoint]) -> String {
        let coordinates = points
            .iter()
            .map(|p| format!("{:.6},{:.6}", p.longitude, p.latitude))
            .collect::<Vec<_>>()
            .join(";");
        let radiuses = vec![format!("{}", self.config.radius_m); points.len()].join(";");

        let mut url = format!(
            "{}/{}?access_token={}&overview=false&tidy=false&radiuses={}",
            self.config.base_url.trim_end_matches('/'),
            coordinates,
            self.config.access_token,
            radiuses
        );
        // Timestamps are only accepted when every coordinate has one
        if let Some(timestamps) = points.iter().map(|p| p.timestamp).collect::<Option<Vec<_>>>() {
            let joined = timestamps.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(";");
            url.push_str("&timestamps=");
            url.push_str(&joined);
        }
        url
    }

    async fn match_chunk(&self, points: &[TrackPoint]) -> std::result::Result<Vec<Option<GpsPoint>>, SnapError> {
        let response = self
            .client
            .get(self.request_url(points))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SnapError::Timeout { elapsed_ms: 30_000 }
                } else {
                    SnapError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000);
            return Err(SnapError::RateLimited { retry_after_ms });
        }
        if status.is_server_error() {
            return Err(SnapError::Transport(format!("HTTP {}", status)));
        }

        let body: MatchResponse = response
            .json()
            .await
            .map_err(|e| SnapError::InvalidResponse(format!("parse error: {}", e)))?;
        parse_response(points, body)
    }
}

/// Matched location per input point, `None` where the tracepoint is `null`.
fn parse_response(points: &[TrackPoint], body: MatchResponse) -> std::result::Result<Vec<Option<GpsPoint>>, SnapError> {
    match body.code.as_str() {
        "Ok" => {}
        "NoMatch" | "NoSegment" => return Err(SnapError::NoMatch),
        other => {
            return Err(SnapError::InvalidResponse(format!(
                "{}: {}",
                other,
                body.message.unwrap_or_default()
            )))
        }
    }

    if body.tracepoints.len() != points.len() {
        return Err(SnapError::InvalidResponse(format!(
            "{} tracepoints for {} coordinates",
            body.tracepoints.len(),
            points.len()
        )));
    }

    Ok(body
        .tracepoints
        .into_iter()
        .map(|tracepoint| tracepoint.map(|tp| GpsPoint::new(tp.location[1], tp.location[0])))
        .collect())
}

/// Split `len` items into the fewest chunks of at most `max`, sized evenly.
fn chunk_ranges(len: usize, max: usize) -> Vec<std::ops::Range<usize>> {
    if len == 0 {
        return Vec::new();
    }
    let chunks = len.div_ceil(max);
    let base = len / chunks;
    let extra = len % chunks;
    let mut start = 0;
    (0..chunks)
        .map(|i| {
            let size = base + usize::from(i < extra);
            let range = start..start + size;
            start += size;
            range
        })
        .collect()
}

impl RoadSnapper for MapboxSnapper {
    async fn match_track(
        &self,
        region: &Region,
        track: &Track,
    ) -> std::result::Result<Vec<SnappedPoint>, SnapError> {
        if track.len() < 2 {
            return Err(SnapError::NoMatch);
        }

        let ranges = chunk_ranges(track.len(), self.config.max_coordinates_per_request);
        debug!(
            "[MapboxSnapper] Matching {} points in {} requests for region {}",
            track.len(),
            ranges.len(),
            region.id
        );

        let chunks = try_join_all(
            ranges
                .into_iter()
                .map(|range| self.match_chunk(&track.points[range])),
        )
        .await?;

        let locations: Vec<Option<GpsPoint>> = chunks.into_iter().flatten().collect();
        let snapped = self.attach_streets(region, &track.points, locations);
        info!(
            "[MapboxSnapper] Matched {} points, {} on indexed streets",
            snapped.len(),
            snapped.iter().filter(|p| p.street_id.is_some()).count()
        );
        Ok(snapped)
    }
}
