//! # Fog Engine
//!
//! Incremental "fog of war" exploration tracking against fixed administrative
//! regions.
//!
//! This library provides:
//! - Track validation and normalisation (speed filter, deduplication)
//! - Road snapping behind a capability trait, with retry and raw fallback
//! - Metric buffering, merging and scoring of a user's unveiled area
//! - Newly covered street/block detection and replay frame generation
//!
//! ## Features
//!
//! - **`parallel`** - Parallel street/block scans with rayon
//! - **`http`** - Mapbox Map Matching client for road snapping
//! - **`persistence`** - SQLite-backed area store
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use fog_engine::{
//!     MemoryAreaStore, OfflineSnapper, PlanarKernel, ReferenceIndex, Region, RegionCatalog,
//!     TrackPoint, UnveilConfig, UnveilService,
//! };
//! use geo::polygon;
//! use std::sync::Arc;
//!
//! # tokio_test_block_on(async {
//! let region = Region::new(
//!     1,
//!     "Brooklyn",
//!     geo::MultiPolygon::new(vec![polygon![
//!         (x: -74.05, y: 40.57), (x: -73.83, y: 40.57),
//!         (x: -73.83, y: 40.74), (x: -74.05, y: 40.74),
//!     ]]),
//!     None,
//! )
//! .unwrap();
//! let catalog = RegionCatalog::new(vec![region]).unwrap();
//! let index = Arc::new(ReferenceIndex::empty(1));
//!
//! let service = UnveilService::new(
//!     UnveilConfig::default(),
//!     catalog,
//!     vec![index.clone()],
//!     OfflineSnapper::new(Default::default()).with_index(index),
//!     PlanarKernel::default(),
//!     Arc::new(MemoryAreaStore::new()),
//! )
//! .unwrap();
//!
//! service.bind_region("rider-1", 1).unwrap();
//! let route = vec![
//!     TrackPoint::new(40.650, -73.950),
//!     TrackPoint::new(40.652, -73.950),
//!     TrackPoint::new(40.654, -73.950),
//! ];
//! let event = service.import_track("rider-1", &route).await.unwrap();
//! assert!(event.delta_area_m2 > 0.0);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{InvalidTrackReason, OptionExt, Result, SnapError, UnveilError};

// Component configuration
pub mod config;
pub use config::{
    BufferConfig, DiffConfig, IngestConfig, KernelConfig, MergeConfig, ReplayConfig,
    SnapperConfig, SpeedPolicy, UnveilConfig,
};

// Geographic utilities (distance, bounds, speed on raw GPS)
pub mod geo_utils;

// Planar geometry kernel and metric projection
pub mod kernel;
pub use kernel::{GeometryKernel, LocalProjection, PlanarKernel};

// Track validation
pub mod ingest;
pub use ingest::{ActivityKind, Track, TrackIngestor};

// Region and street/block reference data
mod geojson;
pub mod reference;
pub use geojson::multi_polygon_to_geojson;
pub use reference::{
    CityBlock, ReferenceIndex, Region, RegionCatalog, RegionDetail, RegionSummary, StreetSegment,
};

// Road snapping (trait, adapter, offline double, optional Mapbox client)
pub mod snapper;
#[cfg(feature = "http")]
pub use snapper::mapbox::{MapboxConfig, MapboxSnapper};
pub use snapper::{MatchQuality, MatchedTrack, OfflineSnapper, RoadSnapper, SnappedPoint, SnapperAdapter};

// Buffer generation
pub mod buffer;
pub use buffer::BufferGenerator;

// Unveiled area state and merging
pub mod merge;
pub use merge::{AreaMerger, MergeOutcome, OwnerGuard, OwnerLocks, UnveiledArea};

// Owner/area storage
pub mod store;
pub use store::{AreaStore, MemoryAreaStore};

#[cfg(feature = "persistence")]
pub mod sqlite;
#[cfg(feature = "persistence")]
pub use sqlite::SqliteAreaStore;

// Percent explored
pub mod score;
pub use score::{ScoreCalculator, ScoreReport};

// Newly covered streets/blocks
pub mod diff;
pub use diff::{DiffEngine, DiffResult};

// Replay frames
pub mod replay;
pub use replay::{ReplayFrame, ReplaySequence, ReplaySequencer};

// Pipeline entry point
pub mod service;
pub use service::{EventStatus, UnveilEvent, UnveilService};

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use fog_engine::GpsPoint;
/// let point = GpsPoint::new(40.6782, -73.9442); // Brooklyn
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Raw track input: a position with an optional unix timestamp (seconds).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl TrackPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            timestamp: None,
        }
    }

    pub fn with_timestamp(latitude: f64, longitude: f64, timestamp: i64) -> Self {
        Self {
            latitude,
            longitude,
            timestamp: Some(timestamp),
        }
    }

    pub fn position(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }
}

impl From<GpsPoint> for TrackPoint {
    fn from(point: GpsPoint) -> Self {
        Self::new(point.latitude, point.longitude)
    }
}

/// Geographic bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Get the center point of the bounds.
    pub fn center(&self) -> GpsPoint {
        GpsPoint::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }
}

/// A (user, region) pair whose unveiled area is tracked independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId {
    pub user_id: String,
    pub region_id: u32,
}

impl OwnerId {
    pub fn new(user_id: impl Into<String>, region_id: u32) -> Self {
        Self {
            user_id: user_id.into(),
            region_id,
        }
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user_id, self.region_id)
    }
}

/// A user and their single active region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    /// `None` until the user picks a region
    pub region_id: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            region_id: None,
            created_at: Utc::now(),
        }
    }

    /// The owner currently receiving this user's imports.
    pub fn active_owner(&self) -> Option<OwnerId> {
        self.region_id
            .map(|region_id| OwnerId::new(self.user_id.clone(), region_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gps_point_validation() {
        assert!(GpsPoint::new(40.6782, -73.9442).is_valid());
        assert!(!GpsPoint::new(91.0, 0.0).is_valid());
        assert!(!GpsPoint::new(0.0, 181.0).is_valid());
        assert!(!GpsPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_bounds_center() {
        let bounds = Bounds {
            min_lat: 40.0,
            max_lat: 41.0,
            min_lng: -74.0,
            max_lng: -73.0,
        };
        assert_eq!(bounds.center(), GpsPoint::new(40.5, -73.5));
    }

    #[test]
    fn test_track_point_serde_omits_missing_timestamp() {
        let json = serde_json::to_string(&TrackPoint::new(1.0, 2.0)).unwrap();
        assert!(!json.contains("timestamp"));
        let parsed: TrackPoint = serde_json::from_str(r#"{"latitude":1.0,"longitude":2.0}"#).unwrap();
        assert_eq!(parsed.timestamp, None);
    }

    #[test]
    fn test_user_profile_active_owner() {
        let mut profile = UserProfile::new("u-1");
        assert!(profile.active_owner().is_none());
        profile.region_id = Some(3);
        assert_eq!(profile.active_owner(), Some(OwnerId::new("u-1", 3)));
        assert_eq!(OwnerId::new("u-1", 3).to_string(), "u-1@3");
    }
}
