//! Pipeline configuration.
//!
//! Every component takes a small plain config struct with documented
//! defaults. [`UnveilConfig`] groups them and can be loaded from JSON where
//! any omitted field keeps its default.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UnveilError};

/// What the ingestor does with a point implying an impossible speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedPolicy {
    /// Discard the offending point and keep going
    DropPoint,
    /// Reject the whole track
    Reject,
}

/// Configuration for track validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Maximum number of points accepted in one track.
    /// Default: 10_000
    pub max_points: usize,
    /// Maximum implied speed between consecutive timestamped points (m/s).
    /// Default: 55.0 (~200 km/h, well above any cycling or running speed)
    pub max_speed_mps: f64,
    /// Default: DropPoint
    pub speed_policy: SpeedPolicy,
    /// Consecutive points closer than this are merged (meters).
    /// Default: 0.5
    pub dedup_tolerance_m: f64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_points: 10_000,
            max_speed_mps: 55.0,
            speed_policy: SpeedPolicy::DropPoint,
            dedup_tolerance_m: 0.5,
        }
    }
}

/// Configuration for the road snapper adapter and the offline snapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapperConfig {
    /// Per-attempt timeout. Default: 5_000ms
    pub timeout_ms: u64,
    /// Attempts before falling back to raw geometry. Default: 3
    pub max_attempts: u32,
    /// First retry delay, doubled on each retry. Default: 250ms
    pub initial_backoff_ms: u64,
    /// Cap on the retry delay. Default: 4_000ms
    pub max_backoff_ms: u64,
    /// Offline snapper: fraction of points that must snap for a confident match.
    /// Default: 0.6
    pub min_matched_fraction: f64,
    /// Offline snapper: furthest a point may move onto a street (meters).
    /// Default: 30.0
    pub max_snap_distance_m: f64,
}

impl SnapperConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

impl Default for SnapperConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 4_000,
            min_matched_fraction: 0.6,
            max_snap_distance_m: 30.0,
        }
    }
}

/// Configuration for buffer generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Half-width of a route buffer (meters). Default: 25.0
    pub route_radius_m: f64,
    /// Radius of a check-in disc (meters). Default: 100.0
    pub checkin_radius_m: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            route_radius_m: 25.0,
            checkin_radius_m: 100.0,
        }
    }
}

/// Configuration for the planar geometry kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Vertices used to approximate a full circle. Default: 64
    pub arc_segments: u32,
    /// Grid steps (meters) for bounded repair retries, tried in order.
    /// Default: [1e-6, 1e-3, 1e-2]
    pub repair_grid_steps_m: Vec<f64>,
    /// Rings below this area are dropped as slivers (m²). Default: 1e-6
    pub min_ring_area_m2: f64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            arc_segments: 64,
            repair_grid_steps_m: vec![1e-6, 1e-3, 1e-2],
            min_ring_area_m2: 1e-6,
        }
    }
}

/// Configuration for the area merger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Minimum area gain (m²) for a merge to replace stored geometry.
    /// Default: 0.01
    pub area_epsilon_m2: f64,
    /// How long an import waits for the owner's lock. Default: 10_000ms
    pub lock_timeout_ms: u64,
}

impl MergeConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            area_epsilon_m2: 0.01,
            lock_timeout_ms: 10_000,
        }
    }
}

/// Configuration for street/block diffing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    /// Fraction of a street segment's length that must fall inside the new
    /// area for the segment to count as covered.
    /// Default: 0.5
    pub min_street_coverage: f64,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            min_street_coverage: 0.5,
        }
    }
}

/// Configuration for replay frame generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Upper bound on frames per import; points are grouped when exceeded.
    /// Default: 60
    pub max_frames: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self { max_frames: 60 }
    }
}

/// Full pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnveilConfig {
    pub ingest: IngestConfig,
    pub snapper: SnapperConfig,
    pub buffer: BufferConfig,
    pub kernel: KernelConfig,
    pub merge: MergeConfig,
    pub diff: DiffConfig,
    pub replay: ReplayConfig,
}

impl UnveilConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| UnveilError::config(format!("invalid JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| UnveilError::config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<()> {
        fn positive(name: &str, value: f64) -> Result<()> {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(UnveilError::config(format!("{} must be positive, got {}", name, value)))
            }
        }

        positive("ingest.max_speed_mps", self.ingest.max_speed_mps)?;
        positive("buffer.route_radius_m", self.buffer.route_radius_m)?;
        positive("buffer.checkin_radius_m", self.buffer.checkin_radius_m)?;
        positive("snapper.max_snap_distance_m", self.snapper.max_snap_distance_m)?;

        if self.ingest.max_points < 2 {
            return Err(UnveilError::config("ingest.max_points must be at least 2"));
        }
        if !(0.0..=1.0).contains(&self.diff.min_street_coverage) {
            return Err(UnveilError::config(
                "diff.min_street_coverage must be within [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&self.snapper.min_matched_fraction) {
            return Err(UnveilError::config(
                "snapper.min_matched_fraction must be within [0, 1]",
            ));
        }
        if self.snapper.max_attempts == 0 {
            return Err(UnveilError::config("snapper.max_attempts must be at least 1"));
        }
        if self.kernel.arc_segments < 8 {
            return Err(UnveilError::config("kernel.arc_segments must be at least 8"));
        }
        if self.kernel.repair_grid_steps_m.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
            return Err(UnveilError::config("kernel.repair_grid_steps_m must be positive"));
        }
        if self.replay.max_frames == 0 {
            return Err(UnveilError::config("replay.max_frames must be at least 1"));
        }
        if !(self.merge.area_epsilon_m2.is_finite() && self.merge.area_epsilon_m2 >= 0.0) {
            return Err(UnveilError::config("merge.area_epsilon_m2 must be non-negative"));
        }
        Ok(())
    }
}
