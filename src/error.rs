//! Unified error handling for the unveil pipeline.
//!
//! Every fallible operation in the crate returns [`Result`]. The variants map
//! onto the pipeline stages: input validation, road matching, geometry repair,
//! owner/region resolution and per-owner serialization.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::OwnerId;

/// Reason code attached to [`UnveilError::InvalidTrack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidTrackReason {
    /// Route with fewer than 2 points, or a check-in that is not exactly 1 point
    TooFewPoints,
    /// More points than the ingest limit allows
    TooManyPoints,
    /// Latitude/longitude outside the valid range or not finite
    CoordinateOutOfRange,
    /// A timestamp earlier than its predecessor
    NonMonotonicTimestamp,
    /// Implied speed between consecutive points exceeds the configured limit
    ImpossibleSpeed,
    /// Every point was discarded by the speed filter or deduplication
    EmptyAfterFiltering,
}

impl fmt::Display for InvalidTrackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            InvalidTrackReason::TooFewPoints => "too_few_points",
            InvalidTrackReason::TooManyPoints => "too_many_points",
            InvalidTrackReason::CoordinateOutOfRange => "coordinate_out_of_range",
            InvalidTrackReason::NonMonotonicTimestamp => "non_monotonic_timestamp",
            InvalidTrackReason::ImpossibleSpeed => "impossible_speed",
            InvalidTrackReason::EmptyAfterFiltering => "empty_after_filtering",
        };
        f.write_str(code)
    }
}

/// Failure reported by a road-matching collaborator.
///
/// Timeouts and rate limits are kept apart from a genuine "no match" so the
/// adapter can retry the former and fall back immediately on the latter.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapError {
    #[error("road matching timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
    #[error("road matching rate limited")]
    RateLimited { retry_after_ms: Option<u64> },
    #[error("no confident road match")]
    NoMatch,
    #[error("road matching transport error: {0}")]
    Transport(String),
    #[error("invalid road matching response: {0}")]
    InvalidResponse(String),
}

impl SnapError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SnapError::Timeout { .. } | SnapError::RateLimited { .. } | SnapError::Transport(_)
        )
    }
}

/// Unified error type for unveil operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UnveilError {
    /// Malformed, too sparse or physically impossible input
    #[error("invalid track ({reason}): {detail}")]
    InvalidTrack {
        reason: InvalidTrackReason,
        detail: String,
    },
    /// Road matching failed; the pipeline continues on raw geometry
    #[error("road snapping unavailable: {0}")]
    SnappingUnavailable(SnapError),
    /// Buffering or union produced topology that could not be repaired
    #[error("geometry repair failed after {attempts} attempts: {message}")]
    GeometryRepair { message: String, attempts: u32 },
    /// Import attempted for a user with no bound region
    #[error("user '{user_id}' has not selected a region")]
    RegionNotSelected { user_id: String },
    /// Per-owner serialization could not be acquired in time
    #[error("timed out after {waited_ms}ms waiting for owner {owner}")]
    ConcurrencyTimeout { owner: OwnerId, waited_ms: u64 },
    /// Region id not present in the catalog
    #[error("unknown region {region_id}")]
    UnknownRegion { region_id: u32 },
    /// Malformed region/street/block reference data
    #[error("reference data error: {message}")]
    ReferenceData { message: String },
    /// Storage backend failure
    #[error("persistence error: {message}")]
    Persistence { message: String },
    /// Invalid configuration
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl UnveilError {
    pub(crate) fn invalid_track(reason: InvalidTrackReason, detail: impl Into<String>) -> Self {
        UnveilError::InvalidTrack {
            reason,
            detail: detail.into(),
        }
    }

    pub(crate) fn reference(message: impl Into<String>) -> Self {
        UnveilError::ReferenceData {
            message: message.into(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        UnveilError::Config {
            message: message.into(),
        }
    }

    /// Whether the caller can simply retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UnveilError::ConcurrencyTimeout { .. })
    }
}

impl From<serde_json::Error> for UnveilError {
    fn from(err: serde_json::Error) -> Self {
        UnveilError::reference(format!("json: {}", err))
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for UnveilError {
    fn from(err: rusqlite::Error) -> Self {
        UnveilError::Persistence {
            message: err.to_string(),
        }
    }
}

/// Result type alias for unveil operations.
pub type Result<T> = std::result::Result<T, UnveilError>;

/// Extension trait for converting Option to UnveilError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a region-not-selected error.
    fn ok_or_region_not_selected(self, user_id: &str) -> Result<T>;

    /// Convert Option to Result with an unknown-region error.
    fn ok_or_unknown_region(self, region_id: u32) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_region_not_selected(self, user_id: &str) -> Result<T> {
        self.ok_or_else(|| UnveilError::RegionNotSelected {
            user_id: user_id.to_string(),
        })
    }

    fn ok_or_unknown_region(self, region_id: u32) -> Result<T> {
        self.ok_or(UnveilError::UnknownRegion { region_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = UnveilError::invalid_track(InvalidTrackReason::TooFewPoints, "1 point");
        assert!(err.to_string().contains("too_few_points"));
        assert!(err.to_string().contains("1 point"));

        let err = UnveilError::RegionNotSelected {
            user_id: "u-1".to_string(),
        };
        assert!(err.to_string().contains("u-1"));
    }

    #[test]
    fn test_option_ext() {
        let none: Option<i32> = None;
        assert!(matches!(
            none.ok_or_region_not_selected("u-1"),
            Err(UnveilError::RegionNotSelected { .. })
        ));
        assert!(matches!(
            None::<i32>.ok_or_unknown_region(7),
            Err(UnveilError::UnknownRegion { region_id: 7 })
        ));
        assert_eq!(Some(3).ok_or_unknown_region(7), Ok(3));
    }

    #[test]
    fn test_snap_error_retryable() {
        assert!(SnapError::Timeout { elapsed_ms: 10 }.is_retryable());
        assert!(SnapError::RateLimited {
            retry_after_ms: None
        }
        .is_retryable());
        assert!(!SnapError::NoMatch.is_retryable());
        assert!(!SnapError::InvalidResponse("x".into()).is_retryable());
    }
}
