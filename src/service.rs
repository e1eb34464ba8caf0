//! # Unveil Service
//!
//! The import pipeline and the caller-facing surface.
//!
//! ```text
//! raw points -> TrackIngestor -> SnapperAdapter -> BufferGenerator
//!            -> [owner lock] AreaMerger -> DiffEngine -> AreaStore::save_area [unlock]
//!            -> ScoreCalculator + ReplaySequencer -> UnveilEvent
//! ```
//!
//! Everything before the owner lock is side-effect free, and the only write
//! is the final `save_area`. Dropping an import future at any await point
//! therefore leaves stored state untouched.
//!
//! Different owners never contend. Imports for the same owner queue on its
//! lock in submission order.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, info};
use serde::ser::{Serialize, SerializeStructVariant, Serializer};

use crate::buffer::BufferGenerator;
use crate::config::UnveilConfig;
use crate::diff::{DiffEngine, DiffResult};
use crate::error::{OptionExt, Result, SnapError, UnveilError};
use crate::ingest::{ActivityKind, Track, TrackIngestor};
use crate::kernel::GeometryKernel;
use crate::merge::{AreaMerger, UnveiledArea};
use crate::reference::{ReferenceIndex, Region, RegionCatalog, RegionDetail, RegionSummary};
use crate::replay::{ReplaySequence, ReplaySequencer};
use crate::score::{ScoreCalculator, ScoreReport};
use crate::snapper::{MatchQuality, MatchedTrack, RoadSnapper, SnapperAdapter};
use crate::store::AreaStore;
use crate::{GpsPoint, OwnerId, TrackPoint, UserProfile};

/// Outcome of one import.
#[derive(Debug, Clone, PartialEq)]
pub enum EventStatus {
    /// Stored area grew
    Applied,
    /// Nothing new inside the region; stored area untouched
    NoChange,
    /// Merge aborted; stored area untouched
    Failed(UnveilError),
}

impl Serialize for EventStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            EventStatus::Applied => serializer.serialize_unit_variant("EventStatus", 0, "applied"),
            EventStatus::NoChange => serializer.serialize_unit_variant("EventStatus", 1, "no_change"),
            EventStatus::Failed(err) => {
                let mut variant = serializer.serialize_struct_variant("EventStatus", 2, "failed", 1)?;
                variant.serialize_field("error", &err.to_string())?;
                variant.end()
            }
        }
    }
}

/// Result record of one route import or check-in.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UnveilEvent {
    pub owner: OwnerId,
    pub activity_kind: ActivityKind,
    pub status: EventStatus,
    /// `None` for check-ins, which are never map-matched
    pub match_quality: Option<MatchQuality>,
    /// Why the route was imported unmatched
    pub fallback_reason: Option<SnapError>,
    /// Streets the snapper placed the route on, in first-seen order
    pub matched_street_ids: Vec<String>,
    /// Points discarded by the ingest speed filter
    pub dropped_points: usize,
    pub delta_area_m2: f64,
    /// Score after this import
    pub score: ScoreReport,
    pub new_street_ids: Vec<String>,
    pub new_block_ids: Vec<String>,
    pub new_street_count: usize,
    pub new_block_count: usize,
    pub replay: ReplaySequence,
    pub created_at: DateTime<Utc>,
}

impl UnveilEvent {
    pub fn is_applied(&self) -> bool {
        self.status == EventStatus::Applied
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, EventStatus::Failed(_))
    }
}

/// Entry point tying the pipeline stages to reference data and storage.
pub struct UnveilService<S, K> {
    catalog: RegionCatalog,
    indexes: HashMap<u32, Arc<ReferenceIndex>>,
    ingestor: TrackIngestor,
    snapper: SnapperAdapter<S>,
    kernel: K,
    buffers: BufferGenerator,
    merger: AreaMerger,
    scorer: ScoreCalculator,
    differ: DiffEngine,
    sequencer: ReplaySequencer,
    store: Arc<dyn AreaStore>,
}

impl<S: RoadSnapper, K: GeometryKernel> UnveilService<S, K> {
    /// Build a service. Regions without a street/block index get an empty one.
    pub fn new(
        config: UnveilConfig,
        catalog: RegionCatalog,
        indexes: Vec<Arc<ReferenceIndex>>,
        snapper: S,
        kernel: K,
        store: Arc<dyn AreaStore>,
    ) -> Result<Self> {
        config.validate()?;

        let mut by_region = HashMap::new();
        for index in indexes {
            let region_id = index.region_id();
            if !catalog.contains(region_id) {
                return Err(UnveilError::reference(format!(
                    "street/block index for unknown region {}",
                    region_id
                )));
            }
            if by_region.insert(region_id, index).is_some() {
                return Err(UnveilError::reference(format!(
                    "duplicate street/block index for region {}",
                    region_id
                )));
            }
        }
        for summary in catalog.list() {
            by_region
                .entry(summary.id)
                .or_insert_with(|| Arc::new(ReferenceIndex::empty(summary.id)));
        }

        info!(
            "[UnveilService] Ready with {} regions",
            catalog.len()
        );

        Ok(Self {
            catalog,
            indexes: by_region,
            ingestor: TrackIngestor::new(config.ingest),
            snapper: SnapperAdapter::new(snapper, config.snapper),
            kernel,
            buffers: BufferGenerator::new(config.buffer),
            merger: AreaMerger::new(config.merge),
            scorer: ScoreCalculator,
            differ: DiffEngine::new(config.diff),
            sequencer: ReplaySequencer::new(config.replay),
            store,
        })
    }

    // ========================================================================
    // Regions and owners
    // ========================================================================

    pub fn catalog(&self) -> &RegionCatalog {
        &self.catalog
    }

    pub fn regions(&self) -> Vec<RegionSummary> {
        self.catalog.list()
    }

    pub fn region_detail(&self, region_id: u32) -> Result<RegionDetail> {
        self.catalog.detail(region_id).ok_or_unknown_region(region_id)
    }

    /// Set the user's single active region, creating the user if needed.
    pub fn bind_region(&self, user_id: &str, region_id: u32) -> Result<UserProfile> {
        if !self.catalog.contains(region_id) {
            return Err(UnveilError::UnknownRegion { region_id });
        }

        let mut profile = self
            .store
            .load_user(user_id)?
            .unwrap_or_else(|| UserProfile::new(user_id));
        if profile.region_id != Some(region_id) {
            info!(
                "[UnveilService] User {} active region {:?} -> {}",
                user_id, profile.region_id, region_id
            );
        }
        profile.region_id = Some(region_id);
        self.store.save_user(&profile)?;
        Ok(profile)
    }

    pub fn user(&self, user_id: &str) -> Result<Option<UserProfile>> {
        self.store.load_user(user_id)
    }

    fn active_owner(&self, user_id: &str) -> Result<(OwnerId, Arc<Region>)> {
        let owner = self
            .store
            .load_user(user_id)?
            .and_then(|profile| profile.active_owner())
            .ok_or_region_not_selected(user_id)?;
        let region = self
            .catalog
            .get(owner.region_id)
            .ok_or_unknown_region(owner.region_id)?;
        Ok((owner, region))
    }

    fn index_for(&self, region_id: u32) -> Result<&ReferenceIndex> {
        self.indexes
            .get(&region_id)
            .map(|index| index.as_ref())
            .ok_or_unknown_region(region_id)
    }

    // ========================================================================
    // Imports
    // ========================================================================

    /// Import a recorded route for the user's active region.
    pub async fn import_track(&self, user_id: &str, raw: &[TrackPoint]) -> Result<UnveilEvent> {
        let (owner, region) = self.active_owner(user_id)?;
        let track = self.ingestor.ingest_route(raw)?;
        let matched = self.snapper.snap(&region, &track).await;

        self.apply(owner, &region, &track, &matched.points, Some(&matched))
            .await
    }

    /// Unveil a disc around a single point in the user's active region.
    pub async fn check_in(&self, user_id: &str, point: GpsPoint) -> Result<UnveilEvent> {
        let (owner, region) = self.active_owner(user_id)?;
        let track = self.ingestor.ingest_checkin(&[TrackPoint::from(point)])?;
        self.apply(owner, &region, &track, &track.points, None).await
    }

    async fn apply(
        &self,
        owner: OwnerId,
        region: &Region,
        track: &Track,
        points: &[TrackPoint],
        matched: Option<&MatchedTrack>,
    ) -> Result<UnveilEvent> {
        let projection = region.projection();
        let positions: Vec<GpsPoint> = points.iter().map(TrackPoint::position).collect();
        let buffer = self
            .buffers
            .generate(&self.kernel, track.kind, &positions, projection);
        let replay = self
            .sequencer
            .sequence(&self.kernel, &self.buffers, track.kind, points, projection);
        let index = self.index_for(region.id)?;

        let guard = self.merger.lock(&owner).await?;
        let stored = self.store.load_area(&owner)?;
        let existing = stored
            .clone()
            .unwrap_or_else(|| UnveiledArea::empty(owner.clone()));

        let (status, area, delta_area_m2, diff) =
            match self.merger.merge(&self.kernel, region, &existing, &buffer) {
                Ok(outcome) if outcome.changed => {
                    let diff = self.differ.diff(
                        &self.kernel,
                        index,
                        &outcome.delta,
                        &existing.covered_street_ids,
                        &existing.covered_block_ids,
                    );
                    let mut updated = UnveiledArea {
                        geometry: outcome.geometry,
                        area_m2: outcome.area_m2,
                        updated_at: Utc::now(),
                        ..existing
                    };
                    diff.apply_to(&mut updated);
                    self.store.save_area(&updated)?;
                    (EventStatus::Applied, updated, outcome.delta_area_m2, diff)
                }
                Ok(_) => {
                    if stored.is_none() {
                        self.store.save_area(&existing)?;
                    }
                    (EventStatus::NoChange, existing, 0.0, DiffResult::default())
                }
                Err(err @ UnveilError::GeometryRepair { .. }) => {
                    error!("[UnveilService] {} import for {} aborted: {}", kind_name(track.kind), owner, err);
                    (EventStatus::Failed(err), existing, 0.0, DiffResult::default())
                }
                Err(err) => return Err(err),
            };
        drop(guard);

        let score = self.scorer.score(&self.kernel, region, &area.geometry);
        info!(
            "[UnveilService] {} {} for {}: +{:.1} m², {} streets, {} blocks, {:.2}%",
            kind_name(track.kind),
            status_name(&status),
            owner,
            delta_area_m2,
            diff.street_count(),
            diff.block_count(),
            score.percent_display
        );

        Ok(UnveilEvent {
            owner,
            activity_kind: track.kind,
            status,
            match_quality: matched.map(|m| m.quality),
            fallback_reason: matched.and_then(|m| m.fallback_reason.clone()),
            matched_street_ids: matched
                .map(|m| m.matched_streets().into_iter().map(str::to_string).collect())
                .unwrap_or_default(),
            dropped_points: track.dropped_points,
            delta_area_m2,
            score,
            new_street_count: diff.street_count(),
            new_block_count: diff.block_count(),
            new_street_ids: diff.new_street_ids,
            new_block_ids: diff.new_block_ids,
            replay,
            created_at: Utc::now(),
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Current score for the user's active region, from stored geometry only.
    pub fn score(&self, user_id: &str) -> Result<ScoreReport> {
        let (owner, region) = self.active_owner(user_id)?;
        let area = self.store.load_area(&owner)?;
        let geometry = area.map(|a| a.geometry).unwrap_or_else(|| geo::MultiPolygon::new(vec![]));
        Ok(self.scorer.score(&self.kernel, &region, &geometry))
    }

    /// Stored area for the user's active region (empty if never imported).
    pub fn unveiled_area(&self, user_id: &str) -> Result<UnveiledArea> {
        let (owner, _) = self.active_owner(user_id)?;
        Ok(self
            .store
            .load_area(&owner)?
            .unwrap_or_else(|| UnveiledArea::empty(owner)))
    }

    /// Stored geometry for the user's active region as GeoJSON (lng/lat).
    pub fn unveiled_geojson(&self, user_id: &str) -> Result<serde_json::Value> {
        let (_, region) = self.active_owner(user_id)?;
        Ok(self.unveiled_area(user_id)?.to_geojson(region.projection()))
    }
}

fn kind_name(kind: ActivityKind) -> &'static str {
    match kind {
        ActivityKind::Route => "route",
        ActivityKind::CheckIn => "check-in",
    }
}

fn status_name(status: &EventStatus) -> &'static str {
    match status {
        EventStatus::Applied => "applied",
        EventStatus::NoChange => "no change",
        EventStatus::Failed(_) => "failed",
    }
}
