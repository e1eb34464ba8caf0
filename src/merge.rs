//! # Area Merger
//!
//! Folds a new buffer into an owner's unveiled area.
//!
//! ## Algorithm
//! 1. `repair(union(existing, repair(buffer)))`
//! 2. Clip to the region boundary
//! 3. Replace only if the clipped area grows by more than `area_epsilon_m2`
//! 4. `delta = new - existing` feeds the diff engine
//!
//! Merging is pure; the caller commits the outcome while holding the owner's
//! lock from [`OwnerLocks`], so merges for one owner never interleave.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use geo::MultiPolygon;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

use crate::config::MergeConfig;
use crate::error::{Result, UnveilError};
use crate::geojson::multi_polygon_to_geojson;
use crate::kernel::{GeometryKernel, LocalProjection};
use crate::reference::Region;
use crate::OwnerId;

/// Cumulative explored geometry for one owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnveiledArea {
    pub owner: OwnerId,
    /// In the region's metric projection, always inside the region boundary
    pub geometry: MultiPolygon<f64>,
    pub covered_street_ids: BTreeSet<String>,
    pub covered_block_ids: BTreeSet<String>,
    pub area_m2: f64,
    pub updated_at: DateTime<Utc>,
}

impl UnveiledArea {
    /// Fresh area with no geometry.
    pub fn empty(owner: OwnerId) -> Self {
        Self {
            owner,
            geometry: MultiPolygon::new(vec![]),
            covered_street_ids: BTreeSet::new(),
            covered_block_ids: BTreeSet::new(),
            area_m2: 0.0,
            updated_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.geometry.0.is_empty()
    }

    /// Geometry in lng/lat for display.
    pub fn geographic_geometry(&self, projection: &LocalProjection) -> MultiPolygon<f64> {
        projection.unproject_multi_polygon(&self.geometry)
    }

    pub fn to_geojson(&self, projection: &LocalProjection) -> serde_json::Value {
        multi_polygon_to_geojson(&self.geographic_geometry(projection))
    }
}

/// Result of merging one buffer.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// Geometry to store; the existing geometry when `changed` is false
    pub geometry: MultiPolygon<f64>,
    pub area_m2: f64,
    /// Newly unveiled part, empty when unchanged
    pub delta: MultiPolygon<f64>,
    pub delta_area_m2: f64,
    pub changed: bool,
}

/// Per-owner exclusive sections.
///
/// Waiters are served in arrival order, so merges apply in submission order.
/// An owner's entry lives only while some task holds or waits for its lock.
#[derive(Debug, Default)]
pub struct OwnerLocks {
    locks: Mutex<HashMap<OwnerId, Arc<tokio::sync::Mutex<()>>>>,
}

/// Exclusive access to one owner, released on drop.
#[derive(Debug)]
#[must_use = "the owner lock is released as soon as the guard is dropped"]
pub struct OwnerGuard<'a> {
    locks: &'a OwnerLocks,
    owner: OwnerId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        // Unlock before pruning so the entry's only remaining handle is the map's
        self.guard.take();
        self.locks.prune(&self.owner);
    }
}

impl OwnerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `timeout` for exclusive access to `owner`.
    pub async fn acquire(&self, owner: &OwnerId, timeout: Duration) -> Result<OwnerGuard<'_>> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(owner.clone()).or_default())
        };

        let started = Instant::now();
        let acquired = tokio::time::timeout(timeout, lock.lock_owned()).await;
        match acquired {
            Ok(guard) => Ok(OwnerGuard {
                locks: self,
                owner: owner.clone(),
                guard: Some(guard),
            }),
            Err(_) => {
                self.prune(owner);
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!("[AreaMerger] Lock for {} not acquired after {}ms", owner, waited_ms);
                Err(UnveilError::ConcurrencyTimeout {
                    owner: owner.clone(),
                    waited_ms,
                })
            }
        }
    }

    /// Owners with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop `owner`'s entry once nobody holds or waits for it. New handles
    /// are only cloned under the map mutex, so the count cannot race.
    fn prune(&self, owner: &OwnerId) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(owner).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(owner);
            debug!("[AreaMerger] Released lock entry for {}", owner);
        }
    }
}

#[derive(Debug, Default)]
pub struct AreaMerger {
    config: MergeConfig,
    locks: OwnerLocks,
}

impl AreaMerger {
    pub fn new(config: MergeConfig) -> Self {
        Self {
            config,
            locks: OwnerLocks::new(),
        }
    }

    /// Exclusive section for `owner`, bounded by `lock_timeout_ms`.
    pub async fn lock(&self, owner: &OwnerId) -> Result<OwnerGuard<'_>> {
        self.locks.acquire(owner, self.config.lock_timeout()).await
    }

    /// Merge `buffer` (metric, region projection) into `existing`.
    ///
    /// Fails with [`UnveilError::GeometryRepair`] without side effects.
    pub fn merge<K: GeometryKernel + ?Sized>(
        &self,
        kernel: &K,
        region: &Region,
        existing: &UnveiledArea,
        buffer: &MultiPolygon<f64>,
    ) -> Result<MergeOutcome> {
        let buffer = kernel.repair(buffer)?;
        let merged = kernel.repair(&kernel.union(&existing.geometry, &buffer))?;
        let clipped = kernel.repair(&kernel.intersection(&merged, region.projected_boundary()))?;
        let area_m2 = kernel.area(&clipped);

        if area_m2 <= existing.area_m2 + self.config.area_epsilon_m2 {
            debug!(
                "[AreaMerger] {}: no gain ({:.3} -> {:.3} m²)",
                existing.owner, existing.area_m2, area_m2
            );
            return Ok(MergeOutcome {
                geometry: existing.geometry.clone(),
                area_m2: existing.area_m2,
                delta: MultiPolygon::new(vec![]),
                delta_area_m2: 0.0,
                changed: false,
            });
        }

        let delta = kernel.difference(&clipped, &existing.geometry);
        let delta_area_m2 = area_m2 - existing.area_m2;
        debug!(
            "[AreaMerger] {}: {:.1} -> {:.1} m² (+{:.1})",
            existing.owner, existing.area_m2, area_m2, delta_area_m2
        );

        Ok(MergeOutcome {
            geometry: clipped,
            area_m2,
            delta,
            delta_area_m2,
            changed: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::PlanarKernel;
    use crate::GpsPoint;
    use geo::{polygon, Coord};

    fn region() -> Region {
        // ~1.7km x 2.2km box
        Region::new(
            1,
            "Box",
            MultiPolygon::new(vec![polygon![
                (x: -73.96, y: 40.64),
                (x: -73.94, y: 40.64),
                (x: -73.94, y: 40.66),
                (x: -73.96, y: 40.66),
            ]]),
            None,
        )
        .unwrap()
    }

    fn owner() -> OwnerId {
        OwnerId::new("u-1", 1)
    }

    #[test]
    fn test_first_merge_and_idempotence() {
        let kernel = PlanarKernel::default();
        let merger = AreaMerger::default();
        let region = region();
        let disc = kernel.buffer_point(Coord { x: 0.0, y: 0.0 }, 100.0);

        let empty = UnveiledArea::empty(owner());
        let first = merger.merge(&kernel, &region, &empty, &disc).unwrap();
        assert!(first.changed);
        assert!((first.delta_area_m2 - kernel.area(&disc)).abs() < 1.0);
        assert!((kernel.area(&first.delta) - first.delta_area_m2).abs() < 1.0);

        let stored = UnveiledArea {
            geometry: first.geometry,
            area_m2: first.area_m2,
            ..empty
        };
        let second = merger.merge(&kernel, &region, &stored, &disc).unwrap();
        assert!(!second.changed);
        assert_eq!(second.delta_area_m2, 0.0);
        assert!(second.delta.0.is_empty());
        assert_eq!(second.area_m2, stored.area_m2);
    }

    #[test]
    fn test_clipped_to_region() {
        let kernel = PlanarKernel::default();
        let region = region();
        // Disc centred on the western edge: roughly half falls outside
        let edge = region.projection().project(&GpsPoint::new(40.65, -73.96));
        let disc = kernel.buffer_point(edge, 100.0);

        let outcome = AreaMerger::default()
            .merge(&kernel, &region, &UnveiledArea::empty(owner()), &disc)
            .unwrap();
        let half = kernel.area(&disc) / 2.0;
        assert!((outcome.area_m2 - half).abs() / half < 0.02);

        let outside = kernel.difference(&outcome.geometry, region.projected_boundary());
        assert!(kernel.area(&outside) < 1e-6);
    }

    #[test]
    fn test_buffer_outside_region_is_no_change() {
        let kernel = PlanarKernel::default();
        let far = kernel.buffer_point(Coord { x: 50_000.0, y: 0.0 }, 100.0);
        let outcome = AreaMerger::default()
            .merge(&kernel, &region(), &UnveiledArea::empty(owner()), &far)
            .unwrap();
        assert!(!outcome.changed);
        assert_eq!(outcome.area_m2, 0.0);
    }

    #[test]
    fn test_overlapping_merge_grows_by_difference() {
        let kernel = PlanarKernel::default();
        let merger = AreaMerger::default();
        let region = region();
        let a = kernel.buffer_point(Coord { x: 0.0, y: 0.0 }, 100.0);
        let b = kernel.buffer_point(Coord { x: 100.0, y: 0.0 }, 100.0);

        let first = merger.merge(&kernel, &region, &UnveiledArea::empty(owner()), &a).unwrap();
        let stored = UnveiledArea {
            geometry: first.geometry,
            area_m2: first.area_m2,
            ..UnveiledArea::empty(owner())
        };
        let second = merger.merge(&kernel, &region, &stored, &b).unwrap();
        assert!(second.changed);
        assert!(second.area_m2 < kernel.area(&a) + kernel.area(&b));
        assert!((second.delta_area_m2 - (kernel.area(&b) - kernel.intersection_area(&a, &b))).abs() < 5.0);
    }

    #[tokio::test]
    async fn test_owner_lock_timeout() {
        let locks = OwnerLocks::new();
        let guard = locks.acquire(&owner(), Duration::from_millis(50)).await.unwrap();

        let err = locks.acquire(&owner(), Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, UnveilError::ConcurrencyTimeout { .. }));
        assert!(err.is_retryable());

        // Other owners are independent
        assert!(locks.acquire(&OwnerId::new("u-2", 1), Duration::from_millis(20)).await.is_ok());

        drop(guard);
        assert!(locks.acquire(&owner(), Duration::from_millis(20)).await.is_ok());
    }

    #[tokio::test]
    async fn test_owner_locks_released_after_use() {
        let locks = OwnerLocks::new();
        for i in 0..100 {
            let guard = locks
                .acquire(&OwnerId::new(format!("u-{}", i), 1), Duration::from_millis(20))
                .await
                .unwrap();
            assert_eq!(locks.len(), 1);
            drop(guard);
        }
        assert!(locks.is_empty());

        // A timed-out waiter leaves only the holder's entry behind
        let held = locks.acquire(&owner(), Duration::from_millis(20)).await.unwrap();
        assert!(locks.acquire(&owner(), Duration::from_millis(10)).await.is_err());
        assert_eq!(locks.len(), 1);
        drop(held);
        assert!(locks.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_waiter_keeps_entry_alive() {
        let locks = Arc::new(OwnerLocks::new());
        let held = locks.acquire(&owner(), Duration::from_millis(20)).await.unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.acquire(&owner(), Duration::from_secs(5)).await.unwrap();
                locks.len()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Releasing must not drop the entry the waiter is queued on
        drop(held);
        assert_eq!(waiter.await.unwrap(), 1);
        assert!(locks.is_empty());
    }
}
