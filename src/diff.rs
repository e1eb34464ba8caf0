//! # Diff Engine
//!
//! Newly covered streets and blocks for one merge.
//!
//! - A street is new when the part of it inside `delta` is at least
//!   `min_street_coverage` of its length and the owner has not covered it yet
//! - A block is new when `delta` touches it at all and it is not covered yet
//!
//! Only the covered id sets are updated here; geometry belongs to the merger.
//! With the `parallel` feature candidate streets are scored with rayon.

use std::collections::BTreeSet;

use geo::MultiPolygon;
use log::debug;
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::DiffConfig;
use crate::kernel::GeometryKernel;
use crate::merge::UnveiledArea;
use crate::reference::{envelope_of_area, CityBlock, ReferenceIndex, StreetSegment};

/// Ids newly covered by one merge, sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResult {
    pub new_street_ids: Vec<String>,
    pub new_block_ids: Vec<String>,
}

impl DiffResult {
    pub fn street_count(&self) -> usize {
        self.new_street_ids.len()
    }

    pub fn block_count(&self) -> usize {
        self.new_block_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.new_street_ids.is_empty() && self.new_block_ids.is_empty()
    }

    /// Fold the new ids into the owner's cumulative sets.
    pub fn apply_to(&self, area: &mut UnveiledArea) {
        area.covered_street_ids.extend(self.new_street_ids.iter().cloned());
        area.covered_block_ids.extend(self.new_block_ids.iter().cloned());
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiffEngine {
    config: DiffConfig,
}

impl DiffEngine {
    pub fn new(config: DiffConfig) -> Self {
        Self { config }
    }

    /// Streets and blocks first covered by `delta` (metric, region projection).
    pub fn diff<K: GeometryKernel + ?Sized>(
        &self,
        kernel: &K,
        index: &ReferenceIndex,
        delta: &MultiPolygon<f64>,
        covered_streets: &BTreeSet<String>,
        covered_blocks: &BTreeSet<String>,
    ) -> DiffResult {
        let Some(envelope) = envelope_of_area(delta) else {
            return DiffResult::default();
        };

        let streets: Vec<&StreetSegment> = index
            .streets_in(&envelope)
            .into_iter()
            .filter(|s| !covered_streets.contains(&s.id))
            .collect();
        let blocks: Vec<&CityBlock> = index
            .blocks_in(&envelope)
            .into_iter()
            .filter(|b| !covered_blocks.contains(&b.id))
            .collect();

        let new_streets = self.covered_streets(kernel, delta, &streets);
        let new_blocks: BTreeSet<String> = blocks
            .iter()
            .filter(|b| b.geometry.0.iter().any(|part| kernel.intersects(delta, part)))
            .map(|b| b.id.clone())
            .collect();

        debug!(
            "[DiffEngine] {} candidate streets -> {} new, {} candidate blocks -> {} new",
            streets.len(),
            new_streets.len(),
            blocks.len(),
            new_blocks.len()
        );

        DiffResult {
            new_street_ids: new_streets.into_iter().collect(),
            new_block_ids: new_blocks.into_iter().collect(),
        }
    }

    fn is_covered<K: GeometryKernel + ?Sized>(
        &self,
        kernel: &K,
        delta: &MultiPolygon<f64>,
        street: &StreetSegment,
    ) -> bool {
        if street.length_m <= 0.0 {
            return false;
        }
        let inside: f64 = street
            .geometry
            .0
            .iter()
            .map(|line| kernel.covered_length(delta, line))
            .sum();
        inside > 0.0 && inside / street.length_m >= self.config.min_street_coverage
    }

    #[cfg(not(feature = "parallel"))]
    fn covered_streets<K: GeometryKernel + ?Sized>(
        &self,
        kernel: &K,
        delta: &MultiPolygon<f64>,
        streets: &[&StreetSegment],
    ) -> BTreeSet<String> {
        streets
            .iter()
            .filter(|s| self.is_covered(kernel, delta, s))
            .map(|s| s.id.clone())
            .collect()
    }

    #[cfg(feature = "parallel")]
    fn covered_streets<K: GeometryKernel + ?Sized>(
        &self,
        kernel: &K,
        delta: &MultiPolygon<f64>,
        streets: &[&StreetSegment],
    ) -> BTreeSet<String> {
        streets
            .par_iter()
            .filter(|s| self.is_covered(kernel, delta, s))
            .map(|s| s.id.clone())
            .collect::<Vec<_>>()
            .into_iter()
            .collect()
    }
}
