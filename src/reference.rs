//! # Reference Data
//!
//! Immutable per-process data: regions (administrative boundaries) and the
//! per-region street/block index used for "newly discovered" counts.
//!
//! Geometries are projected into the region's [`LocalProjection`] once at
//! load time; everything downstream works in meters.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use geo::{Area, BoundingRect, Coord, MultiLineString, MultiPolygon, Rect};
use log::{info, warn};
use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

use crate::error::{Result, UnveilError};
use crate::geojson::{multi_polygon_to_geojson, parse_feature_collection};
use crate::kernel::{distance, LocalProjection};
use crate::{Bounds, GpsPoint};

// ============================================================================
// Regions
// ============================================================================

/// A fixed administrative region against which exploration is measured.
#[derive(Debug, Clone)]
pub struct Region {
    pub id: u32,
    pub name: String,
    /// Boundary in lng/lat
    boundary: MultiPolygon<f64>,
    bounds: Bounds,
    projection: LocalProjection,
    /// Boundary in the region's metric projection
    projected_boundary: MultiPolygon<f64>,
    total_area_m2: f64,
}

impl Region {
    /// Build a region from a geographic boundary (`x = lng`, `y = lat`).
    ///
    /// `total_area_m2` is computed from the projected boundary when not given.
    pub fn new(
        id: u32,
        name: impl Into<String>,
        boundary: MultiPolygon<f64>,
        total_area_m2: Option<f64>,
    ) -> Result<Self> {
        let name = name.into();
        let rect = boundary
            .bounding_rect()
            .ok_or_else(|| UnveilError::reference(format!("region '{}' has an empty boundary", name)))?;
        let bounds = rect_to_bounds(&rect);
        let projection = LocalProjection::for_bounds(&bounds);
        let projected_boundary = projection.project_multi_polygon(&boundary);

        let total_area_m2 = total_area_m2.unwrap_or_else(|| projected_boundary.unsigned_area());
        if !(total_area_m2.is_finite() && total_area_m2 > 0.0) {
            return Err(UnveilError::reference(format!(
                "region '{}' has non-positive total area {}",
                name, total_area_m2
            )));
        }

        Ok(Self {
            id,
            name,
            boundary,
            bounds,
            projection,
            projected_boundary,
            total_area_m2,
        })
    }

    pub fn boundary(&self) -> &MultiPolygon<f64> {
        &self.boundary
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn projection(&self) -> &LocalProjection {
        &self.projection
    }

    pub fn projected_boundary(&self) -> &MultiPolygon<f64> {
        &self.projected_boundary
    }

    pub fn total_area_m2(&self) -> f64 {
        self.total_area_m2
    }

    pub fn summary(&self) -> RegionSummary {
        RegionSummary {
            id: self.id,
            name: self.name.clone(),
        }
    }

    /// Full record including the boundary as GeoJSON.
    pub fn detail(&self) -> RegionDetail {
        RegionDetail {
            id: self.id,
            name: self.name.clone(),
            total_area_m2: self.total_area_m2,
            geometry: multi_polygon_to_geojson(&self.boundary),
        }
    }
}

fn rect_to_bounds(rect: &Rect<f64>) -> Bounds {
    Bounds {
        min_lat: rect.min().y,
        max_lat: rect.max().y,
        min_lng: rect.min().x,
        max_lng: rect.max().x,
    }
}

/// Lightweight region listing entry (no geometry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionSummary {
    pub id: u32,
    pub name: String,
}

/// Region record with geometry, for map display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionDetail {
    pub id: u32,
    pub name: String,
    pub total_area_m2: f64,
    pub geometry: serde_json::Value,
}

/// All regions known to the process, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct RegionCatalog {
    regions: BTreeMap<u32, Arc<Region>>,
}

impl RegionCatalog {
    pub fn new(regions: Vec<Region>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for region in regions {
            let id = region.id;
            if map.insert(id, Arc::new(region)).is_some() {
                return Err(UnveilError::reference(format!("duplicate region id {}", id)));
            }
        }
        Ok(Self { regions: map })
    }

    /// Load regions from a GeoJSON FeatureCollection of (multi)polygons.
    ///
    /// Names come from `boro_name`, `boroname` or `name`; features without a
    /// name or polygonal geometry are skipped. Ids come from `region_id`/`id`
    /// or the 1-based feature position.
    pub fn from_geojson(json: &str) -> Result<Self> {
        let collection = parse_feature_collection(json)?;
        if collection.features.is_empty() {
            return Err(UnveilError::reference("no features found in region GeoJSON"));
        }

        let mut regions = Vec::new();
        for (i, feature) in collection.features.iter().enumerate() {
            let Some(name) = feature.string_property(&["boro_name", "boroname", "name"]) else {
                warn!("[Reference] Skipping region feature {} without a name", i);
                continue;
            };
            let Some(boundary) = feature.geometry.as_ref().and_then(|g| g.to_multi_polygon()) else {
                warn!("[Reference] Skipping region '{}' without polygon geometry", name);
                continue;
            };

            let id = match feature.number_property(&["region_id", "id"]) {
                Some(n) if n >= 0.0 && n.fract() == 0.0 && n <= u32::MAX as f64 => n as u32,
                _ => (i + 1) as u32,
            };
            let total_area = feature.number_property(&["total_area"]);
            regions.push(Region::new(id, name, boundary?, total_area)?);
        }

        info!("[Reference] Loaded {} regions", regions.len());
        Self::new(regions)
    }

    pub fn get(&self, id: u32) -> Option<Arc<Region>> {
        self.regions.get(&id).cloned()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.regions.contains_key(&id)
    }

    pub fn list(&self) -> Vec<RegionSummary> {
        self.regions.values().map(|r| r.summary()).collect()
    }

    pub fn detail(&self, id: u32) -> Option<RegionDetail> {
        self.regions.get(&id).map(|r| r.detail())
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

// ============================================================================
// Streets and blocks
// ============================================================================

/// A road-network segment, projected into its region's metric space.
#[derive(Debug, Clone)]
pub struct StreetSegment {
    pub id: String,
    pub name: Option<String>,
    pub geometry: MultiLineString<f64>,
    pub length_m: f64,
}

impl StreetSegment {
    pub fn new(id: impl Into<String>, name: Option<String>, geometry: MultiLineString<f64>) -> Self {
        let length_m = geometry
            .0
            .iter()
            .flat_map(|l| l.0.windows(2).map(|w| distance(w[0], w[1])))
            .sum();
        Self {
            id: id.into(),
            name,
            geometry,
            length_m,
        }
    }

    /// Build from a geographic polyline.
    pub fn from_points(
        id: impl Into<String>,
        name: Option<String>,
        points: &[GpsPoint],
        projection: &LocalProjection,
    ) -> Self {
        let line = projection.project_points(points);
        Self::new(id, name, MultiLineString::new(vec![line]))
    }

    /// Distance from `point` to the nearest point on this segment, with that
    /// nearest point.
    pub fn closest_point(&self, point: Coord<f64>) -> Option<(f64, Coord<f64>)> {
        self.geometry
            .0
            .iter()
            .flat_map(|l| l.0.windows(2))
            .map(|w| {
                let c = closest_on_segment(w[0], w[1], point);
                (distance(c, point), c)
            })
            .min_by(|a, b| a.0.total_cmp(&b.0))
    }
}

fn closest_on_segment(a: Coord<f64>, b: Coord<f64>, p: Coord<f64>) -> Coord<f64> {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let len_sq = dx * dx + dy * dy;
    if len_sq == 0.0 {
        return a;
    }
    let t = (((p.x - a.x) * dx + (p.y - a.y) * dy) / len_sq).clamp(0.0, 1.0);
    Coord {
        x: a.x + t * dx,
        y: a.y + t * dy,
    }
}

/// A city block polygon, projected into its region's metric space.
#[derive(Debug, Clone)]
pub struct CityBlock {
    pub id: String,
    pub geometry: MultiPolygon<f64>,
}

impl CityBlock {
    pub fn new(id: impl Into<String>, geometry: MultiPolygon<f64>) -> Self {
        Self {
            id: id.into(),
            geometry,
        }
    }

    /// Build from a geographic polygon ring.
    pub fn from_ring(id: impl Into<String>, ring: &[GpsPoint], projection: &LocalProjection) -> Self {
        let exterior = projection.project_points(ring);
        Self::new(id, MultiPolygon::new(vec![geo::Polygon::new(exterior, vec![])]))
    }
}

/// Envelope entry pointing back into the street or block list.
#[derive(Debug, Clone)]
struct IndexedEnvelope {
    idx: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for IndexedEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

fn envelope_of(rect: Option<Rect<f64>>) -> Option<AABB<[f64; 2]>> {
    rect.map(|r| AABB::from_corners([r.min().x, r.min().y], [r.max().x, r.max().y]))
}

/// Spatial index of a region's streets and blocks.
#[derive(Debug)]
pub struct ReferenceIndex {
    region_id: u32,
    streets: Vec<StreetSegment>,
    blocks: Vec<CityBlock>,
    street_tree: RTree<IndexedEnvelope>,
    block_tree: RTree<IndexedEnvelope>,
}

impl ReferenceIndex {
    /// Index already-projected streets and blocks. Ids must be unique per kind.
    pub fn new(region_id: u32, streets: Vec<StreetSegment>, blocks: Vec<CityBlock>) -> Result<Self> {
        check_unique(streets.iter().map(|s| s.id.as_str()), "street")?;
        check_unique(blocks.iter().map(|b| b.id.as_str()), "block")?;

        let street_tree = RTree::bulk_load(
            streets
                .iter()
                .enumerate()
                .filter_map(|(idx, s)| {
                    envelope_of(s.geometry.bounding_rect()).map(|envelope| IndexedEnvelope { idx, envelope })
                })
                .collect(),
        );
        let block_tree = RTree::bulk_load(
            blocks
                .iter()
                .enumerate()
                .filter_map(|(idx, b)| {
                    envelope_of(b.geometry.bounding_rect()).map(|envelope| IndexedEnvelope { idx, envelope })
                })
                .collect(),
        );

        Ok(Self {
            region_id,
            streets,
            blocks,
            street_tree,
            block_tree,
        })
    }

    pub fn empty(region_id: u32) -> Self {
        Self {
            region_id,
            streets: Vec::new(),
            blocks: Vec::new(),
            street_tree: RTree::new(),
            block_tree: RTree::new(),
        }
    }

    /// Load streets (line features) and blocks (polygon features) for `region`.
    pub fn from_geojson(region: &Region, streets_json: &str, blocks_json: &str) -> Result<Self> {
        let projection = region.projection();

        let mut streets = Vec::new();
        for (i, feature) in parse_feature_collection(streets_json)?.features.iter().enumerate() {
            let Some(lines) = feature.geometry.as_ref().and_then(|g| g.to_multi_line_string()) else {
                warn!("[Reference] Skipping street feature {} without line geometry", i);
                continue;
            };
            let geometry = MultiLineString::new(lines?.0.iter().map(|l| projection.project_line(l)).collect());
            let id = feature.identifier().unwrap_or_else(|| format!("street-{}", i + 1));
            let name = feature.string_property(&["name", "street_name"]);
            streets.push(StreetSegment::new(id, name, geometry));
        }

        let mut blocks = Vec::new();
        for (i, feature) in parse_feature_collection(blocks_json)?.features.iter().enumerate() {
            let Some(polygons) = feature.geometry.as_ref().and_then(|g| g.to_multi_polygon()) else {
                warn!("[Reference] Skipping block feature {} without polygon geometry", i);
                continue;
            };
            let id = feature.identifier().unwrap_or_else(|| format!("block-{}", i + 1));
            blocks.push(CityBlock::new(id, projection.project_multi_polygon(&polygons?)));
        }

        info!(
            "[Reference] Region {}: indexed {} streets, {} blocks",
            region.id,
            streets.len(),
            blocks.len()
        );
        Self::new(region.id, streets, blocks)
    }

    pub fn region_id(&self) -> u32 {
        self.region_id
    }

    pub fn streets(&self) -> &[StreetSegment] {
        &self.streets
    }

    pub fn blocks(&self) -> &[CityBlock] {
        &self.blocks
    }

    /// Streets whose envelope intersects `envelope`.
    pub fn streets_in(&self, envelope: &AABB<[f64; 2]>) -> Vec<&StreetSegment> {
        self.street_tree
            .locate_in_envelope_intersecting(envelope)
            .map(|e| &self.streets[e.idx])
            .collect()
    }

    /// Blocks whose envelope intersects `envelope`.
    pub fn blocks_in(&self, envelope: &AABB<[f64; 2]>) -> Vec<&CityBlock> {
        self.block_tree
            .locate_in_envelope_intersecting(envelope)
            .map(|e| &self.blocks[e.idx])
            .collect()
    }

    /// Closest street to `point` within `max_distance` meters.
    pub fn nearest_street(&self, point: Coord<f64>, max_distance: f64) -> Option<(&StreetSegment, Coord<f64>)> {
        let search = AABB::from_corners(
            [point.x - max_distance, point.y - max_distance],
            [point.x + max_distance, point.y + max_distance],
        );
        self.streets_in(&search)
            .into_iter()
            .filter_map(|s| s.closest_point(point).map(|(d, c)| (s, d, c)))
            .filter(|(_, d, _)| *d <= max_distance)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(s, _, c)| (s, c))
    }
}

fn check_unique<'a>(ids: impl Iterator<Item = &'a str>, kind: &str) -> Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(UnveilError::reference(format!("duplicate {} id '{}'", kind, id)));
        }
    }
    Ok(())
}

/// Envelope of a metric multi-polygon, for index queries.
pub(crate) fn envelope_of_area(geometry: &MultiPolygon<f64>) -> Option<AABB<[f64; 2]>> {
    envelope_of(geometry.bounding_rect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    const REGIONS: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            { "type": "Feature", "properties": { "boro_name": "Brooklyn", "boro_code": "3" },
              "geometry": { "type": "Polygon", "coordinates": [[[-74.0, 40.6], [-73.9, 40.6], [-73.9, 40.7], [-74.0, 40.7], [-74.0, 40.6]]] } },
            { "type": "Feature", "properties": { "name": "Tiny", "region_id": 9, "total_area": 500.0 },
              "geometry": { "type": "MultiPolygon", "coordinates": [[[[0, 0], [0.001, 0], [0.001, 0.001], [0, 0]]]] } },
            { "type": "Feature", "properties": { "note": "no name" },
              "geometry": { "type": "Polygon", "coordinates": [[[0, 0], [1, 0], [1, 1], [0, 0]]] } }
        ]
    }"#;

    #[test]
    fn test_catalog_from_geojson() {
        let catalog = RegionCatalog::from_geojson(REGIONS).unwrap();
        assert_eq!(catalog.len(), 2);

        let brooklyn = catalog.get(1).unwrap();
        assert_eq!(brooklyn.name, "Brooklyn");
        // ~8.43km x ~11.12km
        let expected = 0.1 * 111_195.0 * 0.1 * 111_195.0 * 40.65_f64.to_radians().cos();
        assert!((brooklyn.total_area_m2() - expected).abs() / expected < 0.01);

        let tiny = catalog.get(9).unwrap();
        assert_eq!(tiny.total_area_m2(), 500.0);

        let names: Vec<String> = catalog.list().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["Brooklyn".to_string(), "Tiny".to_string()]);

        let detail = catalog.detail(1).unwrap();
        assert_eq!(detail.geometry["type"], "MultiPolygon");
        assert!(catalog.detail(2).is_none());
    }

    #[test]
    fn test_empty_collection_rejected() {
        let result = RegionCatalog::from_geojson(r#"{ "type": "FeatureCollection", "features": [] }"#);
        assert!(matches!(result, Err(UnveilError::ReferenceData { .. })));
    }

    #[test]
    fn test_reference_index_queries() {
        let region = Region::new(
            1,
            "Test",
            MultiPolygon::new(vec![polygon![
                (x: -74.0, y: 40.6),
                (x: -73.9, y: 40.6),
                (x: -73.9, y: 40.7),
                (x: -74.0, y: 40.7),
            ]]),
            None,
        )
        .unwrap();
        let proj = region.projection();

        let street = StreetSegment::from_points(
            "s1",
            Some("Bedford Ave".to_string()),
            &[GpsPoint::new(40.65, -73.96), GpsPoint::new(40.66, -73.96)],
            proj,
        );
        let block = CityBlock::from_ring(
            "b1",
            &[
                GpsPoint::new(40.650, -73.950),
                GpsPoint::new(40.650, -73.949),
                GpsPoint::new(40.651, -73.949),
                GpsPoint::new(40.651, -73.950),
            ],
            proj,
        );
        assert!((street.length_m - 1112.0).abs() < 5.0);

        let index = ReferenceIndex::new(1, vec![street], vec![block]).unwrap();
        let near = proj.project(&GpsPoint::new(40.655, -73.9602));
        let (found, snapped) = index.nearest_street(near, 30.0).unwrap();
        assert_eq!(found.id, "s1");
        assert!(distance(snapped, near) < 20.0);

        let far = proj.project(&GpsPoint::new(40.655, -73.97));
        assert!(index.nearest_street(far, 30.0).is_none());

        let block_center = proj.project(&GpsPoint::new(40.6505, -73.9495));
        let probe = AABB::from_point([block_center.x, block_center.y]);
        assert_eq!(index.blocks_in(&probe).len(), 1);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let proj = LocalProjection::new(GpsPoint::new(40.65, -73.95));
        let a = StreetSegment::from_points("dup", None, &[GpsPoint::new(40.65, -73.95), GpsPoint::new(40.66, -73.95)], &proj);
        let b = a.clone();
        assert!(ReferenceIndex::new(1, vec![a, b], vec![]).is_err());
    }

    #[test]
    fn test_index_from_geojson() {
        let catalog = RegionCatalog::from_geojson(REGIONS).unwrap();
        let region = catalog.get(1).unwrap();
        let streets = r#"{ "type": "FeatureCollection", "features": [
            { "type": "Feature", "id": "st-1", "properties": { "name": "Kent Ave" },
              "geometry": { "type": "LineString", "coordinates": [[-73.96, 40.65], [-73.96, 40.66]] } },
            { "type": "Feature", "properties": {},
              "geometry": { "type": "MultiLineString", "coordinates": [[[-73.95, 40.65], [-73.95, 40.66]], [[-73.94, 40.65], [-73.94, 40.66]]] } }
        ] }"#;
        let blocks = r#"{ "type": "FeatureCollection", "features": [
            { "type": "Feature", "properties": { "id": "blk-1" },
              "geometry": { "type": "Polygon", "coordinates": [[[-73.95, 40.65], [-73.949, 40.65], [-73.949, 40.651], [-73.95, 40.65]]] } }
        ] }"#;
        let index = ReferenceIndex::from_geojson(&region, streets, blocks).unwrap();
        assert_eq!(index.streets().len(), 2);
        assert_eq!(index.streets()[0].id, "st-1");
        assert_eq!(index.streets()[0].name.as_deref(), Some("Kent Ave"));
        assert_eq!(index.streets()[1].id, "street-2");
        assert_eq!(index.blocks()[0].id, "blk-1");
    }
}
