//! Shared fixtures: a 10km x 10km region with a 100m street grid.
#![allow(dead_code)]

use std::sync::Arc;

use fog_engine::{
    AreaStore, CityBlock, GeometryKernel, GpsPoint, LocalProjection, MemoryAreaStore, OfflineSnapper,
    ReferenceIndex, Region, RegionCatalog, RoadSnapper, StreetSegment, TrackPoint, UnveilConfig,
    UnveilService,
};
use geo::{Coord, LineString, MultiLineString, MultiPolygon, Polygon};

pub const REGION_ID: u32 = 1;
pub const HALF_SIDE_M: f64 = 5_000.0;
/// Streets and blocks cover the central 1km x 1km
pub const GRID_CELLS: i32 = 5;
pub const CELL_M: f64 = 100.0;

pub fn center() -> GpsPoint {
    GpsPoint::new(40.65, -73.95)
}

pub fn projection() -> LocalProjection {
    LocalProjection::new(center())
}

/// Geographic position of a metric offset from the region centre.
pub fn at(x: f64, y: f64) -> GpsPoint {
    projection().unproject(Coord { x, y })
}

/// Region of exactly 100,000,000 m².
pub fn region() -> Region {
    let corners = [
        (-HALF_SIDE_M, -HALF_SIDE_M),
        (HALF_SIDE_M, -HALF_SIDE_M),
        (HALF_SIDE_M, HALF_SIDE_M),
        (-HALF_SIDE_M, HALF_SIDE_M),
    ];
    let ring: Vec<Coord<f64>> = corners
        .iter()
        .map(|(x, y)| {
            let p = at(*x, *y);
            Coord {
                x: p.longitude,
                y: p.latitude,
            }
        })
        .collect();
    Region::new(
        REGION_ID,
        "Test Borough",
        MultiPolygon::new(vec![Polygon::new(LineString::new(ring), vec![])]),
        Some(100_000_000.0),
    )
    .expect("valid region")
}

fn segment(id: String, from: (f64, f64), to: (f64, f64)) -> StreetSegment {
    StreetSegment::new(id, None, MultiLineString::new(vec![LineString::from(vec![from, to])]))
}

/// 100m street segments on grid lines and 80m blocks inside each cell.
///
/// Vertical segment `v{i}_{k}` runs along `x = i * 100` from `y = k * 100` to
/// `y = (k + 1) * 100`; horizontal `h{j}_{k}` runs along `y = j * 100` from
/// `x = k * 100`. Block `b{i}_{j}` spans `x in [i*100+10, i*100+90]`, same
/// for `y`.
pub fn index(region: &Region) -> ReferenceIndex {
    let mut streets = Vec::new();
    let mut blocks = Vec::new();
    for i in -GRID_CELLS..=GRID_CELLS {
        for k in -GRID_CELLS..GRID_CELLS {
            let (line, start, end) = (i as f64 * CELL_M, k as f64 * CELL_M, (k + 1) as f64 * CELL_M);
            streets.push(segment(format!("v{}_{}", i, k), (line, start), (line, end)));
            streets.push(segment(format!("h{}_{}", i, k), (start, line), (end, line)));
        }
    }
    for i in -GRID_CELLS..GRID_CELLS {
        for j in -GRID_CELLS..GRID_CELLS {
            let (x0, y0) = (i as f64 * CELL_M + 10.0, j as f64 * CELL_M + 10.0);
            let square = Polygon::new(
                LineString::from(vec![(x0, y0), (x0 + 80.0, y0), (x0 + 80.0, y0 + 80.0), (x0, y0 + 80.0)]),
                vec![],
            );
            blocks.push(CityBlock::new(format!("b{}_{}", i, j), MultiPolygon::new(vec![square])));
        }
    }
    ReferenceIndex::new(region.id, streets, blocks).expect("unique ids")
}

/// Straight route from metric `(x0, y0)` to `(x1, y1)` with a point every
/// `step` meters, 10s apart.
pub fn route(x0: f64, y0: f64, x1: f64, y1: f64, step: f64) -> Vec<TrackPoint> {
    let length = (x1 - x0).hypot(y1 - y0);
    let n = (length / step).ceil().max(1.0) as usize;
    (0..=n)
        .map(|i| {
            let t = i as f64 / n as f64;
            let p = at(x0 + (x1 - x0) * t, y0 + (y1 - y0) * t);
            TrackPoint::with_timestamp(p.latitude, p.longitude, 1_700_000_000 + i as i64 * 10)
        })
        .collect()
}

pub fn config() -> UnveilConfig {
    let mut config = UnveilConfig::default();
    config.snapper.timeout_ms = 200;
    config.snapper.initial_backoff_ms = 1;
    config.snapper.max_backoff_ms = 5;
    config
}

pub fn service_with<S: RoadSnapper, K: GeometryKernel>(
    config: UnveilConfig,
    snapper: impl FnOnce(Arc<ReferenceIndex>) -> S,
    kernel: K,
    store: Arc<dyn AreaStore>,
) -> UnveilService<S, K> {
    let region = region();
    let index = Arc::new(index(&region));
    UnveilService::new(
        config,
        RegionCatalog::new(vec![region]).expect("catalog"),
        vec![index.clone()],
        snapper(index),
        kernel,
        store,
    )
    .expect("service")
}

/// Service with the offline snapper, planar kernel and in-memory store.
pub fn service() -> UnveilService<OfflineSnapper, fog_engine::PlanarKernel> {
    service_with(
        config(),
        |index| OfflineSnapper::new(config().snapper).with_index(index),
        fog_engine::PlanarKernel::default(),
        Arc::new(MemoryAreaStore::new()),
    )
}

/// Area of `geometry` lying outside the region boundary.
pub fn area_outside<K: GeometryKernel>(kernel: &K, geometry: &MultiPolygon<f64>) -> f64 {
    kernel.area(&kernel.difference(geometry, region().projected_boundary()))
}
