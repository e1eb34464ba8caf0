//! Topology repair for buffered and unioned polygon sets.
//!
//! Repair is a fixed pipeline: sanitize rings, split self-intersecting rings
//! into simple loops and normalise through a boolean union, drop slivers,
//! validate. When validation still fails the input is snapped to a
//! progressively coarser grid and the pipeline is retried a bounded number
//! of times.

use std::collections::HashMap;

use geo::algorithm::line_intersection::{line_intersection, LineIntersection};
use geo::{Area, BooleanOps, Contains, Coord, Line, LineString, MapCoords, MultiPolygon, Polygon};
use log::{debug, warn};
use rstar::{RTree, RTreeObject, AABB};

use crate::error::{Result, UnveilError};

/// Repair tuning, part of [`crate::config::KernelConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct RepairPolicy {
    /// Grid steps (meters) tried in order after the unsnapped attempt
    pub grid_steps_m: Vec<f64>,
    /// Parts and holes smaller than this (m²) after normalisation are dropped
    pub min_ring_area_m2: f64,
}

pub(crate) fn repair(geometry: &MultiPolygon<f64>, policy: &RepairPolicy) -> Result<MultiPolygon<f64>> {
    repair_with(geometry, policy, normalize)
}

fn repair_with<N>(geometry: &MultiPolygon<f64>, policy: &RepairPolicy, normalize: N) -> Result<MultiPolygon<f64>>
where
    N: Fn(MultiPolygon<f64>) -> MultiPolygon<f64>,
{
    if geometry.0.is_empty() {
        return Ok(MultiPolygon::new(vec![]));
    }

    let steps = std::iter::once(None).chain(policy.grid_steps_m.iter().copied().map(Some));
    let mut attempts = 0;
    let mut last_problem = String::new();

    for step in steps {
        attempts += 1;
        let input = match step {
            None => geometry.clone(),
            Some(step) => snap_to_grid(geometry, step),
        };

        let normalized = drop_slivers(normalize(sanitize(&input)), policy.min_ring_area_m2);

        match validate(&normalized) {
            Ok(()) => {
                if attempts > 1 {
                    debug!(
                        "[Kernel] Repair succeeded on attempt {} (grid {:?}m)",
                        attempts, step
                    );
                }
                return Ok(normalized);
            }
            Err(problem) => {
                warn!("[Kernel] Repair attempt {} failed: {}", attempts, problem);
                last_problem = problem;
            }
        }
    }

    Err(UnveilError::GeometryRepair {
        message: last_problem,
        attempts,
    })
}

/// Rebuild invalid parts from simple loops, then merge overlapping parts.
///
/// Parts that are already simple pass through untouched; the rest become
/// the union of their exterior loops minus the union of their hole loops.
fn normalize(geometry: MultiPolygon<f64>) -> MultiPolygon<f64> {
    let parts = geometry
        .0
        .into_iter()
        .map(|polygon| {
            if polygon_is_simple(&polygon) {
                return MultiPolygon::new(vec![polygon]);
            }
            let (exterior, interiors) = polygon.into_inner();
            let shell = union_all(loops_as_parts(&exterior));
            let holes: Vec<_> = interiors.iter().flat_map(loops_as_parts).collect();
            if holes.is_empty() {
                shell
            } else {
                shell.difference(&union_all(holes))
            }
        })
        .collect();
    union_all(parts)
}

fn loops_as_parts(ring: &LineString<f64>) -> Vec<MultiPolygon<f64>> {
    split_ring(ring)
        .into_iter()
        .map(|ring| MultiPolygon::new(vec![Polygon::new(ring, vec![])]))
        .collect()
}

/// Union a set of polygon sets by pairwise reduction.
///
/// Balanced reduction keeps intermediate results small for long tracks.
pub(crate) fn union_all(mut parts: Vec<MultiPolygon<f64>>) -> MultiPolygon<f64> {
    while parts.len() > 1 {
        let mut next = Vec::with_capacity(parts.len() / 2 + 1);
        let mut iter = parts.into_iter();
        while let Some(a) = iter.next() {
            match iter.next() {
                Some(b) => next.push(a.union(&b)),
                None => next.push(a),
            }
        }
        parts = next;
    }
    parts
        .into_iter()
        .next()
        .unwrap_or_else(|| MultiPolygon::new(vec![]))
}

/// Drop non-finite coordinates, duplicates, spikes and rings with fewer
/// than three distinct vertices. Area is not judged here: a self-intersecting
/// ring's signed area says nothing about what it encloses.
fn sanitize(geometry: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    let polygons = geometry
        .0
        .iter()
        .filter_map(|polygon| {
            let exterior = clean_ring(polygon.exterior())?;
            let interiors = polygon.interiors().iter().filter_map(clean_ring).collect();
            Some(Polygon::new(exterior, interiors))
        })
        .collect();
    MultiPolygon::new(polygons)
}

fn clean_ring(ring: &LineString<f64>) -> Option<LineString<f64>> {
    let mut coords: Vec<Coord<f64>> = Vec::with_capacity(ring.0.len());
    for c in ring.coords() {
        if !(c.x.is_finite() && c.y.is_finite()) || coords.last() == Some(c) {
            continue;
        }
        // a -> b -> a collapses to a
        if coords.len() >= 2 && coords[coords.len() - 2] == *c {
            coords.pop();
            continue;
        }
        coords.push(*c);
    }

    // Same cleanup across the seam where the ring wraps around
    loop {
        let n = coords.len();
        if n >= 2 && coords[0] == coords[n - 1] {
            coords.pop();
        } else if n >= 3 && coords[n - 2] == coords[0] {
            coords.pop();
        } else if n >= 3 && coords[n - 1] == coords[1] {
            coords.remove(0);
        } else {
            break;
        }
    }

    if coords.len() < 3 {
        return None;
    }
    let mut ring = LineString::new(coords);
    ring.close();
    Some(ring)
}

/// Drop parts and holes below the sliver threshold, measured on the
/// normalised (simple) rings.
fn drop_slivers(geometry: MultiPolygon<f64>, min_ring_area: f64) -> MultiPolygon<f64> {
    let polygons = geometry
        .0
        .into_iter()
        .filter_map(|polygon| {
            let (exterior, interiors) = polygon.into_inner();
            if ring_area(&exterior) < min_ring_area {
                return None;
            }
            let interiors = interiors
                .into_iter()
                .filter(|ring| ring_area(ring) >= min_ring_area)
                .collect();
            Some(Polygon::new(exterior, interiors))
        })
        .collect();
    MultiPolygon::new(polygons)
}

fn ring_area(ring: &LineString<f64>) -> f64 {
    Polygon::new(ring.clone(), vec![]).unsigned_area()
}

fn snap_to_grid(geometry: &MultiPolygon<f64>, step: f64) -> MultiPolygon<f64> {
    geometry.map_coords(|c| Coord {
        x: (c.x / step).round() * step,
        y: (c.y / step).round() * step,
    })
}

fn validate(geometry: &MultiPolygon<f64>) -> std::result::Result<(), String> {
    for (i, polygon) in geometry.0.iter().enumerate() {
        for ring in std::iter::once(polygon.exterior()).chain(polygon.interiors()) {
            if ring.0.len() < 4 {
                return Err(format!("part {}: ring with {} coordinates", i, ring.0.len()));
            }
            if !ring.is_closed() {
                return Err(format!("part {}: unclosed ring", i));
            }
            if ring.coords().any(|c| !(c.x.is_finite() && c.y.is_finite())) {
                return Err(format!("part {}: non-finite coordinate", i));
            }
            if let Some(touch) = self_touches(ring).into_iter().find(|t| t.crossing) {
                return Err(format!(
                    "part {}: ring self-intersects at ({}, {})",
                    i, touch.points[0].x, touch.points[0].y
                ));
            }
        }
        if !holes_inside(polygon) {
            return Err(format!("part {}: hole outside its exterior", i));
        }
    }
    let area = geometry.unsigned_area();
    if !area.is_finite() {
        return Err("non-finite area".to_string());
    }
    Ok(())
}

fn polygon_is_simple(polygon: &Polygon<f64>) -> bool {
    std::iter::once(polygon.exterior())
        .chain(polygon.interiors())
        .all(|ring| !self_touches(ring).iter().any(|t| t.crossing))
        && holes_inside(polygon)
}

fn holes_inside(polygon: &Polygon<f64>) -> bool {
    if polygon.interiors().is_empty() {
        return true;
    }
    let shell = Polygon::new(polygon.exterior().clone(), vec![]);
    polygon.interiors().iter().all(|hole| shell.contains(hole))
}

// ============================================================================
// Self-intersection
// ============================================================================

/// Where two segments of one ring meet, other than adjacent segments
/// sharing their common vertex.
#[derive(Debug, Clone, Copy)]
struct SelfTouch {
    segments: (usize, usize),
    /// Both equal for a point contact; overlap ends for collinear segments
    points: [Coord<f64>; 2],
    /// A proper crossing or a collinear overlap of positive length
    crossing: bool,
}

struct SegmentEnvelope {
    idx: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for SegmentEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

fn ring_segments(ring: &LineString<f64>) -> Vec<Line<f64>> {
    ring.lines().filter(|line| line.start != line.end).collect()
}

fn segment_envelope(line: &Line<f64>) -> AABB<[f64; 2]> {
    AABB::from_corners([line.start.x, line.start.y], [line.end.x, line.end.y])
}

fn self_touches(ring: &LineString<f64>) -> Vec<SelfTouch> {
    segment_touches(&ring_segments(ring))
}

fn segment_touches(segments: &[Line<f64>]) -> Vec<SelfTouch> {
    let n = segments.len();
    let tree = RTree::bulk_load(
        segments
            .iter()
            .enumerate()
            .map(|(idx, line)| SegmentEnvelope {
                idx,
                envelope: segment_envelope(line),
            })
            .collect(),
    );

    let mut touches = Vec::new();
    for (i, a) in segments.iter().enumerate() {
        for candidate in tree.locate_in_envelope_intersecting(&segment_envelope(a)) {
            let j = candidate.idx;
            if j <= i {
                continue;
            }
            let adjacent = j == i + 1 || (i == 0 && j == n - 1);
            match line_intersection(*a, segments[j]) {
                None => {}
                Some(LineIntersection::SinglePoint {
                    intersection,
                    is_proper,
                }) => {
                    if adjacent && !is_proper {
                        continue;
                    }
                    touches.push(SelfTouch {
                        segments: (i, j),
                        points: [intersection; 2],
                        crossing: is_proper,
                    });
                }
                Some(LineIntersection::Collinear { intersection }) => {
                    let degenerate = intersection.start == intersection.end;
                    if adjacent && degenerate {
                        continue;
                    }
                    touches.push(SelfTouch {
                        segments: (i, j),
                        points: [intersection.start, intersection.end],
                        crossing: !degenerate,
                    });
                }
            }
        }
    }
    touches
}

/// Split a ring into simple closed loops at every point where it meets
/// itself. Loops with fewer than three vertices are dropped.
fn split_ring(ring: &LineString<f64>) -> Vec<LineString<f64>> {
    let segments = ring_segments(ring);
    if segments.len() < 3 {
        return vec![];
    }

    // Node every contact point into the segments it lies inside
    let mut inserts: Vec<Vec<Coord<f64>>> = vec![Vec::new(); segments.len()];
    for touch in segment_touches(&segments) {
        for idx in [touch.segments.0, touch.segments.1] {
            let line = segments[idx];
            for point in touch.points {
                if point != line.start && point != line.end {
                    inserts[idx].push(point);
                }
            }
        }
    }

    let mut walk: Vec<Coord<f64>> = Vec::with_capacity(segments.len() * 2);
    for (line, mut extra) in segments.iter().zip(inserts) {
        walk.push(line.start);
        extra.sort_by(|a, b| distance_sq(line.start, *a).total_cmp(&distance_sq(line.start, *b)));
        extra.dedup();
        walk.extend(extra);
    }

    // Cut a loop off every time the walk returns to a vertex still open
    let mut loops = Vec::new();
    let mut open: Vec<Coord<f64>> = Vec::with_capacity(walk.len());
    let mut position: HashMap<(u64, u64), usize> = HashMap::new();
    for c in walk {
        match position.get(&coord_key(c)).copied() {
            Some(k) => {
                let cycle: Vec<Coord<f64>> = open.drain(k + 1..).collect();
                for v in &cycle {
                    position.remove(&coord_key(*v));
                }
                if cycle.len() >= 2 {
                    loops.push(closed_ring(std::iter::once(c).chain(cycle).collect()));
                }
            }
            None => {
                position.insert(coord_key(c), open.len());
                open.push(c);
            }
        }
    }
    if open.len() >= 3 {
        loops.push(closed_ring(open));
    }
    loops
}

fn coord_key(c: Coord<f64>) -> (u64, u64) {
    // Adding zero folds -0.0 into 0.0
    ((c.x + 0.0).to_bits(), (c.y + 0.0).to_bits())
}

fn distance_sq(a: Coord<f64>, b: Coord<f64>) -> f64 {
    (a.x - b.x).powi(2) + (a.y - b.y).powi(2)
}

fn closed_ring(coords: Vec<Coord<f64>>) -> LineString<f64> {
    let mut ring = LineString::new(coords);
    ring.close();
    ring
}
