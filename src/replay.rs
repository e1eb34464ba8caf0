//! Replay frames: a data-only description of how an import reveals the map.
//!
//! Points are grouped, in their original order, into at most `max_frames`
//! consecutive runs. Frame `i` shows the route prefix up to the end of run
//! `i` and the cumulative buffer of that prefix. Every point is introduced by
//! exactly one frame. Rendering is left to the caller.

use std::ops::Range;

use geo::MultiPolygon;
use serde::{Deserialize, Serialize};

use crate::buffer::BufferGenerator;
use crate::config::ReplayConfig;
use crate::ingest::ActivityKind;
use crate::kernel::{GeometryKernel, LocalProjection};
use crate::{GpsPoint, TrackPoint};

/// One step of a replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayFrame {
    pub index: usize,
    /// First point introduced by this frame
    pub start: usize,
    /// Exclusive end; the frame shows `points[..end]`
    pub end: usize,
    /// Timestamp of the last point shown, when known
    pub timestamp: Option<i64>,
    /// Cumulative buffer of the prefix, in lng/lat
    pub coverage: MultiPolygon<f64>,
}

impl ReplayFrame {
    pub fn new_points(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// Ordered, restartable frame sequence for one import.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplaySequence {
    /// Points in original order
    pub points: Vec<TrackPoint>,
    pub frames: Vec<ReplayFrame>,
}

impl ReplaySequence {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Route prefix shown by `frame`.
    pub fn prefix(&self, frame: &ReplayFrame) -> &[TrackPoint] {
        &self.points[..frame.end.min(self.points.len())]
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplayFrame, &[TrackPoint])> {
        self.frames.iter().map(move |f| (f, self.prefix(f)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReplaySequencer {
    config: ReplayConfig,
}

impl ReplaySequencer {
    pub fn new(config: ReplayConfig) -> Self {
        Self { config }
    }

    pub fn sequence<K: GeometryKernel + ?Sized>(
        &self,
        kernel: &K,
        buffers: &BufferGenerator,
        kind: ActivityKind,
        points: &[TrackPoint],
        projection: &LocalProjection,
    ) -> ReplaySequence {
        let positions: Vec<GpsPoint> = points.iter().map(TrackPoint::position).collect();
        let mut cumulative = MultiPolygon::new(vec![]);
        let mut frames = Vec::new();

        for (index, run) in frame_runs(points.len(), self.config.max_frames).into_iter().enumerate() {
            // Overlap by one point so consecutive pieces join up
            let piece = &positions[run.start.saturating_sub(1)..run.end];
            let buffer = buffers.generate(kernel, kind, piece, projection);
            cumulative = kernel.union(&cumulative, &buffer);

            frames.push(ReplayFrame {
                index,
                start: run.start,
                end: run.end,
                timestamp: points[..run.end].iter().rev().find_map(|p| p.timestamp),
                coverage: projection.unproject_multi_polygon(&cumulative),
            });
        }

        ReplaySequence {
            points: points.to_vec(),
            frames,
        }
    }
}

/// Split `len` points into at most `max_frames` consecutive, non-empty runs.
fn frame_runs(len: usize, max_frames: usize) -> Vec<Range<usize>> {
    if len == 0 {
        return Vec::new();
    }
    let frames = len.min(max_frames.max(1));
    let base = len / frames;
    let extra = len % frames;
    let mut start = 0;
    (0..frames)
        .map(|i| {
            let size = base + usize::from(i < extra);
            let run = start..start + size;
            start += size;
            run
        })
        .collect()
}
