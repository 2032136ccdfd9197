//! Segment cleaving
//!
//! Splits over-large dirty segments so that every resulting segment stays
//! within the configured total and per-cell pass limits.
//!
//! Split points are chosen greedily: passes are walked in time order and a
//! new segment is started just before the first timestamp group that would
//! push the current segment over either limit. Passes sharing a timestamp
//! are never separated, so a single over-limit group is left intact.
//!
//! Cleaving is an optimisation. If the tile is busy the attempt is skipped
//! and picked up again by the next ingest-triggered pass.

use crate::storage::segment::Segment;
use crate::storage::tile::Tile;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Consecutive skipped attempts on one tile between contention warnings
pub const CONTENTION_WARN_THRESHOLD: u64 = 64;

/// Pass limits a segment must respect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleaveLimits {
    pub pass_count_limit: usize,
    pub per_cell_limit: usize,
}

impl CleaveLimits {
    pub fn new(pass_count_limit: usize, per_cell_limit: usize) -> Self {
        Self {
            pass_count_limit: pass_count_limit.max(1),
            per_cell_limit: per_cell_limit.max(1),
        }
    }

    pub fn exceeded_by(&self, segment: &Segment) -> bool {
        segment.pass_count() > self.pass_count_limit
            || segment.max_cell_pass_count() > self.per_cell_limit
    }
}

/// Timestamps at which `segment` should be cut to respect `limits`
pub fn split_points(segment: &Segment, limits: CleaveLimits) -> Vec<i64> {
    let mut events: Vec<(i64, usize)> = segment.iter_passes().map(|(cell, p)| (p.time, cell)).collect();
    events.sort_unstable();

    let mut points = Vec::new();
    let mut total = 0usize;
    let mut per_cell: HashMap<usize, usize> = HashMap::new();
    let mut group_counts: HashMap<usize, usize> = HashMap::new();

    for group in events.chunk_by(|a, b| a.0 == b.0) {
        let time = group[0].0;
        group_counts.clear();
        for &(_, cell) in group {
            *group_counts.entry(cell).or_default() += 1;
        }

        let over_total = total + group.len() > limits.pass_count_limit;
        let over_cell = group_counts
            .iter()
            .any(|(cell, n)| per_cell.get(cell).copied().unwrap_or(0) + n > limits.per_cell_limit);

        if total > 0 && (over_total || over_cell) {
            points.push(time);
            total = 0;
            per_cell.clear();
        }

        if group.len() > limits.pass_count_limit
            || group_counts.values().any(|&n| n > limits.per_cell_limit)
        {
            warn!(
                tile = %segment.id().tile,
                time,
                passes = group.len(),
                "Passes sharing one timestamp exceed cleave limits; left unsplit"
            );
        }

        total += group.len();
        for (&cell, &n) in &group_counts {
            *per_cell.entry(cell).or_default() += n;
        }
    }

    points
}

/// Split `segment` if it exceeds `limits`. Returns `None` when no split is
/// needed or none is possible.
pub fn cleave_segment(segment: &Segment, limits: CleaveLimits) -> Option<Vec<Segment>> {
    if !limits.exceeded_by(segment) {
        return None;
    }
    let points = split_points(segment, limits);
    if points.is_empty() {
        return None;
    }
    Some(segment.split_at(&points))
}

/// Cleave every dirty, over-limit segment of `tile`.
///
/// Never blocks: if the tile's lock is held elsewhere the attempt is
/// abandoned and `false` returned.
pub fn cleave(tile: &Tile, limits: CleaveLimits) -> bool {
    let address = tile.address();
    let Some(mut segments) = tile.try_lock() else {
        let attempts = tile.record_contention();
        debug!(tile_x = address.x, tile_y = address.y, attempts, "Cleave skipped, tile busy");
        if attempts % CONTENTION_WARN_THRESHOLD == 0 {
            warn!(
                tile_x = address.x,
                tile_y = address.y,
                attempts,
                "Tile repeatedly busy during cleave"
            );
        }
        return false;
    };
    tile.reset_contention();

    let mut cleaved = false;
    let mut position = 0;
    while position < segments.segments().len() {
        let current = &segments.segments()[position];
        let parts = if current.is_dirty() {
            cleave_segment(current, limits)
        } else {
            None
        };

        match parts {
            Some(parts) => {
                debug!(
                    tile_x = address.x,
                    tile_y = address.y,
                    segment = %segments.segments()[position].id(),
                    parts = parts.len(),
                    "Cleaved segment"
                );
                let count = parts.len();
                segments.replace(position, parts);
                position += count;
                cleaved = true;
            }
            None => position += 1,
        }
    }
    cleaved
}
