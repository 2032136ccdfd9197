//! Index leaves and their segment directories
//!
//! A tile owns the segments for one square of cells. Its segments are kept
//! sorted by start time, never overlap, and together cover the whole
//! timeline once the first pass has arrived.
//!
//! All mutation (append, cleave, freeze) happens under the tile's exclusive
//! lock. Appends block on it; the cleaver only ever tries it.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::segment::{check_version, verify_checksum, Segment, SegmentId};
use crate::storage::types::{Pass, TileAddress, TimeRange};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Current segment directory blob format version
pub const DIRECTORY_FORMAT_VERSION: u16 = 1;

/// A leaf of the spatial index
#[derive(Debug)]
pub struct Tile {
    address: TileAddress,
    segments: Mutex<TileSegments>,
    contention: AtomicU64,
}

impl Tile {
    pub fn new(address: TileAddress, cells_per_tile: usize) -> Self {
        Self::with_segments(address, TileSegments::new(address, cells_per_tile))
    }

    pub(crate) fn with_segments(address: TileAddress, segments: TileSegments) -> Self {
        Self {
            address,
            segments: Mutex::new(segments),
            contention: AtomicU64::new(0),
        }
    }

    pub fn address(&self) -> TileAddress {
        self.address
    }

    /// Block until the tile's segments are exclusively held
    pub fn lock(&self) -> MutexGuard<'_, TileSegments> {
        self.segments.lock()
    }

    /// Take the tile's lock only if it is free right now
    pub fn try_lock(&self) -> Option<MutexGuard<'_, TileSegments>> {
        self.segments.try_lock()
    }

    /// Append a pass to a cell, blocking until the tile lock is held
    pub fn append(&self, cell_index: usize, pass: Pass) -> StorageResult<()> {
        self.lock().append(cell_index, pass)
    }

    /// Copy out a cell's passes within `range`, in time order
    pub fn collect_passes(&self, cell_index: usize, range: TimeRange) -> Vec<Pass> {
        self.lock().passes_for(cell_index, range).copied().collect()
    }

    /// Consecutive cleave attempts skipped because the tile was busy
    pub fn cleave_contention(&self) -> u64 {
        self.contention.load(Ordering::Relaxed)
    }

    pub(crate) fn record_contention(&self) -> u64 {
        self.contention.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn reset_contention(&self) {
        self.contention.store(0, Ordering::Relaxed);
    }
}

/// The lock-protected segment list of a tile
#[derive(Debug)]
pub struct TileSegments {
    address: TileAddress,
    cells_per_tile: usize,
    segments: Vec<Segment>,
    obsolete: Vec<SegmentId>,
    dirty: bool,
}

impl TileSegments {
    pub fn new(address: TileAddress, cells_per_tile: usize) -> Self {
        Self {
            address,
            cells_per_tile,
            segments: Vec::new(),
            obsolete: Vec::new(),
            dirty: false,
        }
    }

    /// Rebuild from persisted segments, which must already be sorted and disjoint
    pub(crate) fn from_segments(address: TileAddress, cells_per_tile: usize, segments: Vec<Segment>) -> Self {
        Self {
            address,
            cells_per_tile,
            segments,
            obsolete: Vec::new(),
            dirty: false,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub(crate) fn segments_mut(&mut self) -> &mut [Segment] {
        &mut self.segments
    }

    pub fn segment_ids(&self) -> Vec<SegmentId> {
        self.segments.iter().map(Segment::id).collect()
    }

    pub fn pass_count(&self) -> usize {
        self.segments.iter().map(Segment::pass_count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(Segment::is_empty)
    }

    /// Segment whose range holds `time`, creating one if the tile has none yet.
    pub fn select_segment_for(&mut self, time: i64) -> &mut Segment {
        let position = self.segments.partition_point(|s| s.range().end <= time);
        let found = self
            .segments
            .get(position)
            .is_some_and(|s| s.range().contains(time));

        if !found {
            // Fill the gap between neighbours; an empty tile gets the whole timeline
            let start = position
                .checked_sub(1)
                .map(|i| self.segments[i].range().end)
                .unwrap_or(i64::MIN);
            let end = self
                .segments
                .get(position)
                .map(|s| s.range().start)
                .unwrap_or(i64::MAX);
            let range = TimeRange { start, end };
            self.segments
                .insert(position, Segment::new(self.address, range, self.cells_per_tile));
            self.dirty = true;
        }
        &mut self.segments[position]
    }

    /// Append into the owning segment, thawing it if it was frozen by a flush
    pub fn append(&mut self, cell_index: usize, pass: Pass) -> StorageResult<()> {
        if cell_index >= self.cells_per_tile {
            return Err(StorageError::InvalidPass(format!(
                "cell index {} outside tile of {} cells",
                cell_index, self.cells_per_tile
            )));
        }
        let segment = self.select_segment_for(pass.time);
        segment.thaw();
        segment.append(cell_index, pass)?;
        self.dirty = true;
        Ok(())
    }

    /// A cell's passes within `range`, across all segments, in time order.
    /// Consumed once; borrow the tile again for another pass over the data.
    pub fn passes_for(&self, cell_index: usize, range: TimeRange) -> impl Iterator<Item = &Pass> + '_ {
        self.segments
            .iter()
            .filter(move |s| s.range().overlaps(&range))
            .flat_map(move |s| s.passes_for(cell_index, range))
    }

    /// Replace the segment at `position` with its cleaved parts
    pub(crate) fn replace(&mut self, position: usize, parts: Vec<Segment>) {
        let old = self.segments.splice(position..=position, parts).collect::<Vec<_>>();
        self.obsolete.extend(old.iter().map(Segment::id));
        self.dirty = true;
    }

    /// Segment ids superseded since the last flush
    pub fn obsolete(&self) -> &[SegmentId] {
        &self.obsolete
    }

    pub(crate) fn take_obsolete(&mut self) -> Vec<SegmentId> {
        std::mem::take(&mut self.obsolete)
    }

    /// Serialize the segment directory: version tag, bincode body, crc32
    pub fn encode_directory(&self) -> StorageResult<Vec<u8>> {
        let directory = TileDirectory {
            tile: self.address,
            cells_per_tile: self.cells_per_tile as u32,
            segments: self.segment_ids(),
        };
        let mut out = DIRECTORY_FORMAT_VERSION.to_le_bytes().to_vec();
        out.extend(bincode::serialize(&directory)?);
        let checksum = crc32fast::hash(&out);
        out.extend_from_slice(&checksum.to_le_bytes());
        Ok(out)
    }
}

/// Persisted list of a tile's segments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileDirectory {
    pub tile: TileAddress,
    pub cells_per_tile: u32,
    pub segments: Vec<SegmentId>,
}

impl TileDirectory {
    pub fn decode(blob: &[u8]) -> StorageResult<Self> {
        check_version(blob, "segment directory", DIRECTORY_FORMAT_VERSION)?;
        let body = verify_checksum(blob)?;
        let payload = body
            .get(2..)
            .ok_or_else(|| StorageError::Corruption("segment directory truncated".into()))?;
        let directory: TileDirectory = bincode::deserialize(payload)?;

        let disjoint = directory
            .segments
            .windows(2)
            .all(|w| w[0].end <= w[1].start);
        if !disjoint {
            return Err(StorageError::Corruption(format!(
                "segment directory for {} has overlapping ranges",
                directory.tile
            )));
        }
        Ok(directory)
    }

    /// Persistence tier key for a tile's directory
    pub fn key(tile: TileAddress) -> String {
        format!("directory/{}", tile.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tile() -> Tile {
        Tile::new(TileAddress::new(3, 4), 1024)
    }

    #[test]
    fn test_first_append_creates_unbounded_segment() {
        let tile = tile();
        tile.append(10, Pass::new(5_000, 1.0)).unwrap();

        let segments = tile.lock();
        assert_eq!(segments.segments().len(), 1);
        assert_eq!(segments.segments()[0].range(), TimeRange::all());
        assert!(segments.is_dirty());
    }

    #[test]
    fn test_passes_for_spans_segments() {
        let tile = tile();
        for time in (0..20).map(|i| i * 100) {
            tile.append(1, Pass::new(time, 1.0)).unwrap();
        }
        {
            let mut segments = tile.lock();
            let parts = segments.segments()[0].split_at(&[550, 1250]);
            segments.replace(0, parts);
            assert_eq!(segments.obsolete().len(), 1);
        }

        let window = TimeRange::try_new(400, 1500).unwrap();
        let times: Vec<i64> = tile.collect_passes(1, window).iter().map(|p| p.time).collect();
        assert_eq!(times, (4..15).map(|i| i * 100).collect::<Vec<_>>());
    }

    #[test]
    fn test_append_thaws_frozen_segment() {
        let tile = tile();
        tile.append(0, Pass::new(1, 1.0)).unwrap();
        {
            let mut segments = tile.lock();
            segments.segments_mut()[0].freeze();
            segments.segments_mut()[0].mark_clean();
            segments.mark_clean();
        }

        tile.append(0, Pass::new(2, 1.0)).unwrap();
        let segments = tile.lock();
        assert!(segments.segments()[0].is_writable());
        assert!(segments.segments()[0].is_dirty());
        assert_eq!(segments.pass_count(), 2);
    }

    #[test]
    fn test_append_rejects_bad_cell() {
        let tile = tile();
        assert!(matches!(
            tile.append(1024, Pass::new(1, 1.0)),
            Err(StorageError::InvalidPass(_))
        ));
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let tile = tile();
        let _guard = tile.lock();
        assert!(tile.try_lock().is_none());
        assert_eq!(tile.record_contention(), 1);
        assert_eq!(tile.cleave_contention(), 1);
    }

    #[test]
    fn test_directory_blob() {
        let tile = tile();
        tile.append(0, Pass::new(100, 1.0)).unwrap();
        let blob = tile.lock().encode_directory().unwrap();
        let directory = TileDirectory::decode(&blob).unwrap();
        assert_eq!(directory.tile, tile.address());
        assert_eq!(directory.segments.len(), 1);

        let mut bad = blob.clone();
        bad[0] = 9;
        assert!(matches!(
            TileDirectory::decode(&bad),
            Err(StorageError::FormatVersionUnsupported { found: 9, .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_split_segments_concatenate_to_history(
            times in proptest::collection::vec(-5_000i64..5_000, 1..200),
            cuts in proptest::collection::btree_set(-5_000i64..5_000, 0..6),
        ) {
            let tile = tile();
            for &time in &times {
                tile.append(7, Pass::new(time, 2.0)).unwrap();
            }
            {
                let mut segments = tile.lock();
                let cuts: Vec<i64> = cuts.into_iter().collect();
                let parts = segments.segments()[0].split_at(&cuts);
                segments.replace(0, parts);
            }

            let mut expected = times.clone();
            expected.sort();
            let actual: Vec<i64> = tile
                .collect_passes(7, TimeRange::all())
                .iter()
                .map(|p| p.time)
                .collect();
            prop_assert_eq!(actual, expected);
        }
    }
}
