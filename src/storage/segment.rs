//! Time-bounded measurement segments
//!
//! A segment holds, for every cell of one tile, the time-ordered passes whose
//! timestamps fall within the segment's half-open range. Summary extents are
//! maintained incrementally as passes arrive.
//!
//! Frozen blob layout (little-endian):
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ version: u16                            │
//! │ magic: [u8; 4] = "GWSG"                 │
//! │ tile_x: u32, tile_y: u32                │
//! │ start: i64, end: i64                    │
//! │ cell_count: u32                         │
//! ├─────────────────────────────────────────┤
//! │ per-cell pass counts (packed column)    │
//! │ passes, cell-major (PackedPasses)       │
//! ├─────────────────────────────────────────┤
//! │ crc32: u32                              │
//! └─────────────────────────────────────────┘
//! ```

use crate::codec::{compute_range, BitReader, BitWriter, BlobReader, FieldDescriptor, PackedPasses};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{Pass, TileAddress, TimeRange, NULL_HEIGHT};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current segment blob format version
pub const SEGMENT_FORMAT_VERSION: u16 = 1;

const SEGMENT_MAGIC: [u8; 4] = *b"GWSG";

/// Identity of a segment: its tile and time range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentId {
    pub tile: TileAddress,
    pub start: i64,
    pub end: i64,
}

impl SegmentId {
    pub fn range(&self) -> TimeRange {
        TimeRange {
            start: self.start,
            end: self.end,
        }
    }

    /// Persistence tier key for the segment blob
    pub fn key(&self) -> String {
        format!(
            "segment/{}/{:016x}-{:016x}",
            self.tile.key(),
            self.start as u64,
            self.end as u64
        )
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}-{}", self.tile, self.start, self.end)
    }
}

/// Incrementally maintained extents for one cell
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellSummary {
    pub pass_count: u32,
    pub min_height: f32,
    pub max_height: f32,
    pub latest_time: i64,
}

impl Default for CellSummary {
    fn default() -> Self {
        Self {
            pass_count: 0,
            min_height: f32::MAX,
            max_height: NULL_HEIGHT,
            latest_time: i64::MIN,
        }
    }
}

impl CellSummary {
    fn include(&mut self, pass: &Pass) {
        self.pass_count += 1;
        if pass.has_height() {
            self.min_height = self.min_height.min(pass.height);
            self.max_height = self.max_height.max(pass.height);
        }
        self.latest_time = self.latest_time.max(pass.time);
    }

    /// Elevation extents, if any pass carried an elevation
    pub fn height_range(&self) -> Option<(f32, f32)> {
        (self.max_height != NULL_HEIGHT).then_some((self.min_height, self.max_height))
    }
}

/// Passes for every cell of a tile within one time range
#[derive(Debug, Clone)]
pub struct Segment {
    tile: TileAddress,
    range: TimeRange,
    cells: Vec<Vec<Pass>>,
    summaries: Vec<CellSummary>,
    extents: CellSummary,
    pass_count: usize,
    max_cell_pass_count: usize,
    dirty: bool,
    writable: bool,
}

impl Segment {
    /// Create an empty, writable segment
    pub fn new(tile: TileAddress, range: TimeRange, cells_per_tile: usize) -> Self {
        Self {
            tile,
            range,
            cells: vec![Vec::new(); cells_per_tile],
            summaries: vec![CellSummary::default(); cells_per_tile],
            extents: CellSummary::default(),
            pass_count: 0,
            max_cell_pass_count: 0,
            dirty: false,
            writable: true,
        }
    }

    /// Build a dirty, writable segment from already time-ordered cell pass lists
    pub fn from_cells(tile: TileAddress, range: TimeRange, cells: Vec<Vec<Pass>>) -> Self {
        let mut segment = Self::new(tile, range, cells.len());
        for (summary, passes) in segment.summaries.iter_mut().zip(&cells) {
            for pass in passes {
                summary.include(pass);
                segment.extents.include(pass);
            }
            segment.max_cell_pass_count = segment.max_cell_pass_count.max(passes.len());
            segment.pass_count += passes.len();
        }
        segment.cells = cells;
        segment.dirty = true;
        segment
    }

    pub fn id(&self) -> SegmentId {
        SegmentId {
            tile: self.tile,
            start: self.range.start,
            end: self.range.end,
        }
    }

    pub fn range(&self) -> TimeRange {
        self.range
    }

    pub fn cells_per_tile(&self) -> usize {
        self.cells.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Make the segment read-only
    pub fn freeze(&mut self) {
        self.writable = false;
    }

    /// Re-enable appends; the persisted copy is now stale
    pub fn thaw(&mut self) {
        if !self.writable {
            self.writable = true;
            self.dirty = true;
        }
    }

    /// Insert a pass into a cell, keeping the cell's passes in time order.
    /// Passes sharing a timestamp keep their arrival order.
    pub fn append(&mut self, cell_index: usize, pass: Pass) -> StorageResult<()> {
        if !self.writable {
            return Err(StorageError::SegmentNotWritable(self.id().to_string()));
        }
        if !self.range.contains(pass.time) {
            return Err(StorageError::InvalidPass(format!(
                "time {} outside segment range {}",
                pass.time, self.range
            )));
        }
        let passes = self.cells.get_mut(cell_index).ok_or_else(|| {
            StorageError::InvalidPass(format!("cell index {} out of range", cell_index))
        })?;

        let position = passes.partition_point(|p| p.time <= pass.time);
        passes.insert(position, pass);

        self.summaries[cell_index].include(&pass);
        self.extents.include(&pass);
        self.pass_count += 1;
        self.max_cell_pass_count = self.max_cell_pass_count.max(passes.len());
        self.dirty = true;
        Ok(())
    }

    /// All passes for a cell, in time order
    pub fn passes(&self, cell_index: usize) -> &[Pass] {
        self.cells.get(cell_index).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Passes for a cell falling within `range`, in time order
    pub fn passes_for(&self, cell_index: usize, range: TimeRange) -> impl Iterator<Item = &Pass> + '_ {
        let passes = self.passes(cell_index);
        let from = passes.partition_point(|p| p.time < range.start);
        let to = passes.partition_point(|p| p.time < range.end);
        passes[from..to.max(from)].iter()
    }

    pub fn summary(&self, cell_index: usize) -> Option<&CellSummary> {
        self.summaries.get(cell_index)
    }

    /// Extents over every pass in the segment
    pub fn extents(&self) -> &CellSummary {
        &self.extents
    }

    pub fn pass_count(&self) -> usize {
        self.pass_count
    }

    pub fn max_cell_pass_count(&self) -> usize {
        self.max_cell_pass_count
    }

    pub fn is_empty(&self) -> bool {
        self.pass_count == 0
    }

    /// Every pass in cell-major order, paired with its cell index
    pub fn iter_passes(&self) -> impl Iterator<Item = (usize, &Pass)> + '_ {
        self.cells
            .iter()
            .enumerate()
            .flat_map(|(index, passes)| passes.iter().map(move |p| (index, p)))
    }

    /// Split into consecutive segments at the given ascending boundaries,
    /// each of which must lie strictly inside this segment's range.
    pub fn split_at(&self, boundaries: &[i64]) -> Vec<Segment> {
        let mut edges = Vec::with_capacity(boundaries.len() + 2);
        edges.push(self.range.start);
        edges.extend(boundaries.iter().copied().filter(|&b| b > self.range.start && b < self.range.end));
        edges.push(self.range.end);

        edges
            .windows(2)
            .map(|w| {
                let range = TimeRange { start: w[0], end: w[1] };
                let cells = self
                    .cells
                    .iter()
                    .map(|passes| {
                        let from = passes.partition_point(|p| p.time < range.start);
                        let to = passes.partition_point(|p| p.time < range.end);
                        passes[from..to].to_vec()
                    })
                    .collect();
                Segment::from_cells(self.tile, range, cells)
            })
            .collect()
    }

    /// Serialize into a versioned, checksummed blob
    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        let mut out = Vec::with_capacity(64 + self.pass_count * 8);
        out.extend_from_slice(&SEGMENT_FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&SEGMENT_MAGIC);
        out.extend_from_slice(&self.tile.x.to_le_bytes());
        out.extend_from_slice(&self.tile.y.to_le_bytes());
        out.extend_from_slice(&self.range.start.to_le_bytes());
        out.extend_from_slice(&self.range.end.to_le_bytes());
        out.extend_from_slice(&(self.cells.len() as u32).to_le_bytes());

        let counts: Vec<i64> = self.cells.iter().map(|c| c.len() as i64).collect();
        let descriptor = compute_range(&counts, -1, 0, false);
        let mut writer = BitWriter::with_capacity(counts.len() * descriptor.bit_width as usize);
        for &count in &counts {
            writer.write(descriptor.encode(count), descriptor.bit_width);
        }
        descriptor.write_to(&mut out);
        let words = writer.into_words();
        out.extend_from_slice(&(words.len() as u32).to_le_bytes());
        for word in &words {
            out.extend_from_slice(&word.to_le_bytes());
        }

        PackedPasses::pack(self.cells.iter().flatten())?.write_to(&mut out);

        let checksum = crc32fast::hash(&out);
        out.extend_from_slice(&checksum.to_le_bytes());
        Ok(out)
    }

    /// Decode a blob produced by [`Segment::encode`]. The result is read-only.
    pub fn decode(blob: &[u8]) -> StorageResult<Self> {
        check_version(blob, "segment", SEGMENT_FORMAT_VERSION)?;
        let body = verify_checksum(blob)?;

        let mut reader = BlobReader::new(body);
        reader.read_u16()?;
        if reader.read_bytes(4)? != SEGMENT_MAGIC {
            return Err(StorageError::Corruption("invalid segment magic".into()));
        }
        let tile = TileAddress::new(reader.read_u32()?, reader.read_u32()?);
        let start = reader.read_i64()?;
        let end = reader.read_i64()?;
        let range = TimeRange::try_new(start, end)
            .ok_or_else(|| StorageError::Corruption(format!("empty segment range {}..{}", start, end)))?;
        let cell_count = reader.read_u32()? as usize;

        let descriptor = FieldDescriptor::read_from(&mut reader)?;
        let word_count = reader.read_u32()? as usize;
        let mut words = Vec::with_capacity(word_count.min(reader.remaining() / 8));
        for _ in 0..word_count {
            words.push(reader.read_u64()?);
        }
        let mut counts = Vec::with_capacity(cell_count.min(1 << 16));
        let mut bits = BitReader::new(&words);
        for _ in 0..cell_count {
            counts.push(descriptor.decode(bits.read(descriptor.bit_width)?) as usize);
        }

        let passes = PackedPasses::read_from(&mut reader)?.unpack()?;
        if passes.len() != counts.iter().sum::<usize>() {
            return Err(StorageError::Corruption(format!(
                "segment {} cell counts disagree with {} packed passes",
                tile,
                passes.len()
            )));
        }

        let mut remaining = passes.into_iter();
        let cells = counts
            .iter()
            .map(|&count| remaining.by_ref().take(count).collect())
            .collect();

        let mut segment = Segment::from_cells(tile, range, cells);
        segment.dirty = false;
        segment.writable = false;
        Ok(segment)
    }
}

/// Reject blobs whose leading version tag this build does not understand
pub(crate) fn check_version(blob: &[u8], kind: &'static str, supported: u16) -> StorageResult<()> {
    if blob.len() < 2 {
        return Err(StorageError::Corruption(format!("{} blob too short", kind)));
    }
    let found = u16::from_le_bytes([blob[0], blob[1]]);
    if found != supported {
        return Err(StorageError::FormatVersionUnsupported {
            kind,
            found,
            supported,
        });
    }
    Ok(())
}

/// Verify and strip a trailing crc32
pub(crate) fn verify_checksum(blob: &[u8]) -> StorageResult<&[u8]> {
    if blob.len() < 4 {
        return Err(StorageError::Corruption("blob too short for checksum".into()));
    }
    let (body, trailer) = blob.split_at(blob.len() - 4);
    let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let computed = crc32fast::hash(body);
    if stored != computed {
        return Err(StorageError::Corruption(format!(
            "checksum mismatch: stored={}, computed={}",
            stored, computed
        )));
    }
    Ok(body)
}
