//! Segment store
//!
//! Orchestrates the storage components for one node:
//! - Write path: (tile, cell, pass) → index path → tile lock → segment → cleave
//! - Read path: tile → segments overlapping the time range → cell passes
//! - Persistence: dirty segments → versioned blobs → [`PersistenceTier`]
//!
//! Appends block on the tile lock; the ingest-triggered cleave does not.

use crate::storage::cleave::{cleave, CleaveLimits};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::existence::{ExistenceMap, EXISTENCE_KEY};
use crate::storage::index::SpatialIndex;
use crate::storage::segment::Segment;
use crate::storage::tier::PersistenceTier;
use crate::storage::tile::{Tile, TileDirectory, TileSegments};
use crate::storage::types::{CellCoord, IndexGeometry, Pass, TileAddress, TimeRange};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Configuration for a segment store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub geometry: IndexGeometry,
    pub limits: CleaveLimits,
    /// Cleave over-limit segments as soon as an append pushes them over
    pub cleave_on_ingest: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            geometry: IndexGeometry::default(),
            limits: CleaveLimits::new(10_000_000, 10_000),
            cleave_on_ingest: true,
        }
    }
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub tiles: usize,
    pub segments: usize,
    pub dirty_segments: usize,
    pub passes: usize,
}

/// Outcome of a flush
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub segments_written: usize,
    pub segments_removed: usize,
    pub directories_written: usize,
    pub bytes_written: usize,
}

/// Spatially indexed, per-cell time-ordered measurement store
pub struct SegmentStore {
    config: StoreConfig,
    index: RwLock<SpatialIndex>,
    existence: RwLock<ExistenceMap>,
    tier: Arc<dyn PersistenceTier>,
}

impl SegmentStore {
    /// Create an empty store writing through `tier`
    pub fn new(config: StoreConfig, tier: Arc<dyn PersistenceTier>) -> Self {
        Self {
            index: RwLock::new(SpatialIndex::new(config.geometry)),
            existence: RwLock::new(ExistenceMap::new()),
            config,
            tier,
        }
    }

    /// Rebuild a store from what `tier` holds. Reloaded segments are
    /// read-only until an append lands in them.
    pub fn open(config: StoreConfig, tier: Arc<dyn PersistenceTier>) -> StorageResult<Self> {
        let store = Self::new(config, tier);
        let Some(blob) = store.tier.get(EXISTENCE_KEY)? else {
            info!("No existence map found, starting empty");
            return Ok(store);
        };
        let existence = ExistenceMap::decode(&blob)?;
        let cells_per_tile = store.config.geometry.cells_per_tile();

        let mut segment_count = 0;
        {
            let mut index = store.index.write();
            for address in existence.iter() {
                let directory = match store.tier.get(&TileDirectory::key(address))? {
                    Some(blob) => TileDirectory::decode(&blob)?,
                    None => {
                        return Err(StorageError::Corruption(format!(
                            "existence map marks {} but no segment directory exists",
                            address
                        )))
                    }
                };
                if directory.cells_per_tile as usize != cells_per_tile || directory.tile != address {
                    return Err(StorageError::Corruption(format!(
                        "segment directory for {} does not match index geometry",
                        address
                    )));
                }

                let mut segments = Vec::with_capacity(directory.segments.len());
                for id in &directory.segments {
                    let blob = store.tier.get(&id.key())?.ok_or_else(|| {
                        StorageError::Corruption(format!("segment {} missing from tier", id))
                    })?;
                    let segment = Segment::decode(&blob)?;
                    if segment.id() != *id {
                        return Err(StorageError::Corruption(format!(
                            "segment blob {} carries id {}",
                            id,
                            segment.id()
                        )));
                    }
                    if segment.cells_per_tile() != cells_per_tile {
                        return Err(StorageError::Corruption(format!(
                            "segment {} holds {} cells, index geometry has {}",
                            id,
                            segment.cells_per_tile(),
                            cells_per_tile
                        )));
                    }
                    segments.push(segment);
                }
                segment_count += segments.len();

                let tile_segments = TileSegments::from_segments(address, cells_per_tile, segments);
                index.insert_tile(Tile::with_segments(address, tile_segments))?;
            }
        }

        info!(
            tiles = existence.count(),
            segments = segment_count,
            "Loaded segment store"
        );
        *store.existence.write() = existence;
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn geometry(&self) -> IndexGeometry {
        self.config.geometry
    }

    /// The tile at `address`, constructing its index path if asked to
    pub fn tile_for(&self, address: TileAddress, create_if_absent: bool) -> StorageResult<Option<Arc<Tile>>> {
        if let Some(tile) = self.index.read().locate(address) {
            return Ok(Some(tile));
        }
        if !create_if_absent {
            if !self.config.geometry.contains(address) {
                return Err(StorageError::AddressOutOfRange {
                    address,
                    limit: self.config.geometry.tiles_per_axis(),
                });
            }
            return Ok(None);
        }
        self.index.write().construct_path(address, true)
    }

    pub fn locate(&self, address: TileAddress) -> Option<Arc<Tile>> {
        self.index.read().locate(address)
    }

    /// Append one measurement. Blocks until the tile lock is held; a
    /// rejected pass leaves existing segments untouched.
    pub fn append(&self, address: TileAddress, cell: CellCoord, pass: Pass) -> StorageResult<()> {
        pass.validate().map_err(StorageError::InvalidPass)?;
        let cell_index = self
            .config
            .geometry
            .cell_index(cell)
            .ok_or(StorageError::CellOutOfRange {
                x: cell.x,
                y: cell.y,
                dimension: self.config.geometry.dimension(),
            })?;
        let tile = self
            .tile_for(address, true)?
            .ok_or_else(|| StorageError::Corruption(format!("index failed to construct {}", address)))?;

        let over_limit = {
            let mut segments = tile.lock();
            segments.append(cell_index, pass)?;

            // Visible to readers no later than the pass itself
            let unseen = !self.existence.read().contains(address);
            if unseen && self.existence.write().set(address) {
                debug!(tile_x = address.x, tile_y = address.y, "First pass in tile");
            }

            let limits = self.config.limits;
            segments
                .segments()
                .iter()
                .any(|s| s.is_dirty() && limits.exceeded_by(s))
        };

        if over_limit && self.config.cleave_on_ingest {
            cleave(&tile, self.config.limits);
        }
        Ok(())
    }

    /// A cell's passes within `range`, in time order
    pub fn passes_for(&self, address: TileAddress, cell: CellCoord, range: TimeRange) -> StorageResult<Vec<Pass>> {
        let cell_index = self
            .config
            .geometry
            .cell_index(cell)
            .ok_or(StorageError::CellOutOfRange {
                x: cell.x,
                y: cell.y,
                dimension: self.config.geometry.dimension(),
            })?;
        Ok(self
            .tile_for(address, false)?
            .map(|tile| tile.collect_passes(cell_index, range))
            .unwrap_or_default())
    }

    /// Whether `address` holds any data
    pub fn has_data(&self, address: TileAddress) -> bool {
        self.existence.read().contains(address)
    }

    /// Copy of this store's existence map
    pub fn existence(&self) -> ExistenceMap {
        self.existence.read().clone()
    }

    pub fn tiles(&self) -> Vec<Arc<Tile>> {
        self.index.read().tiles().cloned().collect()
    }

    /// Attempt to cleave every tile; returns how many tiles were cleaved
    pub fn cleave_all(&self) -> usize {
        self.tiles()
            .iter()
            .filter(|tile| cleave(tile, self.config.limits))
            .count()
    }

    /// Persist every dirty segment and directory, drop obsoleted segment
    /// blobs, then write the existence map.
    pub fn flush(&self) -> StorageResult<FlushStats> {
        if self.config.cleave_on_ingest {
            self.cleave_all();
        }

        let mut stats = FlushStats::default();
        for tile in self.tiles() {
            let mut segments = tile.lock();

            for segment in segments.segments_mut().iter_mut().filter(|s| s.is_dirty()) {
                let blob = segment.encode()?;
                self.tier.put(&segment.id().key(), &blob)?;
                segment.freeze();
                segment.mark_clean();
                stats.segments_written += 1;
                stats.bytes_written += blob.len();
            }

            let live: HashSet<_> = segments.segment_ids().into_iter().collect();
            for id in segments.take_obsolete() {
                if !live.contains(&id) {
                    self.tier.remove(&id.key())?;
                    stats.segments_removed += 1;
                }
            }

            if segments.is_dirty() {
                let blob = segments.encode_directory()?;
                self.tier.put(&TileDirectory::key(tile.address()), &blob)?;
                segments.mark_clean();
                stats.directories_written += 1;
                stats.bytes_written += blob.len();
            }
        }

        let blob = self.existence.read().encode();
        self.tier.put(EXISTENCE_KEY, &blob)?;
        stats.bytes_written += blob.len();

        info!(
            segments = stats.segments_written,
            removed = stats.segments_removed,
            directories = stats.directories_written,
            bytes = stats.bytes_written,
            "Flushed segment store"
        );
        Ok(stats)
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats::default();
        for tile in self.tiles() {
            let segments = tile.lock();
            stats.tiles += 1;
            stats.segments += segments.segments().len();
            stats.dirty_segments += segments.segments().iter().filter(|s| s.is_dirty()).count();
            stats.passes += segments.pass_count();
        }
        stats
    }
}

impl std::fmt::Debug for SegmentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentStore")
            .field("geometry", &self.config.geometry)
            .field("tiles", &self.index.read().tile_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::mm_to_height;
    use crate::storage::tier::{FileTier, MemoryTier};
    use tempfile::tempdir;

    fn memory_store(limits: CleaveLimits) -> SegmentStore {
        let config = StoreConfig {
            limits,
            ..StoreConfig::default()
        };
        SegmentStore::new(config, Arc::new(MemoryTier::new()))
    }

    #[test]
    fn test_append_sets_existence_bit() {
        let store = memory_store(CleaveLimits::new(1_000, 100));
        let address = TileAddress::new(40, 41);
        assert!(!store.has_data(address));

        store.append(address, CellCoord::new(1, 2), Pass::new(10, 1.0)).unwrap();
        assert!(store.has_data(address));
        assert_eq!(store.existence().count(), 1);
        assert_eq!(store.passes_for(address, CellCoord::new(1, 2), TimeRange::all()).unwrap().len(), 1);
    }

    #[test]
    fn test_existence_bit_set_before_tile_unlock() {
        let store = Arc::new(memory_store(CleaveLimits::new(usize::MAX, 10_000)));
        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for x in 0..200 {
                    store
                        .append(TileAddress::new(x, 0), CellCoord::new(0, 0), Pass::new(1, 1.0))
                        .unwrap();
                }
            })
        };

        while !writer.is_finished() {
            for tile in store.tiles() {
                let segments = tile.lock();
                if segments.pass_count() > 0 {
                    assert!(store.has_data(tile.address()));
                }
            }
        }
        writer.join().unwrap();
        assert_eq!(store.existence().count(), 200);
    }

    #[test]
    fn test_rejected_pass_leaves_store_untouched() {
        let store = memory_store(CleaveLimits::new(1_000, 100));
        let address = TileAddress::new(0, 0);
        store.append(address, CellCoord::new(0, 0), Pass::new(10, 1.0)).unwrap();

        let err = store.append(address, CellCoord::new(0, 0), Pass::new(i64::MAX, 1.0)).unwrap_err();
        assert!(matches!(err, StorageError::InvalidPass(_)));
        let err = store.append(address, CellCoord::new(32, 0), Pass::new(11, 1.0)).unwrap_err();
        assert!(matches!(err, StorageError::CellOutOfRange { x: 32, .. }));
        let err = store
            .append(TileAddress::new(1 << 25, 0), CellCoord::new(0, 0), Pass::new(11, 1.0))
            .unwrap_err();
        assert!(matches!(err, StorageError::AddressOutOfRange { .. }));

        assert_eq!(store.stats().passes, 1);
    }

    #[test]
    fn test_ingest_triggers_cleave() {
        let store = memory_store(CleaveLimits::new(usize::MAX, 100));
        let address = TileAddress::new(2, 2);
        for i in 0..450 {
            store.append(address, CellCoord::new(3, 3), Pass::new(i * 10, 1.0)).unwrap();
        }

        let stats = store.stats();
        assert_eq!(stats.passes, 450);
        assert!(stats.segments >= 5);
        let tile = store.locate(address).unwrap();
        assert!(tile.lock().segments().iter().all(|s| s.max_cell_pass_count() <= 100));
    }

    #[test]
    fn test_flush_and_reopen() {
        let dir = tempdir().unwrap();
        let tier: Arc<dyn PersistenceTier> = Arc::new(FileTier::open(dir.path(), true).unwrap());
        let config = StoreConfig {
            limits: CleaveLimits::new(usize::MAX, 50),
            ..StoreConfig::default()
        };

        let store = SegmentStore::new(config.clone(), Arc::clone(&tier));
        for i in 0..200i64 {
            let address = TileAddress::new((i % 3) as u32, 7);
            let pass = Pass::new(1_000 + i * 100, mm_to_height(5_000 + i as i32)).cmv(300);
            store.append(address, CellCoord::new(4, (i % 2) as u16), pass).unwrap();
        }
        let flushed = store.flush().unwrap();
        assert!(flushed.segments_written >= 3);
        assert_eq!(flushed.directories_written, 3);
        assert_eq!(store.stats().dirty_segments, 0);

        let reopened = SegmentStore::open(config, tier).unwrap();
        assert_eq!(reopened.existence(), store.existence());
        assert_eq!(reopened.stats().passes, 200);
        for x in 0..3 {
            for y in 0..2 {
                let address = TileAddress::new(x, 7);
                let cell = CellCoord::new(4, y);
                assert_eq!(
                    reopened.passes_for(address, cell, TimeRange::all()).unwrap(),
                    store.passes_for(address, cell, TimeRange::all()).unwrap()
                );
            }
        }

        // Reloaded segments are read-only until appended to
        let tile = reopened.locate(TileAddress::new(0, 7)).unwrap();
        assert!(tile.lock().segments().iter().all(|s| !s.is_writable()));
        reopened
            .append(TileAddress::new(0, 7), CellCoord::new(4, 0), Pass::new(999_999, 1.0))
            .unwrap();
        assert_eq!(reopened.stats().dirty_segments, 1);
    }

    #[test]
    fn test_flush_extreme_times() {
        use crate::storage::types::PASS_TIME_LIMIT;

        let tier: Arc<dyn PersistenceTier> = Arc::new(MemoryTier::new());
        let store = SegmentStore::new(StoreConfig::default(), Arc::clone(&tier));
        let address = TileAddress::new(0, 0);
        let cell = CellCoord::new(0, 0);

        let err = store.append(address, cell, Pass::new(i64::MIN + 1, 1.0)).unwrap_err();
        assert!(matches!(err, StorageError::InvalidPass(_)));
        let err = store.append(address, cell, Pass::new(i64::MAX - 1, 1.0)).unwrap_err();
        assert!(matches!(err, StorageError::InvalidPass(_)));

        store.append(address, cell, Pass::new(-PASS_TIME_LIMIT, 1.0)).unwrap();
        store.append(address, cell, Pass::new(PASS_TIME_LIMIT, 2.0)).unwrap();
        assert_eq!(store.flush().unwrap().segments_written, 1);

        let reopened = SegmentStore::open(StoreConfig::default(), tier).unwrap();
        let times: Vec<i64> = reopened
            .passes_for(address, cell, TimeRange::all())
            .unwrap()
            .iter()
            .map(|p| p.time)
            .collect();
        assert_eq!(times, vec![-PASS_TIME_LIMIT, PASS_TIME_LIMIT]);
    }

    #[test]
    fn test_flush_removes_obsolete_segments() {
        let tier = Arc::new(MemoryTier::new());
        let config = StoreConfig {
            limits: CleaveLimits::new(usize::MAX, 10),
            cleave_on_ingest: false,
            ..StoreConfig::default()
        };
        let store = SegmentStore::new(config, tier.clone());
        let address = TileAddress::new(9, 9);
        for i in 0..5 {
            store.append(address, CellCoord::new(0, 0), Pass::new(i, 1.0)).unwrap();
        }
        store.flush().unwrap();
        assert_eq!(tier.keys_with_prefix("segment/").unwrap().len(), 1);

        for i in 5..35 {
            store.append(address, CellCoord::new(0, 0), Pass::new(i, 1.0)).unwrap();
        }
        assert_eq!(store.cleave_all(), 1);
        let stats = store.flush().unwrap();
        assert_eq!(stats.segments_removed, 1);
        assert_eq!(tier.keys_with_prefix("segment/").unwrap().len(), 4);
    }

    #[test]
    fn test_open_rejects_segment_with_wrong_cell_count() {
        let tier: Arc<dyn PersistenceTier> = Arc::new(MemoryTier::new());
        let store = SegmentStore::new(StoreConfig::default(), Arc::clone(&tier));
        let address = TileAddress::new(2, 3);
        store.append(address, CellCoord::new(0, 0), Pass::new(10, 1.0)).unwrap();
        store.flush().unwrap();

        let range = store.locate(address).unwrap().lock().segments()[0].range();
        let mut cells = vec![Vec::new(); 16];
        cells[0].push(Pass::new(10, 1.0));
        let foreign = Segment::from_cells(address, range, cells);
        tier.put(&foreign.id().key(), &foreign.encode().unwrap()).unwrap();

        let err = SegmentStore::open(StoreConfig::default(), tier).unwrap_err();
        assert!(matches!(err, StorageError::Corruption(_)));
    }

    #[test]
    fn test_open_empty_tier() {
        let store = SegmentStore::open(StoreConfig::default(), Arc::new(MemoryTier::new())).unwrap();
        assert_eq!(store.stats(), StoreStats::default());
    }
}
