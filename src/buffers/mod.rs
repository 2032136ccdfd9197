//! Client leaf buffer factory
//!
//! Hands out pooled, typed query-result containers so high-throughput query
//! execution does not allocate a fresh grid per tile. One lock-free pool
//! per measurement type is shared by all worker threads on a node; a leaf is
//! exclusively owned by whoever acquired it until it is released.
//!
//! ```text
//!   acquire(type) ──► pool[type].pop() ──► clear ──► leaf
//!                        │ empty
//!                        └──► constructor[type](cells_per_tile)
//!   release(leaf) ──► clear ──► pool[leaf.type].push()   (or drop when full)
//! ```

pub mod error;
pub mod leaf;

pub use error::{BufferError, BufferResult};
pub use leaf::{
    has_cmv_target, ClientLeaf, CmvCell, HeightCell, Leaf, LeafGrid, MeasurementType, PassCountCell,
    TemperatureCell,
};

use crossbeam::queue::SegQueue;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;

/// Builds an empty leaf for a tile of the given cell count
pub type LeafConstructor = fn(usize) -> ClientLeaf;

const TYPE_COUNT: usize = MeasurementType::ALL.len();

/// Factory usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FactoryStats {
    pub constructed: usize,
    pub reused: usize,
    pub released: usize,
    /// Released leaves dropped because their pool was full
    pub discarded: usize,
}

/// Typed, pooled allocator of client leaves
#[derive(Debug)]
pub struct ClientLeafFactory {
    cells_per_tile: usize,
    max_pooled_per_type: usize,
    constructors: RwLock<[Option<LeafConstructor>; TYPE_COUNT]>,
    pools: [SegQueue<ClientLeaf>; TYPE_COUNT],
    constructed: AtomicUsize,
    reused: AtomicUsize,
    released: AtomicUsize,
    discarded: AtomicUsize,
}

impl ClientLeafFactory {
    /// Factory with no registered types
    pub fn new(cells_per_tile: usize, max_pooled_per_type: usize) -> Self {
        Self {
            cells_per_tile,
            max_pooled_per_type,
            constructors: RwLock::new([None; TYPE_COUNT]),
            pools: Default::default(),
            constructed: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            discarded: AtomicUsize::new(0),
        }
    }

    /// Factory with every built-in measurement type registered
    pub fn with_defaults(cells_per_tile: usize, max_pooled_per_type: usize) -> Self {
        let factory = Self::new(cells_per_tile, max_pooled_per_type);
        factory.register(MeasurementType::Height, ClientLeaf::height);
        factory.register(MeasurementType::PassCount, ClientLeaf::pass_count);
        factory.register(MeasurementType::Cmv, ClientLeaf::cmv);
        factory.register(MeasurementType::Temperature, ClientLeaf::temperature);
        factory
    }

    pub fn register(&self, measurement_type: MeasurementType, constructor: LeafConstructor) {
        self.constructors.write()[measurement_type.slot()] = Some(constructor);
    }

    pub fn is_registered(&self, measurement_type: MeasurementType) -> bool {
        self.constructors.read()[measurement_type.slot()].is_some()
    }

    /// A logically empty leaf of `measurement_type`, reused from the pool
    /// when one is available
    pub fn acquire(&self, measurement_type: MeasurementType) -> BufferResult<ClientLeaf> {
        let constructor = self.constructors.read()[measurement_type.slot()]
            .ok_or(BufferError::UnregisteredType(measurement_type))?;

        if let Some(mut leaf) = self.pools[measurement_type.slot()].pop() {
            leaf.clear();
            self.reused.fetch_add(1, Ordering::Relaxed);
            return Ok(leaf);
        }

        let leaf = constructor(self.cells_per_tile);
        if leaf.measurement_type() != measurement_type {
            return Err(BufferError::TypeMismatch {
                expected: measurement_type,
                found: leaf.measurement_type(),
            });
        }
        self.constructed.fetch_add(1, Ordering::Relaxed);
        trace!(%measurement_type, "Constructed client leaf");
        Ok(leaf)
    }

    /// Return a leaf to its type's pool
    pub fn release(&self, mut leaf: ClientLeaf) {
        leaf.clear();
        self.released.fetch_add(1, Ordering::Relaxed);
        let pool = &self.pools[leaf.measurement_type().slot()];
        if pool.len() >= self.max_pooled_per_type {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        pool.push(leaf);
    }

    /// Return a batch of leaves that must all be of `measurement_type`.
    /// Nothing is released if any leaf is of another type.
    pub fn release_many(
        &self,
        measurement_type: MeasurementType,
        leaves: Vec<ClientLeaf>,
    ) -> BufferResult<()> {
        if let Some(stray) = leaves.iter().find(|l| l.measurement_type() != measurement_type) {
            return Err(BufferError::TypeMismatch {
                expected: measurement_type,
                found: stray.measurement_type(),
            });
        }
        for leaf in leaves {
            self.release(leaf);
        }
        Ok(())
    }

    pub fn pooled(&self, measurement_type: MeasurementType) -> usize {
        self.pools[measurement_type.slot()].len()
    }

    pub fn cells_per_tile(&self) -> usize {
        self.cells_per_tile
    }

    pub fn stats(&self) -> FactoryStats {
        FactoryStats {
            constructed: self.constructed.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}
