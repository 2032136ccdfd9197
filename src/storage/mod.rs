//! Groundwork measurement store
//!
//! This module provides the spatially indexed, per-cell time-ordered
//! measurement store:
//!
//! - **types**: Core data structures (Pass, TileAddress, CellCoord, TimeRange)
//! - **index**: Arena-backed fixed-depth spatial index
//! - **tile**: Index leaves and their segment directories
//! - **segment**: Time-bounded per-tile segments and their blob format
//! - **cleave**: Splitting of over-large segments
//! - **existence**: One-bit-per-tile existence map
//! - **tier**: Persistence tier boundary
//! - **store**: The segment store orchestrating all of the above
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//!   (tile, cell, Pass) → SpatialIndex → Tile lock → Segment → Cleave
//!
//! Flush:
//!   dirty Segment → versioned blob → PersistenceTier
//!
//! Read Path:
//!   ExistenceMap → Tile → Segments ∩ TimeRange → cell passes
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use groundwork::storage::{CellCoord, MemoryTier, Pass, SegmentStore, StoreConfig, TileAddress, TimeRange};
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = SegmentStore::new(StoreConfig::default(), Arc::new(MemoryTier::new()));
//!
//!     let tile = TileAddress::new(1_000, 2_000);
//!     store.append(tile, CellCoord::new(3, 4), Pass::new(1_700_000_000_000, 101.25).cmv(420))?;
//!
//!     let passes = store.passes_for(tile, CellCoord::new(3, 4), TimeRange::all())?;
//!     assert_eq!(passes.len(), 1);
//!     store.flush()?;
//!     Ok(())
//! }
//! ```

pub mod cleave;
pub mod error;
pub mod existence;
pub mod index;
pub mod segment;
pub mod store;
pub mod tier;
pub mod tile;
pub mod types;

// Re-export commonly used types
pub use cleave::{cleave, cleave_segment, split_points, CleaveLimits, CONTENTION_WARN_THRESHOLD};
pub use error::{StorageError, StorageResult};
pub use existence::{ExistenceMap, EXISTENCE_FORMAT_VERSION, EXISTENCE_KEY};
pub use index::SpatialIndex;
pub use segment::{CellSummary, Segment, SegmentId, SEGMENT_FORMAT_VERSION};
pub use store::{FlushStats, SegmentStore, StoreConfig, StoreStats};
pub use tier::{FileTier, MemoryTier, PersistenceTier};
pub use tile::{Tile, TileDirectory, TileSegments, DIRECTORY_FORMAT_VERSION};
pub use types::*;
