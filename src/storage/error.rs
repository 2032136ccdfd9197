//! Storage error types
//!
//! Defines all errors that can occur in the spatial index, the segment store
//! and the persistence tier boundary.

use crate::storage::types::TileAddress;
use thiserror::Error;

/// Errors that can occur in the storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Data corruption detected (checksum mismatch, invalid magic, truncated blob)
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// Tile address lies outside the index's coordinate space
    #[error("Tile address {address} is outside the index coordinate space (limit {limit})")]
    AddressOutOfRange { address: TileAddress, limit: u32 },

    /// Cell coordinate lies outside the tile
    #[error("Cell ({x}, {y}) is outside a tile of dimension {dimension}")]
    CellOutOfRange { x: u16, y: u16, dimension: u16 },

    /// Append attempted against a frozen (read-only) segment
    #[error("Segment {0} is not writable")]
    SegmentNotWritable(String),

    /// A timestamp precedes the epoch it is being encoded against
    #[error("Invalid time ordering: {time} precedes epoch {epoch}")]
    InvalidTimeOrdering { time: i64, epoch: i64 },

    /// A timestamp lies too far from its epoch to be encoded
    #[error("Time {time} cannot be encoded relative to epoch {epoch}")]
    TimeOutOfRange { time: i64, epoch: i64 },

    /// Blob carries a format version this build does not understand
    #[error("Unsupported format version {found} for {kind} (supported: {supported})")]
    FormatVersionUnsupported {
        kind: &'static str,
        found: u16,
        supported: u16,
    },

    /// Malformed measurement rejected at the append boundary
    #[error("Invalid pass: {0}")]
    InvalidPass(String),
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
