//! Affinity error types

use thiserror::Error;

/// Errors raised while building a spatial affinity
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AffinityError {
    /// Partition count must be at least one
    #[error("Invalid partition count {0}: must be at least 1")]
    InvalidPartitionCount(u32),
}

/// Result type alias for affinity operations
pub type AffinityResult<T> = Result<T, AffinityError>;
