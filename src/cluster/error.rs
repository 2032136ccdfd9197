//! Cluster error types

use crate::affinity::AffinityError;
use crate::storage::StorageError;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while building or feeding the in-process cluster
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Ingestion found no live node serving the tile's division
    #[error("No eligible node for division {division}")]
    NoEligibleNode { division: u32 },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Affinity error: {0}")]
    Affinity(#[from] AffinityError),

    #[error("Unknown node {0}")]
    UnknownNode(Uuid),
}

/// Result type alias for cluster operations
pub type ClusterResult<T> = Result<T, ClusterError>;
