//! Query error types

use crate::buffers::BufferError;
use crate::pipeline::state::PipelineState;
use crate::storage::StorageError;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by query execution
#[derive(Error, Debug)]
pub enum QueryError {
    /// The query was cancelled before it completed
    #[error("Query aborted")]
    Aborted,

    /// Work for one division failed; sibling divisions were unaffected
    #[error("Partition {division} failed: {message}")]
    PartitionFailed { division: u32, message: String },

    /// A routed node has no executor to run its work
    #[error("No eligible node can execute division {division}")]
    NoEligibleNodes { division: u32 },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// Handle does not name a known query
    #[error("Unknown query {0}")]
    UnknownQuery(Uuid),

    /// Pipeline asked to move between incompatible states
    #[error("Invalid pipeline transition from {from} to {to}")]
    InvalidTransition { from: PipelineState, to: PipelineState },

    /// Anything else that went wrong while running partition work
    #[error("Execution error: {0}")]
    Execution(String),
}

impl QueryError {
    /// Status code suitable for callers that report queries by number
    pub fn code(&self) -> u16 {
        match self {
            QueryError::Aborted => 499,
            QueryError::UnknownQuery(_) => 404,
            QueryError::InvalidTransition { .. } => 409,
            QueryError::NoEligibleNodes { .. } => 503,
            QueryError::PartitionFailed { .. }
            | QueryError::Storage(_)
            | QueryError::Buffer(_)
            | QueryError::Execution(_) => 500,
        }
    }
}

/// Result type alias for query operations
pub type QueryResult<T> = Result<T, QueryError>;
