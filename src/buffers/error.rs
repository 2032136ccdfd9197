//! Buffer factory error types

use crate::buffers::MeasurementType;
use thiserror::Error;

/// Errors raised by the client leaf buffer factory
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// No constructor registered for the measurement type
    #[error("No client leaf constructor registered for {0}")]
    UnregisteredType(MeasurementType),

    /// A leaf was handed to a pool of a different measurement type
    #[error("Client leaf type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: MeasurementType,
        found: MeasurementType,
    },
}

/// Result type alias for buffer operations
pub type BufferResult<T> = Result<T, BufferError>;
