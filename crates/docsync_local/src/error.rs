//! Error types for the local store.

use docsync_model::{BatchId, ModelError, TargetId};
use docsync_storage::StorageError;
use thiserror::Error;

/// Result type for local store operations.
pub type LocalResult<T> = Result<T, LocalError>;

/// Errors that can occur in the local store.
#[derive(Debug, Error)]
pub enum LocalError {
    /// The persistence layer failed.
    #[error("persistence error: {0}")]
    Storage(#[from] StorageError),

    /// A model invariant was violated.
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    /// No pending batch has the given id.
    #[error("mutation batch {0} not found")]
    BatchNotFound(BatchId),

    /// No allocated target has the given id.
    #[error("target {0} is not allocated")]
    TargetNotFound(TargetId),

    /// A write was submitted without mutations.
    #[error("mutation batch is empty")]
    EmptyBatch,
}

impl LocalError {
    /// Returns true if the error comes from the persistence layer rather
    /// than from the request itself.
    #[must_use]
    pub fn is_persistence_failure(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}
