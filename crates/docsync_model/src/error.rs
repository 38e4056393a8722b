//! Error types for the document model.

use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while constructing or combining model values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// A path could not be used where it was supplied.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath {
        /// The offending path.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An argument failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The server returned a different number of results than mutations sent.
    #[error("mutation result count mismatch: expected {expected}, got {actual}")]
    MutationResultMismatch {
        /// Number of mutations in the batch.
        expected: usize,
        /// Number of results received.
        actual: usize,
    },
}

impl ModelError {
    /// Creates an invalid path error.
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
