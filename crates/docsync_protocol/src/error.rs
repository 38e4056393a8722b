//! Error types for protocol handling.

use docsync_model::{ModelError, TargetId};
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while interpreting stream messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Bloom filter parameters are inconsistent.
    #[error("invalid bloom filter: {0}")]
    InvalidBloomFilter(String),

    /// A write response arrived without a stream token.
    #[error("write response is missing its stream token")]
    MissingStreamToken,

    /// A message referenced a target the client does not know.
    #[error("unknown target {0}")]
    UnknownTarget(TargetId),

    /// A model value in the message was invalid.
    #[error(transparent)]
    Model(#[from] ModelError),
}
