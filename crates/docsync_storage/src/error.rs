//! Error types for storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// The log contains a record that cannot be interpreted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// Another process holds the lock on the storage file.
    #[error("storage file {0} is locked by another process")]
    Locked(PathBuf),

    /// An entity could not be encoded.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// An entity could not be decoded.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// The backend refused a write.
    #[error("write failed: {0}")]
    WriteFailed(String),
}
