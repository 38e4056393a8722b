//! Error types for the sync engine and client.

use docsync_local::LocalError;
use docsync_protocol::{Code, ProtocolError, Status};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Local persistence or bookkeeping failed.
    #[error("local store error: {0}")]
    Local(#[from] LocalError),

    /// A malformed message arrived on a stream.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The server refused a write or a listen.
    #[error("server error: {0}")]
    Server(Status),

    /// Credentials were rejected twice in a row.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A result was requested from the server while offline.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Too many writes are awaiting acknowledgement.
    #[error("too many pending writes (limit {limit})")]
    TooManyPendingWrites {
        /// The configured limit.
        limit: usize,
    },

    /// The operation was cancelled, e.g. by a user change.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// The client was shut down.
    #[error("client is shut down")]
    Shutdown,
}

impl SyncError {
    /// Returns true if retrying the same operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Server(status) => !status.code.is_permanent_error(),
            SyncError::Unavailable(_) => true,
            SyncError::Local(err) => err.is_persistence_failure(),
            SyncError::Protocol(_)
            | SyncError::AuthenticationFailed(_)
            | SyncError::TooManyPendingWrites { .. }
            | SyncError::Cancelled(_)
            | SyncError::Shutdown => false,
        }
    }

    /// The status code closest to this error.
    #[must_use]
    pub fn code(&self) -> Code {
        match self {
            SyncError::Server(status) => status.code,
            SyncError::Local(_) => Code::Internal,
            SyncError::Protocol(_) => Code::Internal,
            SyncError::AuthenticationFailed(_) => Code::Unauthenticated,
            SyncError::Unavailable(_) => Code::Unavailable,
            SyncError::TooManyPendingWrites { .. } => Code::ResourceExhausted,
            SyncError::Cancelled(_) | SyncError::Shutdown => Code::Cancelled,
        }
    }
}

impl From<Status> for SyncError {
    fn from(status: Status) -> Self {
        SyncError::Server(status)
    }
}
