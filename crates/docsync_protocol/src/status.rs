//! Status codes for stream closes and write failures.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Canonical status codes, numbered as in gRPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    /// Success.
    Ok = 0,
    /// The operation was cancelled.
    Cancelled = 1,
    /// Unknown error.
    Unknown = 2,
    /// The client sent an invalid argument.
    InvalidArgument = 3,
    /// The deadline expired.
    DeadlineExceeded = 4,
    /// A document was not found.
    NotFound = 5,
    /// A document already exists.
    AlreadyExists = 6,
    /// The caller lacks permission.
    PermissionDenied = 7,
    /// A quota or rate limit was hit.
    ResourceExhausted = 8,
    /// A precondition failed.
    FailedPrecondition = 9,
    /// The operation was aborted, usually by contention.
    Aborted = 10,
    /// Out of range.
    OutOfRange = 11,
    /// Not implemented by the server.
    Unimplemented = 12,
    /// Internal server error.
    Internal = 13,
    /// The service is unavailable.
    Unavailable = 14,
    /// Unrecoverable data loss.
    DataLoss = 15,
    /// Credentials are missing or invalid.
    Unauthenticated = 16,
}

impl Code {
    /// Returns true if retrying the same request cannot succeed.
    #[must_use]
    pub fn is_permanent_error(self) -> bool {
        match self {
            Code::Ok
            | Code::Cancelled
            | Code::Unknown
            | Code::DeadlineExceeded
            | Code::ResourceExhausted
            | Code::Internal
            | Code::Unavailable
            | Code::Unauthenticated => false,
            Code::InvalidArgument
            | Code::NotFound
            | Code::AlreadyExists
            | Code::PermissionDenied
            | Code::FailedPrecondition
            | Code::Aborted
            | Code::OutOfRange
            | Code::Unimplemented
            | Code::DataLoss => true,
        }
    }

    /// Returns true if a write failing with this code should be rejected.
    ///
    /// `Aborted` is retried for writes even though it is permanent for reads.
    #[must_use]
    pub fn is_permanent_write_error(self) -> bool {
        self.is_permanent_error() && self != Code::Aborted
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A status code with a message.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct Status {
    /// The code.
    pub code: Code,
    /// Human readable detail.
    pub message: String,
}

impl Status {
    /// Creates a status.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The success status.
    #[must_use]
    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    /// Returns true for [`Code::Ok`].
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_is_retried_for_writes() {
        assert!(Code::Aborted.is_permanent_error());
        assert!(!Code::Aborted.is_permanent_write_error());
        assert!(Code::FailedPrecondition.is_permanent_write_error());
        assert!(!Code::Unavailable.is_permanent_write_error());
    }

    #[test]
    fn status_display() {
        let status = Status::new(Code::NotFound, "items/a");
        assert_eq!(status.to_string(), "NotFound: items/a");
        assert!(Status::ok().is_ok());
    }
}
