//! Requests and responses of the listen and write streams.

use docsync_model::{Mutation, MutationResult, SnapshotVersion, Target, TargetId};
use serde::{Deserialize, Serialize};

/// Where a re-added target should resume from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResumeFrom {
    /// Start from scratch.
    None,
    /// Continue after an opaque resume token.
    Token(Vec<u8>),
    /// Continue from a known read time.
    ReadTime(SnapshotVersion),
}

/// Outbound message on the listen stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListenRequest {
    /// Start watching a target.
    AddTarget {
        /// Client-assigned target id.
        target_id: TargetId,
        /// What to watch.
        target: Target,
        /// Resume point.
        resume: ResumeFrom,
        /// Number of documents the client believes match, for existence
        /// filter checks on resume.
        expected_count: Option<i32>,
    },
    /// Stop watching a target.
    RemoveTarget {
        /// Target to remove.
        target_id: TargetId,
    },
}

/// Outbound message on the write stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteRequest {
    /// First message after the stream opens; the server answers with the
    /// initial stream token.
    Handshake,
    /// Commit a batch of mutations.
    Write {
        /// Token from the latest response.
        stream_token: Vec<u8>,
        /// Mutations to commit atomically.
        mutations: Vec<Mutation>,
    },
}

/// Inbound message on the write stream.
///
/// The first response answers the handshake and has no results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResponse {
    /// Token to thread into the next request.
    pub stream_token: Vec<u8>,
    /// Commit version of the acknowledged write.
    pub commit_version: SnapshotVersion,
    /// One result per mutation of the acknowledged write.
    pub results: Vec<MutationResult>,
}
