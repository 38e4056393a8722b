//! Inbound messages of the listen stream.

use crate::status::Status;
use docsync_model::{Document, DocumentKey, SnapshotVersion, TargetId};
use serde::{Deserialize, Serialize};

/// State transition reported by a [`WatchTargetChange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WatchTargetChangeState {
    /// No state change; may carry a new resume token or mark a snapshot
    /// boundary when no target ids are given.
    NoChange,
    /// The targets were added.
    Added,
    /// The targets were removed, possibly with an error cause.
    Removed,
    /// The targets are up to date as of the next snapshot boundary.
    Current,
    /// The targets' contents must be discarded and resent.
    Reset,
}

/// A change to the state of one or more targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchTargetChange {
    /// The transition.
    pub state: WatchTargetChangeState,
    /// Affected targets; empty means every active target.
    pub target_ids: Vec<TargetId>,
    /// New resume token, empty if unchanged.
    pub resume_token: Vec<u8>,
    /// Read time of a snapshot boundary, or `MIN`.
    pub read_time: SnapshotVersion,
    /// Error that caused a removal.
    pub cause: Option<Status>,
}

impl WatchTargetChange {
    /// Creates a change without token, read time or cause.
    #[must_use]
    pub fn new(state: WatchTargetChangeState, target_ids: Vec<TargetId>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Vec::new(),
            read_time: SnapshotVersion::MIN,
            cause: None,
        }
    }

    /// A global snapshot boundary at `read_time`.
    #[must_use]
    pub fn snapshot(read_time: SnapshotVersion, resume_token: Vec<u8>) -> Self {
        Self {
            state: WatchTargetChangeState::NoChange,
            target_ids: Vec::new(),
            resume_token,
            read_time,
            cause: None,
        }
    }

    /// Attaches a resume token.
    #[must_use]
    pub fn with_resume_token(mut self, token: Vec<u8>) -> Self {
        self.resume_token = token;
        self
    }

    /// Attaches a removal cause.
    #[must_use]
    pub fn with_cause(mut self, cause: Status) -> Self {
        self.cause = Some(cause);
        self
    }
}

/// A document was added to or modified in some targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentChange {
    /// New contents of the document.
    pub document: Document,
    /// Targets the document now matches.
    pub updated_target_ids: Vec<TargetId>,
    /// Targets the document no longer matches.
    pub removed_target_ids: Vec<TargetId>,
}

/// A document was deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentDelete {
    /// Deleted document.
    pub key: DocumentKey,
    /// Version at which the deletion was observed.
    pub read_time: SnapshotVersion,
    /// Targets the document was removed from.
    pub removed_target_ids: Vec<TargetId>,
}

/// A document left some targets; its current state is not sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRemove {
    /// Removed document.
    pub key: DocumentKey,
    /// Targets the document was removed from.
    pub removed_target_ids: Vec<TargetId>,
}

/// Parameters of a bloom filter of unchanged document names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilterParams {
    /// Bit array, least significant bit first within each byte.
    pub bitmap: Vec<u8>,
    /// Unused bits at the end of the last byte.
    pub padding: u8,
    /// Number of hash positions per value.
    pub hash_count: u32,
}

/// The true member count of a target, optionally with a membership filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistenceFilter {
    /// Number of documents matching the target on the server.
    pub count: i32,
    /// Bloom filter over the fully qualified names of those documents.
    pub unchanged_names: Option<BloomFilterParams>,
}

/// An existence filter for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistenceFilterChange {
    /// The target being checked.
    pub target_id: TargetId,
    /// The filter.
    pub filter: ExistenceFilter,
}

/// An inbound listen stream message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchChange {
    /// Target state change or snapshot boundary.
    TargetChange(WatchTargetChange),
    /// Document added or modified.
    DocumentChange(DocumentChange),
    /// Document deleted.
    DocumentDelete(DocumentDelete),
    /// Document no longer in some targets.
    DocumentRemove(DocumentRemove),
    /// Member count check.
    ExistenceFilter(ExistenceFilterChange),
}

impl WatchChange {
    /// Returns the snapshot version this message commits, or `MIN` if it is
    /// not a global snapshot boundary.
    #[must_use]
    pub fn snapshot_version(&self) -> SnapshotVersion {
        match self {
            WatchChange::TargetChange(change)
                if change.state == WatchTargetChangeState::NoChange
                    && change.target_ids.is_empty() =>
            {
                change.read_time
            }
            _ => SnapshotVersion::MIN,
        }
    }
}
