//! Consistent multi-target snapshots produced by the aggregator.

use docsync_model::{DocumentKeySet, DocumentMap, SnapshotVersion, TargetId, TargetPurpose};
use std::collections::BTreeMap;

/// Net change to one target within a [`RemoteEvent`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetChange {
    /// Latest resume token, empty if unchanged.
    pub resume_token: Vec<u8>,
    /// Whether the target is up to date with the server.
    pub current: bool,
    /// Documents that joined the target.
    pub added_documents: DocumentKeySet,
    /// Documents that stayed in the target but changed.
    pub modified_documents: DocumentKeySet,
    /// Documents that left the target.
    pub removed_documents: DocumentKeySet,
}

impl TargetChange {
    /// A change that only reports the current flag and resume token.
    #[must_use]
    pub fn empty(current: bool, resume_token: Vec<u8>) -> Self {
        Self {
            resume_token,
            current,
            ..Self::default()
        }
    }
}

/// Everything the listen stream reported up to one snapshot boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEvent {
    /// Version all changes are consistent at.
    pub snapshot_version: SnapshotVersion,
    /// Per-target changes.
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose local state was reset and must be re-listened, with the
    /// purpose of the re-listen.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    /// New document states.
    pub document_updates: DocumentMap,
    /// Documents whose only interested targets are limbo resolutions.
    pub resolved_limbo_documents: DocumentKeySet,
}

impl RemoteEvent {
    /// An event with no changes at `snapshot_version`.
    #[must_use]
    pub fn empty(snapshot_version: SnapshotVersion) -> Self {
        Self {
            snapshot_version,
            target_changes: BTreeMap::new(),
            target_mismatches: BTreeMap::new(),
            document_updates: DocumentMap::new(),
            resolved_limbo_documents: DocumentKeySet::new(),
        }
    }
}
