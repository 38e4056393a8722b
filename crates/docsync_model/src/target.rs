//! Targets: the server-side form of a query, plus watch bookkeeping.

use crate::key::DocumentKey;
use crate::path::ResourcePath;
use crate::query::{Bound, Filter, OrderBy};
use crate::version::SnapshotVersion;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// Numeric handle of a watched target.
pub type TargetId = i32;

/// A normalized query as tracked by the listen stream.
///
/// Unlike a [`crate::Query`], a target's ordering is already fully
/// normalized and limit-to-last has been flipped into limit-to-first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    /// Base path.
    pub path: ResourcePath,
    /// Collection group id, for collection group targets.
    pub collection_group: Option<String>,
    /// Filters combined with AND.
    pub filters: Vec<Filter>,
    /// Full ordering including the key tie-breaker.
    pub order_by: Vec<OrderBy>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Start bound.
    pub start_at: Option<Bound>,
    /// End bound.
    pub end_at: Option<Bound>,
}

impl Target {
    /// Creates a target that watches a single document.
    #[must_use]
    pub fn for_document(key: &DocumentKey) -> Self {
        crate::Query::document(key).to_target()
    }

    /// Returns true if this target watches exactly one document.
    #[must_use]
    pub fn is_document_target(&self) -> bool {
        self.collection_group.is_none()
            && DocumentKey::is_document_key(&self.path)
            && self.filters.is_empty()
    }

    /// A string that is equal for equal targets.
    #[must_use]
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        for filter in &self.filters {
            id.push_str(&filter.canonical_id());
        }
        id.push_str("|ob:");
        for order in &self.order_by {
            id.push_str(&order.canonical_id());
        }
        if let Some(limit) = self.limit {
            id.push_str("|l:");
            id.push_str(&limit.to_string());
        }
        if let Some(bound) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(&bound.canonical_id());
        }
        if let Some(bound) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(&bound.canonical_id());
        }
        id
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_id() == other.canonical_id()
    }
}

impl Eq for Target {}

impl Hash for Target {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical_id().hash(state);
    }
}

/// Why a target is being watched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetPurpose {
    /// A regular application listen.
    Listen,
    /// Re-listen after an existence filter mismatch without a bloom filter.
    ExistenceFilterMismatch,
    /// Re-listen after a mismatch the bloom filter could not resolve.
    ExistenceFilterMismatchBloom,
    /// Single-document watch resolving a limbo document.
    LimboResolution,
}

/// A target together with its watch state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetData {
    /// The watched target.
    pub target: Target,
    /// Its numeric id.
    pub target_id: TargetId,
    /// Why it is watched.
    pub purpose: TargetPurpose,
    /// Latest consistent snapshot the target has been brought up to.
    pub snapshot_version: SnapshotVersion,
    /// Latest snapshot at which the target had no limbo documents.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    /// Opaque cursor for resuming the watch.
    pub resume_token: Vec<u8>,
    /// Document count expected by the client when resuming.
    pub expected_count: Option<i32>,
}

impl TargetData {
    /// Creates target data with no watch history.
    #[must_use]
    pub fn new(target: Target, target_id: TargetId, purpose: TargetPurpose) -> Self {
        Self {
            target,
            target_id,
            purpose,
            snapshot_version: SnapshotVersion::MIN,
            last_limbo_free_snapshot_version: SnapshotVersion::MIN,
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    /// Returns a copy with a new resume token and snapshot version.
    ///
    /// The expected count is cleared since it belonged to the old token.
    #[must_use]
    pub fn with_resume_token(&self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        Self {
            resume_token,
            snapshot_version,
            expected_count: None,
            ..self.clone()
        }
    }

    /// Returns a copy with a new limbo-free snapshot version.
    #[must_use]
    pub fn with_last_limbo_free_snapshot_version(&self, version: SnapshotVersion) -> Self {
        Self {
            last_limbo_free_snapshot_version: version,
            ..self.clone()
        }
    }

    /// Returns a copy with an expected document count.
    #[must_use]
    pub fn with_expected_count(&self, count: i32) -> Self {
        Self {
            expected_count: Some(count),
            ..self.clone()
        }
    }
}

/// Hands out target ids from disjoint sequences.
///
/// The local target cache uses even ids starting at 2; the sync engine uses
/// odd ids starting at 1 for limbo resolution targets.
#[derive(Debug, Clone)]
pub struct TargetIdGenerator {
    next_id: TargetId,
}

impl TargetIdGenerator {
    /// Generator for persisted query targets, continuing after `highest`.
    #[must_use]
    pub fn for_target_cache(highest: TargetId) -> Self {
        let mut next_id = highest.max(0) + 1;
        if next_id % 2 != 0 {
            next_id += 1;
        }
        Self { next_id }
    }

    /// Generator for limbo resolution targets.
    #[must_use]
    pub fn for_sync_engine() -> Self {
        Self { next_id: 1 }
    }

    /// Returns the next id.
    pub fn next_id(&mut self) -> TargetId {
        let id = self.next_id;
        self.next_id += 2;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Direction, Operator, Query};

    #[test]
    fn id_sequences_are_disjoint() {
        let mut cache = TargetIdGenerator::for_target_cache(0);
        let mut sync = TargetIdGenerator::for_sync_engine();
        assert_eq!(cache.next_id(), 2);
        assert_eq!(cache.next_id(), 4);
        assert_eq!(sync.next_id(), 1);
        assert_eq!(sync.next_id(), 3);

        let mut resumed = TargetIdGenerator::for_target_cache(6);
        assert_eq!(resumed.next_id(), 8);
    }

    #[test]
    fn canonical_id_covers_limit_and_order() {
        let base = Query::collection("items").where_field("qty", Operator::GreaterThan, 0);
        let a = base.clone().order_by("qty", Direction::Descending).to_target();
        let b = base.limit_to_first(2).to_target();
        assert_ne!(a, b);
        assert!(a.canonical_id().contains("qtydesc"));
    }

    #[test]
    fn resume_token_clears_expected_count() {
        let data = TargetData::new(Query::collection("items").to_target(), 2, TargetPurpose::Listen)
            .with_expected_count(3)
            .with_resume_token(vec![1], SnapshotVersion::from_millis(5));
        assert_eq!(data.expected_count, None);
        assert_eq!(data.resume_token, vec![1]);
    }

    #[test]
    fn document_target() {
        let key = DocumentKey::parse("items/a").unwrap();
        assert!(Target::for_document(&key).is_document_target());
    }
}
