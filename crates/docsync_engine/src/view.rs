//! Views: the materialized result of one query.
//!
//! A view holds the documents currently shown for its query and diffs every
//! batch of changed documents against them. It also tracks which keys the
//! backend has confirmed for the target (the synced documents), which keys
//! carry pending writes, and which shown documents are in limbo.

use crate::online_state::OnlineState;
use docsync_model::{
    Document, DocumentComparator, DocumentKey, DocumentKeySet, DocumentMap, DocumentSet, Query,
    SnapshotVersion,
};
use docsync_protocol::TargetChange;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// How a document changed between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    /// The document entered the result.
    Added,
    /// The document left the result.
    Removed,
    /// The document's contents changed.
    Modified,
    /// Only the pending-write state changed.
    Metadata,
}

impl ChangeType {
    fn sort_order(self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

/// One document change within a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentViewChange {
    /// Kind of change.
    pub kind: ChangeType,
    /// The document after the change, or before it for removals.
    pub document: Document,
}

/// Accumulates changes by key, folding successive changes into one.
#[derive(Debug, Default)]
pub(crate) struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub(crate) fn track(&mut self, change: DocumentViewChange) {
        let key = change.document.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };
        use ChangeType::*;
        let merged = match (old.kind, change.kind) {
            (Metadata, new) if new != Added => Some(change),
            (old_kind, Metadata) if old_kind != Removed => Some(DocumentViewChange {
                kind: old_kind,
                document: change.document,
            }),
            (Modified, Modified) => Some(change),
            (Added, Modified) => Some(DocumentViewChange {
                kind: Added,
                document: change.document,
            }),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange {
                kind: Removed,
                document: old.document.clone(),
            }),
            (Removed, Added) => Some(DocumentViewChange {
                kind: Modified,
                document: change.document,
            }),
            (old_kind, new_kind) => {
                debug!(%key, ?old_kind, ?new_kind, "unexpected change sequence");
                Some(change)
            }
        };
        match merged {
            Some(change) => {
                self.changes.insert(key, change);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub(crate) fn into_changes(self) -> Vec<DocumentViewChange> {
        self.changes.into_values().collect()
    }
}

/// A limbo document appeared in or left a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimboDocumentChange {
    /// The key entered limbo.
    Added(DocumentKey),
    /// The key left limbo.
    Removed(DocumentKey),
}

/// An immutable snapshot of a view.
#[derive(Debug, Clone)]
pub struct ViewSnapshot {
    /// The query.
    pub query: Query,
    /// Documents in query order.
    pub documents: DocumentSet,
    /// Documents of the previous snapshot.
    pub old_documents: DocumentSet,
    /// Changes from the previous snapshot, removals first.
    pub changes: Vec<DocumentViewChange>,
    /// Keys of shown documents with pending writes.
    pub mutated_keys: DocumentKeySet,
    /// Whether the result may not match the backend.
    pub from_cache: bool,
    /// Whether `from_cache` flipped with this snapshot.
    pub sync_state_changed: bool,
    /// Whether metadata-only changes were stripped.
    pub excludes_metadata_changes: bool,
    /// Whether the target had been synced before, so cached results are
    /// meaningful.
    pub has_cached_results: bool,
    /// Latest remote snapshot version applied to the view.
    pub snapshot_version: SnapshotVersion,
}

impl ViewSnapshot {
    /// Returns true if any shown document has pending writes.
    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }

    /// A snapshot in which every current document was just added.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: DocumentKeySet,
        from_cache: bool,
        has_cached_results: bool,
        snapshot_version: SnapshotVersion,
    ) -> Self {
        let changes = documents
            .iter()
            .map(|doc| DocumentViewChange {
                kind: ChangeType::Added,
                document: doc.clone(),
            })
            .collect();
        Self {
            query,
            old_documents: documents.empty_like(),
            documents,
            changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
            has_cached_results,
            snapshot_version,
        }
    }
}

/// Result of [`View::compute_doc_changes`]; apply with [`View::apply_changes`].
#[derive(Debug)]
pub struct ViewDocumentChanges {
    pub(crate) document_set: DocumentSet,
    pub(crate) change_set: DocumentChangeSet,
    pub(crate) mutated_keys: DocumentKeySet,
    /// A limit query lost documents at its edge and must be rerun against
    /// the full local result before the changes can be applied.
    pub needs_refill: bool,
}

/// What applying changes produced.
#[derive(Debug, Default)]
pub struct ViewChange {
    /// The new snapshot, if anything visible changed.
    pub snapshot: Option<ViewSnapshot>,
    /// Keys entering or leaving limbo.
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// The materialized result of a query.
pub struct View {
    query: Query,
    comparator: DocumentComparator,
    current: bool,
    /// `None` until the first snapshot, which is always produced.
    from_cache: Option<bool>,
    document_set: DocumentSet,
    synced_documents: DocumentKeySet,
    limbo_documents: DocumentKeySet,
    mutated_keys: DocumentKeySet,
    snapshot_version: SnapshotVersion,
    has_cached_results: bool,
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("query", &self.query.canonical_id())
            .field("current", &self.current)
            .field("documents", &self.document_set)
            .field("limbo_documents", &self.limbo_documents)
            .finish()
    }
}

impl View {
    /// Creates an empty view; `synced_documents` are the keys the backend
    /// already confirmed for the target.
    pub fn new(query: Query, synced_documents: DocumentKeySet) -> Self {
        let comparator: DocumentComparator = Arc::new(query.comparator());
        Self {
            document_set: DocumentSet::new(Arc::clone(&comparator)),
            comparator,
            query,
            current: false,
            from_cache: None,
            synced_documents,
            limbo_documents: DocumentKeySet::new(),
            mutated_keys: DocumentKeySet::new(),
            snapshot_version: SnapshotVersion::MIN,
            has_cached_results: false,
        }
    }

    /// Marks the target as synced before, e.g. because it has a resume
    /// token, so cached results are shown right away.
    pub fn with_cached_results(mut self, has_cached_results: bool) -> Self {
        self.has_cached_results = has_cached_results;
        self
    }

    /// The view's query.
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Keys the backend has confirmed for the target.
    pub fn synced_documents(&self) -> &DocumentKeySet {
        &self.synced_documents
    }

    /// Keys of shown documents in limbo.
    pub fn limbo_documents(&self) -> &DocumentKeySet {
        &self.limbo_documents
    }

    /// Documents currently shown.
    pub fn documents(&self) -> &DocumentSet {
        &self.document_set
    }

    /// Raises the version attached to the next snapshots.
    pub fn advance_snapshot_version(&mut self, version: SnapshotVersion) {
        if version > self.snapshot_version {
            self.snapshot_version = version;
        }
    }

    /// Diffs `changed` against the view, or against `previous` when
    /// recomputing after a refill.
    pub fn compute_doc_changes(
        &self,
        changed: &DocumentMap,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let (mut change_set, mut document_set, mut mutated_keys) = match previous {
            Some(previous) => (
                previous.change_set,
                previous.document_set,
                previous.mutated_keys,
            ),
            None => (
                DocumentChangeSet::default(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let limit = self.query.limit().map(|l| l as usize);
        let last_in_limit = match limit {
            Some(limit) if self.query.has_limit_to_first() && document_set.len() == limit => {
                document_set.last().cloned()
            }
            _ => None,
        };
        let first_in_limit = match limit {
            Some(limit) if self.query.has_limit_to_last() && document_set.len() == limit => {
                document_set.first().cloned()
            }
            _ => None,
        };
        let mut needs_refill = false;

        for (key, entry) in changed {
            let old_doc = document_set.get(key).cloned();
            let new_doc = if self.query.matches(entry) {
                Some(entry)
            } else {
                None
            };
            let old_had_pending = old_doc.is_some() && self.mutated_keys.contains(key);
            let new_has_pending = new_doc.is_some_and(|doc| {
                doc.has_local_mutations()
                    || (self.mutated_keys.contains(key) && doc.has_committed_mutations())
            });

            let mut applied = false;
            match (&old_doc, new_doc) {
                (Some(old), Some(new)) => {
                    if old.data() != new.data() {
                        if !Self::should_wait_for_synced_document(old, new) {
                            change_set.track(DocumentViewChange {
                                kind: ChangeType::Modified,
                                document: new.clone(),
                            });
                            applied = true;
                            let past_last = last_in_limit
                                .as_ref()
                                .is_some_and(|last| (self.comparator)(new, last) == Ordering::Greater);
                            let before_first = first_in_limit
                                .as_ref()
                                .is_some_and(|first| (self.comparator)(new, first) == Ordering::Less);
                            if past_last || before_first {
                                // The modified document may now sort beyond
                                // documents outside the limit.
                                needs_refill = true;
                            }
                        }
                    } else if old_had_pending != new_has_pending {
                        change_set.track(DocumentViewChange {
                            kind: ChangeType::Metadata,
                            document: new.clone(),
                        });
                        applied = true;
                    }
                }
                (None, Some(new)) => {
                    change_set.track(DocumentViewChange {
                        kind: ChangeType::Added,
                        document: new.clone(),
                    });
                    applied = true;
                }
                (Some(old), None) => {
                    change_set.track(DocumentViewChange {
                        kind: ChangeType::Removed,
                        document: old.clone(),
                    });
                    applied = true;
                    if last_in_limit.is_some() || first_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if applied {
                match new_doc {
                    Some(new) => {
                        document_set.insert(new.clone());
                        if new_has_pending {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                    }
                    None => {
                        document_set.remove(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while document_set.len() > limit {
                let evicted = if self.query.has_limit_to_first() {
                    document_set.last().cloned()
                } else {
                    document_set.first().cloned()
                };
                let Some(evicted) = evicted else { break };
                document_set.remove(evicted.key());
                mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange {
                    kind: ChangeType::Removed,
                    document: evicted,
                });
            }
        }

        ViewDocumentChanges {
            document_set,
            change_set,
            mutated_keys,
            needs_refill,
        }
    }

    fn should_wait_for_synced_document(old: &Document, new: &Document) -> bool {
        // An acknowledged write is shown only once the listen stream confirms
        // it, avoiding a flicker back to the committed-but-unsynced value.
        old.has_local_mutations() && new.has_committed_mutations() && !new.has_local_mutations()
    }

    /// Applies computed changes and an optional target change.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        update_limbo_documents: bool,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        let old_documents = std::mem::replace(&mut self.document_set, doc_changes.document_set);
        self.mutated_keys = doc_changes.mutated_keys;

        let mut changes = doc_changes.change_set.into_changes();
        changes.sort_by(|a, b| {
            a.kind
                .sort_order()
                .cmp(&b.kind.sort_order())
                .then_with(|| (self.comparator)(&a.document, &b.document))
        });

        if let Some(target_change) = target_change {
            for key in &target_change.added_documents {
                self.synced_documents.insert(key.clone());
            }
            for key in &target_change.removed_documents {
                self.synced_documents.remove(key);
            }
            self.current = target_change.current;
            if !target_change.resume_token.is_empty() {
                self.has_cached_results = true;
            }
        }

        let limbo_changes = if update_limbo_documents && !target_is_pending_reset {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let from_cache = !synced;
        let sync_state_changed = self.from_cache != Some(from_cache);
        self.from_cache = Some(from_cache);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }
        ViewChange {
            snapshot: Some(ViewSnapshot {
                query: self.query.clone(),
                documents: self.document_set.clone(),
                old_documents,
                changes,
                mutated_keys: self.mutated_keys.clone(),
                from_cache,
                sync_state_changed,
                excludes_metadata_changes: false,
                has_cached_results: self.has_cached_results,
                snapshot_version: self.snapshot_version,
            }),
            limbo_changes,
        }
    }

    /// Marks the view as not current when the client goes offline.
    pub fn apply_online_state_change(&mut self, state: OnlineState) -> ViewChange {
        if self.current && state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::default(),
                mutated_keys: self.mutated_keys.clone(),
                needs_refill: false,
            };
            return self.apply_changes(unchanged, false, None, false);
        }
        ViewChange::default()
    }

    fn should_be_in_limbo(&self, key: &DocumentKey) -> bool {
        if self.synced_documents.contains(key) {
            return false;
        }
        match self.document_set.get(key) {
            // Local writes explain a document the backend has not confirmed.
            Some(doc) => !doc.has_local_mutations(),
            None => false,
        }
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let old_limbo = std::mem::take(&mut self.limbo_documents);
        let new_limbo: DocumentKeySet = self
            .document_set
            .keys()
            .filter(|key| self.should_be_in_limbo(key))
            .cloned()
            .collect();

        let mut changes: Vec<LimboDocumentChange> = old_limbo
            .difference(&new_limbo)
            .cloned()
            .map(LimboDocumentChange::Removed)
            .collect();
        changes.extend(
            new_limbo
                .difference(&old_limbo)
                .cloned()
                .map(LimboDocumentChange::Added),
        );
        self.limbo_documents = new_limbo;
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_model::{Direction, ObjectValue, Operator, Value};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::parse(path).unwrap()
    }

    fn doc(path: &str, qty: i64, version: i64) -> Document {
        let data: ObjectValue = [("qty", Value::from(qty))].into_iter().collect();
        Document::new_found(key(path), SnapshotVersion::from_millis(version), data)
    }

    fn changes(docs: &[Document]) -> DocumentMap {
        docs.iter().map(|d| (d.key().clone(), d.clone())).collect()
    }

    fn ids(snapshot: &ViewSnapshot) -> Vec<String> {
        snapshot
            .documents
            .keys()
            .map(|k| k.document_id().to_string())
            .collect()
    }

    fn current_change(added: &[&str]) -> TargetChange {
        let mut change = TargetChange::empty(true, b"token".to_vec());
        for path in added {
            change.added_documents.insert(key(path));
        }
        change
    }

    #[test]
    fn added_documents_produce_snapshot() {
        let mut view = View::new(Query::collection("items"), DocumentKeySet::new());
        let computed = view.compute_doc_changes(
            &changes(&[doc("items/a", 1, 1), doc("items/b", 2, 1)]),
            None,
        );
        let snapshot = view.apply_changes(computed, true, None, false).snapshot.unwrap();

        assert_eq!(ids(&snapshot), vec!["a", "b"]);
        assert!(snapshot.from_cache);
        assert!(snapshot
            .changes
            .iter()
            .all(|change| change.kind == ChangeType::Added));
    }

    #[test]
    fn becoming_current_flips_sync_state() {
        let mut view = View::new(Query::collection("items"), DocumentKeySet::new());
        let computed = view.compute_doc_changes(&changes(&[doc("items/a", 1, 1)]), None);
        view.apply_changes(computed, true, None, false);

        let computed = view.compute_doc_changes(&DocumentMap::new(), None);
        let change = current_change(&["items/a"]);
        let snapshot = view
            .apply_changes(computed, true, Some(&change), false)
            .snapshot
            .unwrap();
        assert!(!snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
        assert!(snapshot.changes.is_empty());
        assert!(snapshot.has_cached_results);
    }

    #[test]
    fn unsynced_documents_go_to_limbo() {
        let mut view = View::new(Query::collection("items"), DocumentKeySet::new());
        let computed = view.compute_doc_changes(
            &changes(&[doc("items/a", 1, 1), doc("items/b", 1, 1)]),
            None,
        );
        let change = current_change(&["items/a"]);
        let result = view.apply_changes(computed, true, Some(&change), false);

        assert_eq!(
            result.limbo_changes,
            vec![LimboDocumentChange::Added(key("items/b"))]
        );
        assert!(result.snapshot.unwrap().from_cache);

        let mut change = TargetChange::empty(true, Vec::new());
        change.added_documents.insert(key("items/b"));
        let computed = view.compute_doc_changes(&DocumentMap::new(), None);
        let result = view.apply_changes(computed, true, Some(&change), false);
        assert_eq!(
            result.limbo_changes,
            vec![LimboDocumentChange::Removed(key("items/b"))]
        );
        assert!(!result.snapshot.unwrap().from_cache);
    }

    #[test]
    fn limit_query_requests_refill_when_edge_document_leaves() {
        let query = Query::collection("items")
            .where_field("qty", Operator::GreaterThan, 0)
            .order_by("qty", Direction::Descending)
            .limit_to_first(2);
        let mut view = View::new(query, DocumentKeySet::new());
        let computed = view.compute_doc_changes(
            &changes(&[doc("items/a", 1, 1), doc("items/b", 3, 1), doc("items/c", 2, 1)]),
            None,
        );
        assert!(!computed.needs_refill);
        let snapshot = view.apply_changes(computed, true, None, false).snapshot.unwrap();
        assert_eq!(ids(&snapshot), vec!["b", "c"]);

        let computed = view.compute_doc_changes(&changes(&[doc("items/b", 0, 2)]), None);
        assert!(computed.needs_refill);
    }

    #[test]
    fn metadata_changes_are_tracked_separately() {
        let mut view = View::new(Query::collection("items"), DocumentKeySet::new());
        let mut pending = doc("items/a", 1, 0);
        pending.set_has_local_mutations();
        let computed = view.compute_doc_changes(&changes(&[pending]), None);
        let snapshot = view.apply_changes(computed, true, None, false).snapshot.unwrap();
        assert!(snapshot.has_pending_writes());

        let computed = view.compute_doc_changes(&changes(&[doc("items/a", 1, 5)]), None);
        let snapshot = view.apply_changes(computed, true, None, false).snapshot.unwrap();
        assert_eq!(snapshot.changes.len(), 1);
        assert_eq!(snapshot.changes[0].kind, ChangeType::Metadata);
        assert!(!snapshot.has_pending_writes());
    }

    #[test]
    fn change_set_folds_successive_changes() {
        let mut set = DocumentChangeSet::default();
        let a = doc("items/a", 1, 1);
        set.track(DocumentViewChange {
            kind: ChangeType::Added,
            document: a.clone(),
        });
        set.track(DocumentViewChange {
            kind: ChangeType::Removed,
            document: a.clone(),
        });
        assert!(set.into_changes().is_empty());

        let mut set = DocumentChangeSet::default();
        set.track(DocumentViewChange {
            kind: ChangeType::Removed,
            document: a.clone(),
        });
        set.track(DocumentViewChange {
            kind: ChangeType::Added,
            document: a,
        });
        assert_eq!(set.into_changes()[0].kind, ChangeType::Modified);
    }

    #[test]
    fn going_offline_marks_view_from_cache() {
        let mut view = View::new(Query::collection("items"), DocumentKeySet::new());
        let computed = view.compute_doc_changes(&DocumentMap::new(), None);
        let change = current_change(&[]);
        view.apply_changes(computed, true, Some(&change), false);

        let snapshot = view
            .apply_online_state_change(OnlineState::Offline)
            .snapshot
            .unwrap();
        assert!(snapshot.from_cache);
        assert!(view.apply_online_state_change(OnlineState::Offline).snapshot.is_none());
    }
}
