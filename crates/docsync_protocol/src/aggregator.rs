//! Accumulation of listen stream messages into [`RemoteEvent`]s.
//!
//! Per target, the aggregator tracks pending add/remove requests, the
//! current flag, the latest resume token and the document changes seen since
//! the last snapshot. Nothing is emitted until the stream reports a global
//! snapshot boundary, at which point every pending change is flushed as one
//! consistent [`RemoteEvent`].

use crate::bloom_filter::BloomFilter;
use crate::remote_event::{RemoteEvent, TargetChange};
use crate::watch_change::{
    DocumentChange, DocumentDelete, DocumentRemove, ExistenceFilterChange, WatchTargetChange,
    WatchTargetChangeState,
};
use docsync_model::{
    DatabaseId, Document, DocumentKey, DocumentKeySet, DocumentMap, SnapshotVersion, TargetData,
    TargetId, TargetPurpose,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

/// Read access to what the local store knows about targets.
pub trait TargetMetadataProvider {
    /// Keys the local store currently associates with the target.
    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;

    /// Target data for an active target, or `None` if it is not listened to.
    fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

/// Outcome of checking an existence filter mismatch against a bloom filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BloomFilterApplication {
    /// Evicting the keys the filter rules out fixed the count.
    Success,
    /// No usable filter was supplied.
    Skipped,
    /// The count is still off after eviction; some absent keys passed the
    /// filter.
    FalsePositive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeType {
    Added,
    Removed,
    Modified,
}

#[derive(Debug)]
struct TargetState {
    pending_responses: i32,
    current: bool,
    resume_token: Vec<u8>,
    has_pending_changes: bool,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            pending_responses: 0,
            current: false,
            resume_token: Vec::new(),
            // A new target always produces a change so the view is created.
            has_pending_changes: true,
            document_changes: BTreeMap::new(),
        }
    }
}

impl TargetState {
    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, token: &[u8]) {
        if !token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange::empty(self.current, self.resume_token.clone());
        for (key, change_type) in &self.document_changes {
            let set = match change_type {
                ChangeType::Added => &mut change.added_documents,
                ChangeType::Modified => &mut change.modified_documents,
                ChangeType::Removed => &mut change.removed_documents,
            };
            set.insert(key.clone());
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Turns a stream of watch changes into consistent remote events.
#[derive(Debug)]
pub struct WatchChangeAggregator {
    database_id: DatabaseId,
    target_states: HashMap<TargetId, TargetState>,
    pending_document_updates: DocumentMap,
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    /// Creates an aggregator for documents of `database_id`.
    #[must_use]
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            database_id,
            target_states: HashMap::new(),
            pending_document_updates: DocumentMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
        }
    }

    /// Records that an add or remove request was sent for `target_id`.
    ///
    /// Changes for the target are ignored until every request has been
    /// answered.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id).pending_responses += 1;
    }

    /// Forgets a target entirely.
    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    /// Handles a document add/modify.
    pub fn handle_document_change(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        change: DocumentChange,
    ) {
        let key = change.document.key().clone();
        for target_id in change.updated_target_ids {
            if change.document.is_found_document() {
                self.add_document_to_target(provider, target_id, change.document.clone());
            } else if change.document.is_no_document() {
                self.remove_document_from_target(
                    provider,
                    target_id,
                    key.clone(),
                    Some(change.document.clone()),
                );
            }
        }
        for target_id in change.removed_target_ids {
            self.remove_document_from_target(
                provider,
                target_id,
                key.clone(),
                Some(change.document.clone()),
            );
        }
    }

    /// Handles a document deletion.
    pub fn handle_document_delete(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        change: DocumentDelete,
    ) {
        let deleted = Document::new_no_document(change.key.clone(), change.read_time);
        for target_id in change.removed_target_ids {
            self.remove_document_from_target(
                provider,
                target_id,
                change.key.clone(),
                Some(deleted.clone()),
            );
        }
    }

    /// Handles a document leaving targets without a new state.
    pub fn handle_document_remove(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        change: DocumentRemove,
    ) {
        for target_id in change.removed_target_ids {
            self.remove_document_from_target(provider, target_id, change.key.clone(), None);
        }
    }

    /// Handles a target state change.
    pub fn handle_target_change(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        change: &WatchTargetChange,
    ) {
        for target_id in self.target_ids_or_all(&change.target_ids) {
            match change.state {
                WatchTargetChangeState::NoChange => {
                    if self.is_active_target(provider, target_id) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Added => {
                    let state = self.ensure_target_state(target_id);
                    state.pending_responses -= 1;
                    if !state.is_pending() {
                        // A target re-added before its removal was acknowledged
                        // starts from a clean slate.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                WatchTargetChangeState::Removed => {
                    let state = self.ensure_target_state(target_id);
                    state.pending_responses -= 1;
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                }
                WatchTargetChangeState::Current => {
                    if self.is_active_target(provider, target_id) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Reset => {
                    if self.is_active_target(provider, target_id) {
                        self.reset_target(provider, target_id);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    /// Handles an existence filter, evicting or resetting on mismatch.
    ///
    /// Returns the bloom filter outcome when a mismatch was detected.
    pub fn handle_existence_filter(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        change: ExistenceFilterChange,
    ) -> Option<BloomFilterApplication> {
        let target_id = change.target_id;
        let expected_count = change.filter.count;
        let target_data = self.target_data_for_active_target(provider, target_id)?;

        if target_data.target.is_document_target() {
            if expected_count == 0 {
                // The single watched document does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    let deleted = Document::new_no_document(key.clone(), SnapshotVersion::MIN);
                    self.remove_document_from_target(provider, target_id, key, Some(deleted));
                }
            } else if expected_count != 1 {
                warn!(target_id, expected_count, "single document target with count above one");
            }
            return None;
        }

        let current_count = self.current_document_count_for_target(provider, target_id);
        if current_count == i64::from(expected_count) {
            return None;
        }

        let outcome = self.apply_bloom_filter(provider, &change, current_count);
        if outcome != BloomFilterApplication::Success {
            self.reset_target(provider, target_id);
            let purpose = if outcome == BloomFilterApplication::FalsePositive {
                TargetPurpose::ExistenceFilterMismatchBloom
            } else {
                TargetPurpose::ExistenceFilterMismatch
            };
            self.pending_target_resets.insert(target_id, purpose);
        }
        debug!(
            target_id,
            expected_count,
            current_count,
            ?outcome,
            "existence filter mismatch"
        );
        Some(outcome)
    }

    fn apply_bloom_filter(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        change: &ExistenceFilterChange,
        current_count: i64,
    ) -> BloomFilterApplication {
        let Some(params) = &change.filter.unchanged_names else {
            return BloomFilterApplication::Skipped;
        };
        let filter = match BloomFilter::from_params(params) {
            Ok(filter) => filter,
            Err(err) => {
                warn!(target_id = change.target_id, error = %err, "ignoring invalid bloom filter");
                return BloomFilterApplication::Skipped;
            }
        };
        if filter.bit_count() == 0 {
            return BloomFilterApplication::Skipped;
        }

        let removed = self.filter_removed_documents(provider, &filter, change.target_id);
        if i64::from(change.filter.count) == current_count - removed {
            BloomFilterApplication::Success
        } else {
            BloomFilterApplication::FalsePositive
        }
    }

    fn filter_removed_documents(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        filter: &BloomFilter,
        target_id: TargetId,
    ) -> i64 {
        let mut removed = 0;
        for key in provider.remote_keys_for_target(target_id) {
            let name = self.database_id.document_name(&key);
            if !filter.might_contain(&name) {
                self.remove_document_from_target(provider, target_id, key, None);
                removed += 1;
            }
        }
        removed
    }

    /// Flushes all pending changes into one event at `snapshot_version`.
    pub fn create_remote_event(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        snapshot_version: SnapshotVersion,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let mut target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        target_ids.sort_unstable();

        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(provider, target_id) else {
                continue;
            };
            let current = self
                .target_states
                .get(&target_id)
                .is_some_and(|state| state.current);

            if current && target_data.target.is_document_target() {
                // A current document target that never mentioned its document
                // proves the document does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    if !self.pending_document_updates.contains_key(&key)
                        && !provider.remote_keys_for_target(target_id).contains(&key)
                    {
                        let deleted = Document::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(provider, target_id, key, Some(deleted));
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = DocumentKeySet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo = targets.iter().all(|target_id| {
                self.target_data_for_active_target(provider, *target_id)
                    .map_or(true, |data| data.purpose == TargetPurpose::LimboResolution)
            });
            if only_limbo {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for doc in document_updates.values_mut() {
            doc.set_read_time(snapshot_version);
        }
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    fn add_document_to_target(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        target_id: TargetId,
        document: Document,
    ) {
        if !self.is_active_target(provider, target_id) {
            return;
        }
        let key = document.key().clone();
        let change_type = if provider.remote_keys_for_target(target_id).contains(&key) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_updates.insert(key.clone(), document);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    fn remove_document_from_target(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        target_id: TargetId,
        key: DocumentKey,
        updated_document: Option<Document>,
    ) {
        if !self.is_active_target(provider, target_id) {
            return;
        }
        let known = provider.remote_keys_for_target(target_id).contains(&key);
        let state = self.ensure_target_state(target_id);
        if known {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // The add was never committed; drop it.
            state.remove_document_change(&key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key, document);
        }
    }

    fn reset_target(&mut self, provider: &dyn TargetMetadataProvider, target_id: TargetId) {
        self.target_states.insert(target_id, TargetState::default());
        for key in provider.remote_keys_for_target(target_id) {
            self.remove_document_from_target(provider, target_id, key, None);
        }
    }

    fn current_document_count_for_target(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        target_id: TargetId,
    ) -> i64 {
        let change = self.ensure_target_state(target_id).to_target_change();
        provider.remote_keys_for_target(target_id).len() as i64
            + change.added_documents.len() as i64
            - change.removed_documents.len() as i64
    }

    fn target_ids_or_all(&self, target_ids: &[TargetId]) -> Vec<TargetId> {
        if target_ids.is_empty() {
            let mut all: Vec<TargetId> = self.target_states.keys().copied().collect();
            all.sort_unstable();
            all
        } else {
            target_ids.to_vec()
        }
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states.entry(target_id).or_default()
    }

    fn is_active_target(&self, provider: &dyn TargetMetadataProvider, target_id: TargetId) -> bool {
        self.target_data_for_active_target(provider, target_id)
            .is_some()
    }

    fn target_data_for_active_target(
        &self,
        provider: &dyn TargetMetadataProvider,
        target_id: TargetId,
    ) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => provider.target_data_for_target(target_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch_change::{BloomFilterParams, ExistenceFilter};
    use docsync_model::{ObjectValue, Query, Value};

    #[derive(Default)]
    struct Provider {
        targets: HashMap<TargetId, TargetData>,
        keys: HashMap<TargetId, DocumentKeySet>,
    }

    impl Provider {
        fn with_query_target(target_id: TargetId, keys: &[&str]) -> Self {
            let mut provider = Self::default();
            provider.add_target(target_id, Query::collection("items"), TargetPurpose::Listen);
            provider
                .keys
                .insert(target_id, keys.iter().map(|k| key(k)).collect());
            provider
        }

        fn add_target(&mut self, target_id: TargetId, query: Query, purpose: TargetPurpose) {
            self.targets
                .insert(target_id, TargetData::new(query.to_target(), target_id, purpose));
        }
    }

    impl TargetMetadataProvider for Provider {
        fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
            self.keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
            self.targets.get(&target_id).cloned()
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::parse(path).unwrap()
    }

    fn doc(path: &str, version: i64) -> Document {
        let data: ObjectValue = [("v", Value::from(version))].into_iter().collect();
        Document::new_found(key(path), SnapshotVersion::from_millis(version), data)
    }

    fn added(target_id: TargetId) -> WatchTargetChange {
        WatchTargetChange::new(WatchTargetChangeState::Added, vec![target_id])
    }

    fn change(document: Document, target_id: TargetId) -> DocumentChange {
        DocumentChange {
            document,
            updated_target_ids: vec![target_id],
            removed_target_ids: vec![],
        }
    }

    #[test]
    fn changes_wait_for_add_acknowledgement() {
        let provider = Provider::with_query_target(2, &[]);
        let mut aggregator = WatchChangeAggregator::new(DatabaseId::default());
        aggregator.record_pending_target_request(2);

        aggregator.handle_document_change(&provider, change(doc("items/a", 1), 2));
        let event = aggregator.create_remote_event(&provider, SnapshotVersion::from_millis(1));
        assert!(event.document_updates.is_empty());
        assert!(event.target_changes.is_empty());

        aggregator.handle_target_change(&provider, &added(2));
        aggregator.handle_document_change(&provider, change(doc("items/a", 1), 2));
        let event = aggregator.create_remote_event(&provider, SnapshotVersion::from_millis(2));
        assert_eq!(event.document_updates.len(), 1);
        assert!(event.target_changes[&2].added_documents.contains(&key("items/a")));
    }

    #[test]
    fn known_document_is_modified_and_removal_is_recorded() {
        let provider = Provider::with_query_target(2, &["items/a", "items/b"]);
        let mut aggregator = WatchChangeAggregator::new(DatabaseId::default());

        aggregator.handle_document_change(&provider, change(doc("items/a", 2), 2));
        aggregator.handle_document_remove(
            &provider,
            DocumentRemove {
                key: key("items/b"),
                removed_target_ids: vec![2],
            },
        );
        let event = aggregator.create_remote_event(&provider, SnapshotVersion::from_millis(2));
        let target_change = &event.target_changes[&2];
        assert!(target_change.modified_documents.contains(&key("items/a")));
        assert!(target_change.removed_documents.contains(&key("items/b")));
        assert!(!event.document_updates.contains_key(&key("items/b")));
    }

    #[test]
    fn current_and_resume_token_are_reported() {
        let provider = Provider::with_query_target(2, &[]);
        let mut aggregator = WatchChangeAggregator::new(DatabaseId::default());
        aggregator.handle_target_change(
            &provider,
            &WatchTargetChange::new(WatchTargetChangeState::Current, vec![2])
                .with_resume_token(b"token".to_vec()),
        );
        let event = aggregator.create_remote_event(&provider, SnapshotVersion::from_millis(3));
        assert!(event.target_changes[&2].current);
        assert_eq!(event.target_changes[&2].resume_token, b"token");

        let event = aggregator.create_remote_event(&provider, SnapshotVersion::from_millis(4));
        assert!(event.target_changes.is_empty());
    }

    #[test]
    fn bloom_filter_evicts_absent_member() {
        let database_id = DatabaseId::for_project("test");
        let provider = Provider::with_query_target(2, &["items/A", "items/B", "items/C"]);
        let names: Vec<String> = ["items/A", "items/C"]
            .iter()
            .map(|k| database_id.document_name(&key(k)))
            .collect();
        let filter = BloomFilter::with_values(4096, 10, names.iter().map(String::as_str)).unwrap();
        let mut aggregator = WatchChangeAggregator::new(database_id);

        let outcome = aggregator.handle_existence_filter(
            &provider,
            ExistenceFilterChange {
                target_id: 2,
                filter: ExistenceFilter {
                    count: 2,
                    unchanged_names: Some(filter.to_params()),
                },
            },
        );
        assert_eq!(outcome, Some(BloomFilterApplication::Success));

        let event = aggregator.create_remote_event(&provider, SnapshotVersion::from_millis(5));
        assert!(event.target_mismatches.is_empty());
        let removed = &event.target_changes[&2].removed_documents;
        assert_eq!(removed.iter().collect::<Vec<_>>(), vec![&key("items/B")]);
    }

    #[test]
    fn mismatch_without_filter_resets_target() {
        let provider = Provider::with_query_target(2, &["items/A", "items/B"]);
        let mut aggregator = WatchChangeAggregator::new(DatabaseId::default());
        let outcome = aggregator.handle_existence_filter(
            &provider,
            ExistenceFilterChange {
                target_id: 2,
                filter: ExistenceFilter {
                    count: 1,
                    unchanged_names: None,
                },
            },
        );
        assert_eq!(outcome, Some(BloomFilterApplication::Skipped));
        let event = aggregator.create_remote_event(&provider, SnapshotVersion::from_millis(5));
        assert_eq!(
            event.target_mismatches.get(&2),
            Some(&TargetPurpose::ExistenceFilterMismatch)
        );
        assert_eq!(event.target_changes[&2].removed_documents.len(), 2);
    }

    #[test]
    fn invalid_bloom_filter_falls_back_to_reset() {
        let provider = Provider::with_query_target(2, &["items/A"]);
        let mut aggregator = WatchChangeAggregator::new(DatabaseId::default());
        let outcome = aggregator.handle_existence_filter(
            &provider,
            ExistenceFilterChange {
                target_id: 2,
                filter: ExistenceFilter {
                    count: 0,
                    unchanged_names: Some(BloomFilterParams {
                        bitmap: vec![0xFF],
                        padding: 9,
                        hash_count: 1,
                    }),
                },
            },
        );
        assert_eq!(outcome, Some(BloomFilterApplication::Skipped));
    }

    #[test]
    fn matching_count_is_a_no_op() {
        let provider = Provider::with_query_target(2, &["items/A"]);
        let mut aggregator = WatchChangeAggregator::new(DatabaseId::default());
        let outcome = aggregator.handle_existence_filter(
            &provider,
            ExistenceFilterChange {
                target_id: 2,
                filter: ExistenceFilter {
                    count: 1,
                    unchanged_names: None,
                },
            },
        );
        assert_eq!(outcome, None);
    }

    #[test]
    fn current_document_target_without_document_synthesizes_delete() {
        let mut provider = Provider::default();
        provider.add_target(1, Query::document(&key("items/x")), TargetPurpose::LimboResolution);
        let mut aggregator = WatchChangeAggregator::new(DatabaseId::default());
        aggregator.handle_target_change(
            &provider,
            &WatchTargetChange::new(WatchTargetChangeState::Current, vec![1]),
        );
        let event = aggregator.create_remote_event(&provider, SnapshotVersion::from_millis(9));
        let deleted = &event.document_updates[&key("items/x")];
        assert!(deleted.is_no_document());
        assert!(event.resolved_limbo_documents.contains(&key("items/x")));
    }

    #[test]
    fn documents_in_listen_targets_are_not_limbo_resolved() {
        let provider = Provider::with_query_target(2, &[]);
        let mut aggregator = WatchChangeAggregator::new(DatabaseId::default());
        aggregator.handle_document_change(&provider, change(doc("items/a", 1), 2));
        let event = aggregator.create_remote_event(&provider, SnapshotVersion::from_millis(1));
        assert!(event.resolved_limbo_documents.is_empty());
        assert_eq!(
            event.document_updates[&key("items/a")].read_time(),
            SnapshotVersion::from_millis(1)
        );
    }

    #[test]
    fn removed_target_is_forgotten() {
        let provider = Provider::with_query_target(2, &[]);
        let mut aggregator = WatchChangeAggregator::new(DatabaseId::default());
        aggregator.record_pending_target_request(2);
        aggregator.handle_target_change(
            &provider,
            &WatchTargetChange::new(WatchTargetChangeState::Removed, vec![2]),
        );
        assert!(aggregator.target_states.is_empty());
    }
}
