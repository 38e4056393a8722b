//! The local store: the one entry point the sync engine uses for local state.

use crate::error::{LocalError, LocalResult};
use crate::index_manager::IndexManager;
use crate::local_documents_view::LocalDocumentsView;
use crate::mutation_queue::MutationQueue;
use crate::overlay_cache::OverlayCache;
use crate::query_engine::{QueryEngine, QueryEngineConfig};
use crate::remote_document_cache::RemoteDocumentCache;
use crate::target_cache::TargetCache;
use docsync_model::{
    BatchId, Document, DocumentKey, DocumentKeySet, DocumentMap, DocumentSet, Mutation,
    MutationBatch, MutationBatchResult, Query, SnapshotVersion, Target, TargetData,
    TargetIdGenerator, TargetId, TargetPurpose, Timestamp, User,
};
use docsync_protocol::RemoteEvent;
use docsync_storage::{Persistence, StorageResult};
use std::collections::HashMap;
use tracing::{debug, info, trace};

/// Outcome of a local write.
#[derive(Debug, Clone)]
pub struct LocalWriteResult {
    /// Id assigned to the new batch.
    pub batch_id: BatchId,
    /// Local view of every document the batch touched.
    pub changes: DocumentMap,
}

/// Outcome of switching users.
#[derive(Debug, Clone)]
pub struct UserChangeResult {
    /// Local view of every document pending writes of either user touched.
    pub affected_documents: DocumentMap,
    /// Batches of the previous user.
    pub removed_batch_ids: Vec<BatchId>,
    /// Batches of the new user.
    pub added_batch_ids: Vec<BatchId>,
}

/// Outcome of running a query locally.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Matching documents in query order.
    pub documents: DocumentSet,
    /// Keys the server last reported for the query's target.
    pub remote_keys: DocumentKeySet,
}

/// What a view reported after applying changes for one target.
#[derive(Debug, Clone, Default)]
pub struct LocalViewChanges {
    /// The target of the view.
    pub target_id: TargetId,
    /// Whether the view snapshot was from cache.
    pub from_cache: bool,
    /// Keys that entered the view.
    pub added_keys: DocumentKeySet,
    /// Keys that left the view.
    pub removed_keys: DocumentKeySet,
}

/// Components that depend on the current user.
#[derive(Debug, Clone)]
struct UserComponents {
    mutation_queue: MutationQueue,
    overlay_cache: OverlayCache,
    local_documents: LocalDocumentsView,
    query_engine: QueryEngine,
}

impl UserComponents {
    fn new(
        user: &User,
        remote_documents: RemoteDocumentCache,
        index_manager: IndexManager,
        config: QueryEngineConfig,
    ) -> Self {
        let mutation_queue = MutationQueue::new(user);
        let overlay_cache = OverlayCache::new(user);
        let local_documents =
            LocalDocumentsView::new(remote_documents, mutation_queue.clone(), overlay_cache.clone());
        let query_engine =
            QueryEngine::new(config, local_documents.clone(), remote_documents, index_manager);
        Self {
            mutation_queue,
            overlay_cache,
            local_documents,
            query_engine,
        }
    }
}

/// Local documents, pending writes and target bookkeeping of one client.
///
/// Every method runs in one persistence transaction: either all of its
/// changes are committed or none are. Active targets are also kept in
/// memory so the sync engine can answer watch metadata questions without
/// touching storage.
///
/// # Example
///
/// ```rust
/// use docsync_local::{LocalStore, QueryEngineConfig};
/// use docsync_model::{DocumentKey, Mutation, ObjectValue, Timestamp, User, Value};
/// use docsync_storage::Persistence;
///
/// let persistence = Persistence::open_in_memory().unwrap();
/// let mut store = LocalStore::new(persistence, User::unauthenticated(), QueryEngineConfig::default()).unwrap();
///
/// let key = DocumentKey::parse("items/a").unwrap();
/// let data: ObjectValue = [("qty", Value::from(5))].into_iter().collect();
/// store.write_locally(vec![Mutation::set(key.clone(), data)], Timestamp::now()).unwrap();
///
/// let doc = store.read_document(&key).unwrap();
/// assert!(doc.has_local_mutations());
/// ```
pub struct LocalStore {
    persistence: Persistence,
    user: User,
    config: QueryEngineConfig,
    index_manager: IndexManager,
    remote_documents: RemoteDocumentCache,
    target_cache: TargetCache,
    components: UserComponents,
    target_data_by_target: HashMap<TargetId, TargetData>,
    target_id_by_target: HashMap<Target, TargetId>,
    target_id_generator: TargetIdGenerator,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("user", &self.user)
            .field("active_targets", &self.target_data_by_target.len())
            .finish()
    }
}

impl LocalStore {
    /// Opens the local store of `user` on top of `persistence`.
    ///
    /// # Errors
    ///
    /// Returns an error if the target bookkeeping cannot be read.
    pub fn new(persistence: Persistence, user: User, config: QueryEngineConfig) -> LocalResult<Self> {
        let index_manager = IndexManager::new();
        let remote_documents = RemoteDocumentCache::new(index_manager);
        let target_cache = TargetCache::new();
        let highest_target_id = persistence
            .run_in_transaction("start local store", |txn| target_cache.highest_target_id(txn))?;
        let components = UserComponents::new(&user, remote_documents, index_manager, config.clone());
        debug!(user = %user, highest_target_id, "local store started");
        Ok(Self {
            persistence,
            user,
            config,
            index_manager,
            remote_documents,
            target_cache,
            components,
            target_data_by_target: HashMap::new(),
            target_id_by_target: HashMap::new(),
            target_id_generator: TargetIdGenerator::for_target_cache(highest_target_id),
        })
    }

    /// The user whose writes are visible.
    #[must_use]
    pub fn user(&self) -> &User {
        &self.user
    }

    /// Switches to the mutation queue and overlays of `user`.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn handle_user_change(&mut self, user: User) -> LocalResult<UserChangeResult> {
        let old_queue = self.components.mutation_queue.clone();
        let old_batches = self
            .persistence
            .run_in_transaction("user change", |txn| old_queue.all_batches(txn))?;

        let components = UserComponents::new(
            &user,
            self.remote_documents,
            self.index_manager,
            self.config.clone(),
        );
        let (new_batches, affected_documents) =
            self.persistence
                .run_in_transaction("user change", |txn| -> LocalResult<_> {
                    let new_batches = components.mutation_queue.all_batches(txn)?;
                    let keys: DocumentKeySet = old_batches
                        .iter()
                        .chain(&new_batches)
                        .flat_map(MutationBatch::keys)
                        .collect();
                    let docs = components.local_documents.get_documents(txn, &keys)?;
                    Ok((new_batches, docs))
                })?;

        info!(from = %self.user, to = %user, "user changed");
        self.user = user;
        self.components = components;
        Ok(UserChangeResult {
            affected_documents,
            removed_batch_ids: old_batches.iter().map(|b| b.batch_id).collect(),
            added_batch_ids: new_batches.iter().map(|b| b.batch_id).collect(),
        })
    }

    /// Queues `mutations` as one batch and returns the new local view of
    /// the documents it touches.
    ///
    /// Nothing is visible unless the batch was committed.
    ///
    /// # Errors
    ///
    /// Returns [`LocalError::EmptyBatch`] for an empty write, or an error if
    /// persistence fails.
    pub fn write_locally(
        &self,
        mutations: Vec<Mutation>,
        local_write_time: Timestamp,
    ) -> LocalResult<LocalWriteResult> {
        let components = &self.components;
        let remote_documents = self.remote_documents;
        self.persistence
            .run_in_transaction("write locally", |txn| -> LocalResult<_> {
                let batch = components.mutation_queue.add_batch(txn, local_write_time, mutations)?;
                let mut changes = remote_documents.get_all(txn, &batch.keys())?;
                components
                    .local_documents
                    .recalculate_and_save_overlays(txn, &mut changes)?;
                debug!(batch_id = batch.batch_id, keys = changes.len(), "batch written locally");
                Ok(LocalWriteResult {
                    batch_id: batch.batch_id,
                    changes,
                })
            })
    }

    /// Folds an acknowledged batch into the remote documents and drops it
    /// from the queue. Returns the new local view of its documents.
    ///
    /// # Errors
    ///
    /// Returns [`LocalError::BatchNotFound`] if the batch is not pending, or
    /// an error if persistence fails.
    pub fn acknowledge_batch(&self, result: &MutationBatchResult) -> LocalResult<DocumentMap> {
        let components = &self.components;
        let remote_documents = self.remote_documents;
        self.persistence
            .run_in_transaction("acknowledge batch", |txn| -> LocalResult<_> {
                let batch = &result.batch;
                components
                    .mutation_queue
                    .acknowledge_batch(txn, batch.batch_id, result.stream_token.clone())?;

                let keys = batch.keys();
                for key in &keys {
                    let mut doc = remote_documents.get(txn, key)?;
                    let Some(ack_version) = result.doc_versions.get(key).copied() else {
                        continue;
                    };
                    if doc.version() < ack_version {
                        batch.apply_to_remote_document(&mut doc, result);
                        if doc.is_valid_document() {
                            doc.set_read_time(result.commit_version);
                            remote_documents.add(txn, &doc)?;
                        }
                    }
                }

                components.mutation_queue.remove_batch(txn, batch)?;
                components
                    .overlay_cache
                    .remove_overlays_for_batch(txn, batch.batch_id)?;
                let docs = components
                    .local_documents
                    .recalculate_and_save_overlays_for_keys(txn, &keys)?;
                debug!(batch_id = batch.batch_id, commit_version = %result.commit_version, "batch acknowledged");
                Ok(docs)
            })
    }

    /// Drops a batch the server refused and returns the reverted local view
    /// of its documents.
    ///
    /// # Errors
    ///
    /// Returns [`LocalError::BatchNotFound`] if the batch is not pending, or
    /// an error if persistence fails.
    pub fn reject_batch(&self, batch_id: BatchId) -> LocalResult<DocumentMap> {
        let components = &self.components;
        self.persistence
            .run_in_transaction("reject batch", |txn| -> LocalResult<_> {
                let batch = components
                    .mutation_queue
                    .lookup_batch(txn, batch_id)?
                    .ok_or(LocalError::BatchNotFound(batch_id))?;
                components.mutation_queue.remove_batch(txn, &batch)?;
                components
                    .overlay_cache
                    .remove_overlays_for_batch(txn, batch_id)?;
                let docs = components
                    .local_documents
                    .recalculate_and_save_overlays_for_keys(txn, &batch.keys())?;
                debug!(batch_id, "batch rejected");
                Ok(docs)
            })
    }

    /// The write stream token last stored for the current user.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn last_stream_token(&self) -> LocalResult<Vec<u8>> {
        let queue = &self.components.mutation_queue;
        self.persistence
            .run_in_transaction("get stream token", |txn| queue.last_stream_token(txn))
    }

    /// Stores a new write stream token.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn set_last_stream_token(&self, token: Vec<u8>) -> LocalResult<()> {
        let queue = &self.components.mutation_queue;
        self.persistence
            .run_in_transaction("set stream token", |txn| queue.set_last_stream_token(txn, token))
    }

    /// The first pending batch with an id above `after`.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn next_mutation_batch(&self, after: BatchId) -> LocalResult<Option<MutationBatch>> {
        let queue = &self.components.mutation_queue;
        self.persistence
            .run_in_transaction("next mutation batch", |txn| queue.next_batch_after(txn, after))
    }

    /// A pending batch by id.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn lookup_mutation_batch(&self, batch_id: BatchId) -> LocalResult<Option<MutationBatch>> {
        let queue = &self.components.mutation_queue;
        self.persistence
            .run_in_transaction("lookup mutation batch", |txn| queue.lookup_batch(txn, batch_id))
    }

    /// The highest pending batch id, or [`docsync_model::BATCH_ID_UNKNOWN`].
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn highest_unacknowledged_batch_id(&self) -> LocalResult<BatchId> {
        let queue = &self.components.mutation_queue;
        self.persistence
            .run_in_transaction("highest unacknowledged batch", |txn| {
                queue.highest_unacknowledged_batch_id(txn)
            })
    }

    /// Applies a consistent remote snapshot and returns the local view of
    /// every document that changed.
    ///
    /// Targets not allocated here are skipped. Remote documents are only
    /// replaced by newer versions, or by the same version when the cached
    /// copy still carries a committed but unconfirmed write.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails; nothing is applied then.
    pub fn apply_remote_event(&mut self, event: &RemoteEvent) -> LocalResult<DocumentMap> {
        let components = &self.components;
        let remote_documents = self.remote_documents;
        let target_cache = self.target_cache;
        let active_targets = &self.target_data_by_target;

        let (changes, updated_targets) =
            self.persistence
                .run_in_transaction("apply remote event", |txn| -> LocalResult<_> {
                    let mut updated_targets = Vec::new();
                    for (&target_id, change) in &event.target_changes {
                        let Some(old) = active_targets.get(&target_id) else {
                            trace!(target_id, "remote change for inactive target");
                            continue;
                        };
                        target_cache.remove_matching_keys(txn, &change.removed_documents, target_id)?;
                        target_cache.add_matching_keys(txn, &change.added_documents, target_id)?;

                        let updated = if event.target_mismatches.contains_key(&target_id) {
                            old.with_resume_token(Vec::new(), SnapshotVersion::MIN)
                                .with_last_limbo_free_snapshot_version(SnapshotVersion::MIN)
                        } else if !change.resume_token.is_empty() {
                            old.with_resume_token(change.resume_token.clone(), event.snapshot_version)
                        } else {
                            continue;
                        };
                        target_cache.update_target_data(txn, &updated)?;
                        updated_targets.push(updated);
                    }

                    let keys: DocumentKeySet = event.document_updates.keys().cloned().collect();
                    let existing = remote_documents.get_all(txn, &keys)?;
                    let mut changed = DocumentMap::new();
                    let mut existence_changed = DocumentKeySet::new();
                    for (key, doc) in &event.document_updates {
                        let cached = existing
                            .get(key)
                            .cloned()
                            .unwrap_or_else(|| Document::new_invalid(key.clone()));
                        if doc.is_found_document() != cached.is_found_document() {
                            existence_changed.insert(key.clone());
                        }
                        if doc.is_no_document() && doc.version().is_min() {
                            remote_documents.remove(txn, key)?;
                            changed.insert(key.clone(), doc.clone());
                        } else if !cached.is_valid_document()
                            || doc.version() > cached.version()
                            || (doc.version() == cached.version() && cached.has_pending_writes())
                        {
                            let mut doc = doc.clone();
                            if doc.read_time().is_min() {
                                doc.set_read_time(event.snapshot_version);
                            }
                            remote_documents.add(txn, &doc)?;
                            changed.insert(key.clone(), doc);
                        } else {
                            debug!(
                                key = %key,
                                cached = %cached.version(),
                                received = %doc.version(),
                                "ignoring outdated remote document"
                            );
                        }
                    }

                    if !event.snapshot_version.is_min() {
                        let last = target_cache.last_remote_snapshot_version(txn)?;
                        if event.snapshot_version > last {
                            target_cache.set_last_remote_snapshot_version(txn, event.snapshot_version)?;
                        }
                    }

                    let changes = components
                        .local_documents
                        .get_local_view_of_documents(txn, changed, &existence_changed)?;
                    Ok((changes, updated_targets))
                })?;

        for data in updated_targets {
            self.target_data_by_target.insert(data.target_id, data);
        }
        trace!(
            snapshot_version = %event.snapshot_version,
            documents = changes.len(),
            "remote event applied"
        );
        Ok(changes)
    }

    /// Records which views became consistent with the server.
    ///
    /// A view that is no longer from cache has no limbo documents, so its
    /// target's snapshot version becomes the new limbo-free version and
    /// later queries can start from its previous results.
    pub fn notify_local_view_changes(&mut self, changes: &[LocalViewChanges]) {
        for change in changes {
            if change.from_cache {
                continue;
            }
            if let Some(data) = self.target_data_by_target.get_mut(&change.target_id) {
                let version = data.snapshot_version;
                *data = data.with_last_limbo_free_snapshot_version(version);
            }
        }
    }

    /// Allocates a target for a regular listen, reusing the persisted one
    /// for an equal target.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn allocate_target(&mut self, target: Target) -> LocalResult<TargetData> {
        self.allocate_target_with_purpose(target, TargetPurpose::Listen)
    }

    /// Allocates a target with an explicit purpose.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn allocate_target_with_purpose(
        &mut self,
        target: Target,
        purpose: TargetPurpose,
    ) -> LocalResult<TargetData> {
        if let Some(data) = self
            .target_id_by_target
            .get(&target)
            .and_then(|id| self.target_data_by_target.get(id))
        {
            return Ok(data.clone());
        }

        let target_cache = self.target_cache;
        let existing = self
            .persistence
            .run_in_transaction("allocate target", |txn| target_cache.get_target_data(txn, &target))?;
        let data = match existing {
            Some(data) => data,
            None => {
                let data = TargetData::new(target.clone(), self.target_id_generator.next_id(), purpose);
                self.persistence
                    .run_in_transaction("allocate target", |txn| target_cache.add_target_data(txn, &data))?;
                data
            }
        };
        debug!(target_id = data.target_id, "target allocated");
        self.target_id_by_target.insert(target, data.target_id);
        self.target_data_by_target.insert(data.target_id, data.clone());
        Ok(data)
    }

    /// Target data of an active or persisted target.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn get_target_data(&self, target: &Target) -> LocalResult<Option<TargetData>> {
        if let Some(id) = self.target_id_by_target.get(target) {
            return Ok(self.target_data_by_target.get(id).cloned());
        }
        let target_cache = self.target_cache;
        self.persistence
            .run_in_transaction("get target data", |txn| target_cache.get_target_data(txn, target))
    }

    /// Target data of an active target.
    #[must_use]
    pub fn target_data_for_id(&self, target_id: TargetId) -> Option<&TargetData> {
        self.target_data_by_target.get(&target_id)
    }

    /// Releases an active target.
    ///
    /// Unless `keep_persisted_target_data` is set, the target and its
    /// document membership are deleted too; limbo resolution targets are
    /// always deleted.
    ///
    /// # Errors
    ///
    /// Returns [`LocalError::TargetNotFound`] if the target is not active, or
    /// an error if persistence fails.
    pub fn release_target(&mut self, target_id: TargetId, keep_persisted_target_data: bool) -> LocalResult<()> {
        let data = self
            .target_data_by_target
            .get(&target_id)
            .cloned()
            .ok_or(LocalError::TargetNotFound(target_id))?;

        let remove = !keep_persisted_target_data || data.purpose == TargetPurpose::LimboResolution;
        let target_cache = self.target_cache;
        self.persistence
            .run_in_transaction("release target", |txn| -> LocalResult<()> {
                if remove {
                    target_cache.remove_target_data(txn, &data)
                } else {
                    target_cache.update_target_data(txn, &data)
                }
            })?;

        self.target_data_by_target.remove(&target_id);
        self.target_id_by_target.remove(&data.target);
        debug!(target_id, removed = remove, "target released");
        Ok(())
    }

    /// Runs `query` against the local view.
    ///
    /// With `use_previous_results`, the query engine may start from the
    /// keys the server last reported for the query's target.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn execute_query(&self, query: &Query, use_previous_results: bool) -> LocalResult<QueryResult> {
        let target_data = self.get_target_data(&query.to_target())?;
        let target_cache = self.target_cache;
        let engine = &self.components.query_engine;
        self.persistence
            .run_in_transaction("execute query", |txn| -> LocalResult<_> {
                let (last_limbo_free, remote_keys) = match &target_data {
                    Some(data) => (
                        data.last_limbo_free_snapshot_version,
                        target_cache.get_matching_keys_for_target(txn, data.target_id)?,
                    ),
                    None => (SnapshotVersion::MIN, DocumentKeySet::new()),
                };
                let since = if use_previous_results {
                    last_limbo_free
                } else {
                    SnapshotVersion::MIN
                };
                let previous = if use_previous_results {
                    remote_keys.clone()
                } else {
                    DocumentKeySet::new()
                };
                let documents = engine.run(txn, query, since, &previous)?;
                Ok(QueryResult {
                    documents,
                    remote_keys,
                })
            })
    }

    /// The local view of one document.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn read_document(&self, key: &DocumentKey) -> LocalResult<Document> {
        let view = &self.components.local_documents;
        self.persistence
            .run_in_transaction("read document", |txn| view.get_document(txn, key))
    }

    /// Keys the server last reported for a target.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn remote_keys_for_target(&self, target_id: TargetId) -> LocalResult<DocumentKeySet> {
        let target_cache = self.target_cache;
        self.persistence
            .run_in_transaction("remote keys", |txn| {
                target_cache.get_matching_keys_for_target(txn, target_id)
            })
    }

    /// Version of the last remote event applied.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn last_remote_snapshot_version(&self) -> LocalResult<SnapshotVersion> {
        let target_cache = self.target_cache;
        self.persistence
            .run_in_transaction("last remote snapshot", |txn| {
                target_cache.last_remote_snapshot_version(txn)
            })
    }

    /// Rewrites the persistence log as one snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn compact(&self) -> StorageResult<()> {
        self.persistence.compact()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_model::{MutationResult, ObjectValue, Value};
    use docsync_protocol::TargetChange;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::parse(path).unwrap()
    }

    fn qty(n: i64) -> ObjectValue {
        [("qty", Value::from(n))].into_iter().collect()
    }

    fn store() -> LocalStore {
        LocalStore::new(
            Persistence::open_in_memory().unwrap(),
            User::unauthenticated(),
            QueryEngineConfig::default(),
        )
        .unwrap()
    }

    fn remote_event(version: i64, target_id: TargetId, docs: &[(&str, i64)]) -> RemoteEvent {
        let mut event = RemoteEvent::empty(SnapshotVersion::from_millis(version));
        let mut change = TargetChange::empty(true, format!("token-{version}").into_bytes());
        for (path, n) in docs {
            let doc = Document::new_found(key(path), SnapshotVersion::from_millis(version), qty(*n));
            change.added_documents.insert(key(path));
            event.document_updates.insert(key(path), doc);
        }
        event.target_changes.insert(target_id, change);
        event
    }

    #[test]
    fn targets_are_deduplicated_and_use_even_ids() {
        let mut store = store();
        let first = store.allocate_target(Query::collection("items").to_target()).unwrap();
        let again = store.allocate_target(Query::collection("items").to_target()).unwrap();
        let other = store.allocate_target(Query::collection("other").to_target()).unwrap();
        assert_eq!(first.target_id, again.target_id);
        assert_eq!(first.target_id % 2, 0);
        assert_ne!(first.target_id, other.target_id);
    }

    #[test]
    fn remote_event_updates_documents_and_resume_token() {
        let mut store = store();
        let data = store.allocate_target(Query::collection("items").to_target()).unwrap();
        let changes = store
            .apply_remote_event(&remote_event(10, data.target_id, &[("items/a", 1)]))
            .unwrap();
        assert!(changes[&key("items/a")].is_found_document());

        let updated = store.target_data_for_id(data.target_id).unwrap();
        assert_eq!(updated.resume_token, b"token-10".to_vec());
        assert_eq!(updated.snapshot_version, SnapshotVersion::from_millis(10));
        assert_eq!(store.remote_keys_for_target(data.target_id).unwrap().len(), 1);
        assert_eq!(
            store.last_remote_snapshot_version().unwrap(),
            SnapshotVersion::from_millis(10)
        );
    }

    #[test]
    fn outdated_remote_documents_are_ignored() {
        let mut store = store();
        let data = store.allocate_target(Query::collection("items").to_target()).unwrap();
        store
            .apply_remote_event(&remote_event(10, data.target_id, &[("items/a", 2)]))
            .unwrap();
        let changes = store
            .apply_remote_event(&remote_event(5, data.target_id, &[("items/a", 1)]))
            .unwrap();
        assert!(changes.is_empty());
        let doc = store.read_document(&key("items/a")).unwrap();
        assert_eq!(doc.field(&"qty".into()), Some(&Value::from(2)));
        assert_eq!(
            store.last_remote_snapshot_version().unwrap(),
            SnapshotVersion::from_millis(10)
        );
    }

    #[test]
    fn mismatch_clears_resume_token() {
        let mut store = store();
        let data = store.allocate_target(Query::collection("items").to_target()).unwrap();
        store
            .apply_remote_event(&remote_event(10, data.target_id, &[("items/a", 1)]))
            .unwrap();
        let mut event = RemoteEvent::empty(SnapshotVersion::from_millis(11));
        event
            .target_mismatches
            .insert(data.target_id, TargetPurpose::ExistenceFilterMismatch);
        event.target_changes.insert(data.target_id, TargetChange::default());
        store.apply_remote_event(&event).unwrap();

        let reset = store.target_data_for_id(data.target_id).unwrap();
        assert!(reset.resume_token.is_empty());
        assert!(reset.snapshot_version.is_min());
    }

    #[test]
    fn acknowledged_write_has_no_pending_writes() {
        let store = store();
        let write = store
            .write_locally(vec![Mutation::set(key("items/a"), qty(5))], Timestamp::now())
            .unwrap();
        assert!(write.changes[&key("items/a")].has_local_mutations());

        let batch = store.lookup_mutation_batch(write.batch_id).unwrap().unwrap();
        let result = MutationBatchResult::new(
            batch,
            SnapshotVersion::from_millis(20),
            vec![MutationResult::new(SnapshotVersion::from_millis(20))],
            b"ack".to_vec(),
        )
        .unwrap();
        let changes = store.acknowledge_batch(&result).unwrap();
        let doc = &changes[&key("items/a")];
        assert!(!doc.has_local_mutations());
        assert!(doc.has_committed_mutations());
        assert_eq!(doc.field(&"qty".into()), Some(&Value::from(5)));
        assert_eq!(store.last_stream_token().unwrap(), b"ack".to_vec());
        assert!(store.next_mutation_batch(BatchId::MIN).unwrap().is_none());
    }

    #[test]
    fn released_limbo_targets_are_deleted() {
        let mut store = store();
        let target = Target::for_document(&key("items/a"));
        let data = store
            .allocate_target_with_purpose(target.clone(), TargetPurpose::LimboResolution)
            .unwrap();
        store.release_target(data.target_id, true).unwrap();
        assert!(store.get_target_data(&target).unwrap().is_none());
        assert!(matches!(
            store.release_target(data.target_id, true),
            Err(LocalError::TargetNotFound(_))
        ));
    }
}
