//! The local view of documents: remote state with pending writes applied.

use crate::error::LocalResult;
use crate::mutation_queue::MutationQueue;
use crate::overlay_cache::{OverlayCache, OverlayMap};
use crate::remote_document_cache::{QueryContext, RemoteDocumentCache};
use docsync_model::{
    calculate_overlay_mutation, BatchId, Document, DocumentKey, DocumentKeySet, DocumentMap,
    FieldMask, Mutation, MutationBatch, MutationKind, Overlay, Query, SnapshotVersion, Timestamp,
    BATCH_ID_UNKNOWN,
};
use docsync_storage::Transaction;
use std::collections::BTreeMap;
use tracing::trace;

/// Combines the remote document cache, the mutation queue and the overlay
/// cache of one user.
#[derive(Debug, Clone)]
pub struct LocalDocumentsView {
    remote_documents: RemoteDocumentCache,
    mutation_queue: MutationQueue,
    overlay_cache: OverlayCache,
}

impl LocalDocumentsView {
    /// Creates a view over the given caches.
    #[must_use]
    pub fn new(
        remote_documents: RemoteDocumentCache,
        mutation_queue: MutationQueue,
        overlay_cache: OverlayCache,
    ) -> Self {
        Self {
            remote_documents,
            mutation_queue,
            overlay_cache,
        }
    }

    /// The local view of one document. Missing documents are invalid.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn get_document(&self, txn: &Transaction<'_>, key: &DocumentKey) -> LocalResult<Document> {
        let mut doc = self.remote_documents.get(txn, key)?;
        if let Some(overlay) = self.overlay_cache.get(txn, key)? {
            apply_overlay(&overlay, &mut doc);
        }
        Ok(doc)
    }

    /// The local view of several documents.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn get_documents(&self, txn: &mut Transaction<'_>, keys: &DocumentKeySet) -> LocalResult<DocumentMap> {
        let docs = self.remote_documents.get_all(txn, keys)?;
        self.get_local_view_of_documents(txn, docs, &DocumentKeySet::new())
    }

    /// Applies overlays to freshly read remote documents.
    ///
    /// Documents whose existence changed under a patch overlay (or that lack
    /// an overlay) have their overlays recomputed first, since a patch that
    /// was skipped against a missing document may now apply and vice versa.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn get_local_view_of_documents(
        &self,
        txn: &mut Transaction<'_>,
        mut docs: DocumentMap,
        existence_changed: &DocumentKeySet,
    ) -> LocalResult<DocumentMap> {
        let keys: DocumentKeySet = docs.keys().cloned().collect();
        let overlays = self.overlay_cache.get_many(txn, &keys)?;

        let mut recalculate = DocumentMap::new();
        for (key, doc) in &mut docs {
            let overlay = overlays.get(key);
            let is_patch = overlay.is_some_and(|o| matches!(o.mutation.kind, MutationKind::Patch { .. }));
            if existence_changed.contains(key) && (overlay.is_none() || is_patch) {
                recalculate.insert(key.clone(), doc.clone());
            } else if let Some(overlay) = overlay {
                apply_overlay(overlay, doc);
            }
        }

        if !recalculate.is_empty() {
            self.recalculate_and_save_overlays(txn, &mut recalculate)?;
            docs.extend(recalculate);
        }
        Ok(docs)
    }

    /// Recomputes and stores the overlays of `keys` from the mutation queue.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn recalculate_and_save_overlays_for_keys(
        &self,
        txn: &mut Transaction<'_>,
        keys: &DocumentKeySet,
    ) -> LocalResult<DocumentMap> {
        let mut docs = self.remote_documents.get_all(txn, keys)?;
        self.recalculate_and_save_overlays(txn, &mut docs)?;
        Ok(docs)
    }

    /// Recomputes the overlays of `docs`, which must hold remote state, and
    /// turns each of them into its local view.
    ///
    /// For each key the pending batches touching it are walked newest-first
    /// until one unconditionally overwrites the document; that suffix is
    /// replayed oldest-first while accumulating the touched field mask.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn recalculate_and_save_overlays(
        &self,
        txn: &mut Transaction<'_>,
        docs: &mut DocumentMap,
    ) -> LocalResult<()> {
        let keys: DocumentKeySet = docs.keys().cloned().collect();
        let batches = self.mutation_queue.batches_affecting(txn, &keys)?;

        let mut by_largest_batch: BTreeMap<BatchId, BTreeMap<DocumentKey, Option<Mutation>>> =
            BTreeMap::new();
        for (key, doc) in docs.iter_mut() {
            let relevant: Vec<&MutationBatch> = batches
                .iter()
                .filter(|batch| batch.mutations.iter().any(|m| &m.key == key))
                .collect();
            let start = relevant
                .iter()
                .rposition(|batch| {
                    batch
                        .mutations
                        .iter()
                        .any(|m| &m.key == key && m.is_unconditional_overwrite())
                })
                .unwrap_or(0);

            let mut mask = Some(FieldMask::default());
            for batch in &relevant[start..] {
                mask = batch.apply_to_local_view(doc, mask);
            }
            let largest_batch_id = relevant.last().map_or(BATCH_ID_UNKNOWN, |b| b.batch_id);
            let overlay = calculate_overlay_mutation(doc, mask.as_ref());
            trace!(%key, batches = relevant.len(), replayed = relevant.len() - start, "overlay recomputed");
            by_largest_batch
                .entry(largest_batch_id)
                .or_default()
                .insert(key.clone(), overlay);
        }

        for (largest_batch_id, overlays) in &by_largest_batch {
            self.overlay_cache.save_overlays(txn, *largest_batch_id, overlays)?;
        }
        Ok(())
    }

    /// Documents matching `query` in the local view.
    ///
    /// Remote documents read after `since` are combined with every
    /// overlay under the query's path, which includes pending creates the
    /// remote cache has never seen and pending deletes that must drop out.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn get_documents_matching_query(
        &self,
        txn: &Transaction<'_>,
        query: &Query,
        since: SnapshotVersion,
        context: Option<&mut QueryContext>,
    ) -> LocalResult<DocumentMap> {
        if query.is_document_query() {
            let key = DocumentKey::from_path(query.path().clone())?;
            let doc = self.get_document(txn, &key)?;
            let mut results = DocumentMap::new();
            if doc.is_found_document() {
                results.insert(key, doc);
            }
            return Ok(results);
        }

        let overlays = self.overlays_for_query(txn, query)?;
        let mutated_keys: DocumentKeySet = overlays.keys().cloned().collect();
        let mut docs = self
            .remote_documents
            .get_documents_matching_query(txn, query, since, &mutated_keys, context)?;
        self.apply_overlays(txn, query, &overlays, &mut docs)?;
        Ok(docs)
    }

    /// Documents with pending writes that match `query` in the local view.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn get_pending_documents_matching_query(
        &self,
        txn: &Transaction<'_>,
        query: &Query,
    ) -> LocalResult<DocumentMap> {
        let overlays = self.overlays_for_query(txn, query)?;
        let mut docs = DocumentMap::new();
        self.apply_overlays(txn, query, &overlays, &mut docs)?;
        Ok(docs)
    }

    fn overlays_for_query(&self, txn: &Transaction<'_>, query: &Query) -> LocalResult<OverlayMap> {
        match query.collection_group_id() {
            Some(group) => self
                .overlay_cache
                .overlays_for_collection_group(txn, group, BATCH_ID_UNKNOWN),
            None => self
                .overlay_cache
                .overlays_for_collection(txn, query.path(), BATCH_ID_UNKNOWN),
        }
    }

    /// Applies `overlays` on top of `docs`, reading the remote state of keys
    /// not yet present, and keeps what matches `query`.
    fn apply_overlays(
        &self,
        txn: &Transaction<'_>,
        query: &Query,
        overlays: &OverlayMap,
        docs: &mut DocumentMap,
    ) -> LocalResult<()> {
        for (key, overlay) in overlays {
            if !docs.contains_key(key) {
                let base = self.remote_documents.get(txn, key)?;
                docs.insert(key.clone(), base);
            }
            if let Some(doc) = docs.get_mut(key) {
                apply_overlay(overlay, doc);
            }
        }
        docs.retain(|_, doc| query.matches(doc));
        Ok(())
    }

    /// Local view of `keys`, keeping the documents that match `query`.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn get_documents_for_keys_matching_query(
        &self,
        txn: &Transaction<'_>,
        query: &Query,
        keys: &DocumentKeySet,
    ) -> LocalResult<DocumentMap> {
        let mut results = DocumentMap::new();
        for key in keys {
            let doc = self.get_document(txn, key)?;
            if query.matches(&doc) {
                results.insert(key.clone(), doc);
            }
        }
        Ok(results)
    }
}

fn apply_overlay(overlay: &Overlay, doc: &mut Document) {
    overlay.mutation.apply_to_local_view(doc, None, Timestamp::now());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index_manager::IndexManager;
    use docsync_model::{FieldPath, ObjectValue, Operator, Precondition, User, Value};
    use docsync_storage::Persistence;

    struct Fixture {
        persistence: Persistence,
        queue: MutationQueue,
        view: LocalDocumentsView,
        remote: RemoteDocumentCache,
    }

    fn fixture() -> Fixture {
        let user = User::unauthenticated();
        let remote = RemoteDocumentCache::new(IndexManager::new());
        let queue = MutationQueue::new(&user);
        Fixture {
            persistence: Persistence::open_in_memory().unwrap(),
            view: LocalDocumentsView::new(remote, queue.clone(), OverlayCache::new(&user)),
            queue,
            remote,
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::parse(path).unwrap()
    }

    fn data(field: &str, value: i64) -> ObjectValue {
        [(field, Value::from(value))].into_iter().collect()
    }

    fn write(f: &Fixture, mutations: Vec<Mutation>) -> DocumentMap {
        f.persistence
            .run_in_transaction("write", |txn| -> LocalResult<_> {
                let batch = f.queue.add_batch(txn, Timestamp::now(), mutations)?;
                f.view.recalculate_and_save_overlays_for_keys(txn, &batch.keys())
            })
            .unwrap()
    }

    #[test]
    fn later_batch_wins_on_same_field() {
        let f = fixture();
        write(&f, vec![Mutation::set(key("items/a"), data("x", 1))]);
        write(&f, vec![Mutation::update(key("items/a"), data("x", 2))]);
        let doc = f
            .persistence
            .run_in_transaction("read", |txn| f.view.get_document(txn, &key("items/a")))
            .unwrap();
        assert_eq!(doc.field(&FieldPath::new("x")), Some(&Value::from(2)));
        assert!(doc.has_local_mutations());
    }

    #[test]
    fn patch_on_missing_document_leaves_no_overlay() {
        let f = fixture();
        let docs = write(&f, vec![Mutation::update(key("items/a"), data("x", 1))]);
        assert!(!docs[&key("items/a")].is_valid_document());
    }

    #[test]
    fn overlay_is_a_minimal_patch_over_remote_state() {
        let f = fixture();
        f.persistence
            .run_in_transaction("seed", |txn| {
                let mut remote_data = data("x", 1);
                remote_data.set(&FieldPath::new("y"), Value::from(10));
                f.remote.add(
                    txn,
                    &Document::new_found(key("items/a"), SnapshotVersion::from_millis(1), remote_data),
                )
            })
            .unwrap();
        write(
            &f,
            vec![Mutation::patch(
                key("items/a"),
                data("x", 5),
                FieldMask::new([FieldPath::new("x")]),
                Precondition::Exists(true),
            )],
        );
        let overlay = f
            .persistence
            .run_in_transaction("read", |txn| f.view.overlay_cache.get(txn, &key("items/a")))
            .unwrap()
            .unwrap();
        match overlay.mutation.kind {
            MutationKind::Patch { mask, .. } => assert_eq!(mask.len(), 1),
            other => panic!("expected patch overlay, got {other:?}"),
        }
    }

    #[test]
    fn query_includes_pending_creates_and_drops_pending_deletes() {
        let f = fixture();
        f.persistence
            .run_in_transaction("seed", |txn| {
                f.remote.add(
                    txn,
                    &Document::new_found(key("items/a"), SnapshotVersion::from_millis(1), data("qty", 1)),
                )
            })
            .unwrap();
        write(
            &f,
            vec![
                Mutation::set(key("items/b"), data("qty", 2)),
                Mutation::delete(key("items/a")),
            ],
        );
        let query = Query::collection("items").where_field("qty", Operator::GreaterThan, 0);
        let docs = f
            .persistence
            .run_in_transaction("query", |txn| {
                f.view
                    .get_documents_matching_query(txn, &query, SnapshotVersion::MIN, None)
            })
            .unwrap();
        assert_eq!(docs.keys().collect::<Vec<_>>(), vec![&key("items/b")]);
    }
}
