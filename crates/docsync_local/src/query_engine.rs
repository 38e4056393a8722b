//! Query execution against the local view.
//!
//! Three strategies are tried in order:
//!
//! 1. **Index**: a persistent field index narrows the candidate keys.
//! 2. **Previous results**: the keys the server last reported for the
//!    target plus every document changed since the last limbo-free snapshot.
//! 3. **Full scan** of the query's collection.
//!
//! Whatever the strategy, overlays are merged, documents are re-filtered,
//! sorted by the query's comparator and the limit is applied last. A full
//! scan that reads far more documents than it returns may create an index
//! for the query's shape; this only affects speed, never results.

use crate::error::LocalResult;
use crate::index_manager::{IndexManager, IndexType};
use crate::local_documents_view::LocalDocumentsView;
use crate::remote_document_cache::{QueryContext, RemoteDocumentCache};
use docsync_model::{
    Document, DocumentKeySet, DocumentSet, LimitType, Query, SnapshotVersion,
};
use docsync_storage::Transaction;
use std::sync::Arc;
use tracing::debug;

/// Tuning knobs for the query engine.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryEngineConfig {
    /// Whether full scans may create indexes.
    pub auto_index_enabled: bool,
    /// How many times more documents a scan must read than it returns
    /// before an index is considered worth it.
    pub relative_index_read_cost: f64,
    /// Scans reading fewer documents than this never create an index.
    pub min_collection_size_to_auto_create: usize,
}

impl Default for QueryEngineConfig {
    fn default() -> Self {
        Self {
            auto_index_enabled: true,
            relative_index_read_cost: 8.0,
            min_collection_size_to_auto_create: 100,
        }
    }
}

impl QueryEngineConfig {
    /// Enables or disables index auto-creation.
    #[must_use]
    pub fn with_auto_index(mut self, enabled: bool) -> Self {
        self.auto_index_enabled = enabled;
        self
    }

    /// Sets the scanned-to-returned ratio above which an index is created.
    #[must_use]
    pub fn with_relative_index_read_cost(mut self, ratio: f64) -> Self {
        self.relative_index_read_cost = ratio;
        self
    }

    /// Sets the minimum scanned count for index auto-creation.
    #[must_use]
    pub fn with_min_collection_size(mut self, size: usize) -> Self {
        self.min_collection_size_to_auto_create = size;
        self
    }
}

/// Which strategy produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStrategy {
    /// A persistent index.
    Index,
    /// Previous result keys plus recent changes.
    PreviousResults,
    /// A full collection scan.
    FullScan,
}

/// Runs queries against the local documents view.
#[derive(Debug, Clone)]
pub struct QueryEngine {
    config: QueryEngineConfig,
    local_documents: LocalDocumentsView,
    remote_documents: RemoteDocumentCache,
    index_manager: IndexManager,
}

impl QueryEngine {
    /// Creates a query engine.
    #[must_use]
    pub fn new(
        config: QueryEngineConfig,
        local_documents: LocalDocumentsView,
        remote_documents: RemoteDocumentCache,
        index_manager: IndexManager,
    ) -> Self {
        Self {
            config,
            local_documents,
            remote_documents,
            index_manager,
        }
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &QueryEngineConfig {
        &self.config
    }

    /// Runs `query`.
    ///
    /// `last_limbo_free_snapshot` and `remote_keys` describe the target's
    /// previous server result; pass [`SnapshotVersion::MIN`] and an empty
    /// set when there is none.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn run(
        &self,
        txn: &mut Transaction<'_>,
        query: &Query,
        last_limbo_free_snapshot: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> LocalResult<DocumentSet> {
        self.run_with_strategy(txn, query, last_limbo_free_snapshot, remote_keys)
            .map(|(documents, _)| documents)
    }

    /// Like [`QueryEngine::run`], also reporting which strategy answered.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn run_with_strategy(
        &self,
        txn: &mut Transaction<'_>,
        query: &Query,
        last_limbo_free_snapshot: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> LocalResult<(DocumentSet, QueryStrategy)> {
        if let Some(result) = self.perform_query_using_index(txn, query)? {
            return Ok((result, QueryStrategy::Index));
        }
        if let Some(result) =
            self.perform_query_using_remote_keys(txn, query, last_limbo_free_snapshot, remote_keys)?
        {
            return Ok((result, QueryStrategy::PreviousResults));
        }

        let mut context = QueryContext::default();
        let docs = self.local_documents.get_documents_matching_query(
            txn,
            query,
            SnapshotVersion::MIN,
            Some(&mut context),
        )?;
        let result = apply_limit(query, docs.into_values());
        if self.config.auto_index_enabled {
            self.create_cache_indexes(txn, query, &context, result.len())?;
        }
        Ok((result, QueryStrategy::FullScan))
    }

    fn perform_query_using_index(&self, txn: &Transaction<'_>, query: &Query) -> LocalResult<Option<DocumentSet>> {
        if query.matches_all_documents() || query.is_document_query() {
            return Ok(None);
        }
        let target = query.to_target();
        if self.index_manager.index_type(txn, &target)? == IndexType::None {
            return Ok(None);
        }
        let Some(keys) = self.index_manager.documents_matching_target(txn, &target)? else {
            return Ok(None);
        };
        // Index entries reflect remote state only; pending writes under the
        // query's path are merged in.
        let mut docs = self
            .local_documents
            .get_documents_for_keys_matching_query(txn, query, &keys)?;
        docs.extend(
            self.local_documents
                .get_pending_documents_matching_query(txn, query)?,
        );
        debug!(candidates = keys.len(), "query answered from index");
        Ok(Some(apply_limit(query, docs.into_values())))
    }

    fn perform_query_using_remote_keys(
        &self,
        txn: &Transaction<'_>,
        query: &Query,
        last_limbo_free_snapshot: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> LocalResult<Option<DocumentSet>> {
        if query.matches_all_documents() || last_limbo_free_snapshot.is_min() {
            return Ok(None);
        }
        let previous = self
            .local_documents
            .get_documents_for_keys_matching_query(txn, query, remote_keys)?;
        let previous_results = apply_limit(query, previous.values().cloned());

        if query.limit().is_some()
            && needs_refill(query, &previous_results, remote_keys, last_limbo_free_snapshot)
        {
            return Ok(None);
        }

        let mut docs = previous;
        let updated = self.local_documents.get_documents_matching_query(
            txn,
            query,
            last_limbo_free_snapshot,
            None,
        )?;
        docs.extend(updated);
        Ok(Some(apply_limit(query, docs.into_values())))
    }

    fn create_cache_indexes(
        &self,
        txn: &mut Transaction<'_>,
        query: &Query,
        context: &QueryContext,
        result_size: usize,
    ) -> LocalResult<()> {
        if context.documents_read_count < self.config.min_collection_size_to_auto_create {
            return Ok(());
        }
        let threshold = self.config.relative_index_read_cost * result_size as f64;
        if (context.documents_read_count as f64) <= threshold {
            return Ok(());
        }
        let target = query.to_target();
        let existing = match query.collection_group_id() {
            Some(group) => self.remote_documents.get_collection_group(txn, group)?,
            None => self.remote_documents.get_collection(txn, query.path())?,
        };
        if let Some(index) = self
            .index_manager
            .create_target_indexes(txn, &target, &existing)?
        {
            debug!(
                index_id = index.index_id,
                scanned = context.documents_read_count,
                returned = result_size,
                "auto-created index"
            );
        }
        Ok(())
    }
}

/// A limit query whose previous results may be missing documents that now
/// belong in the window must be recomputed from scratch.
fn needs_refill(
    query: &Query,
    previous_results: &DocumentSet,
    remote_keys: &DocumentKeySet,
    last_limbo_free_snapshot: SnapshotVersion,
) -> bool {
    if remote_keys.len() != previous_results.len() {
        return true;
    }
    let edge = match query.limit_type() {
        LimitType::First => previous_results.last(),
        LimitType::Last => previous_results.first(),
    };
    edge.is_some_and(|doc| {
        doc.has_pending_writes() || doc.version() > last_limbo_free_snapshot
    })
}

/// Sorts by the query's order and keeps the first or last `limit` documents.
/// The result is always in ascending query order.
pub(crate) fn apply_limit<I>(query: &Query, docs: I) -> DocumentSet
where
    I: IntoIterator<Item = Document>,
{
    let mut set = DocumentSet::new(Arc::new(query.comparator()));
    for doc in docs {
        if query.matches(&doc) {
            set.insert(doc);
        }
    }
    let Some(limit) = query.limit() else {
        return set;
    };
    let limit = limit as usize;
    while set.len() > limit {
        let edge = match query.limit_type() {
            LimitType::First => set.last(),
            LimitType::Last => set.first(),
        }
        .map(|doc| doc.key().clone());
        match edge {
            Some(key) => {
                set.remove(&key);
            }
            None => break,
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation_queue::MutationQueue;
    use crate::overlay_cache::OverlayCache;
    use docsync_model::{
        Direction, DocumentKey, Mutation, ObjectValue, Operator, Timestamp, User, Value,
    };
    use docsync_storage::Persistence;

    struct Fixture {
        persistence: Persistence,
        remote: RemoteDocumentCache,
        queue: MutationQueue,
        view: LocalDocumentsView,
    }

    fn fixture() -> Fixture {
        let user = User::unauthenticated();
        let remote = RemoteDocumentCache::new(IndexManager::new());
        let queue = MutationQueue::new(&user);
        Fixture {
            persistence: Persistence::open_in_memory().unwrap(),
            view: LocalDocumentsView::new(remote, queue.clone(), OverlayCache::new(&user)),
            remote,
            queue,
        }
    }

    fn engine(f: &Fixture, config: QueryEngineConfig) -> QueryEngine {
        QueryEngine::new(config, f.view.clone(), f.remote, IndexManager::new())
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::parse(path).unwrap()
    }

    fn qty(value: i64) -> ObjectValue {
        [("qty", Value::from(value))].into_iter().collect()
    }

    fn remote_doc(path: &str, value: i64, version: i64) -> Document {
        let mut doc = Document::new_found(key(path), SnapshotVersion::from_millis(version), qty(value));
        doc.set_read_time(SnapshotVersion::from_millis(version));
        doc
    }

    fn seed(f: &Fixture, docs: &[Document]) {
        f.persistence
            .run_in_transaction("seed", |txn| -> LocalResult<()> {
                for doc in docs {
                    f.remote.add(txn, doc)?;
                }
                Ok(())
            })
            .unwrap();
    }

    fn write(f: &Fixture, mutation: Mutation) {
        f.persistence
            .run_in_transaction("write", |txn| -> LocalResult<()> {
                let batch = f.queue.add_batch(txn, Timestamp::now(), vec![mutation])?;
                f.view.recalculate_and_save_overlays_for_keys(txn, &batch.keys())?;
                Ok(())
            })
            .unwrap();
    }

    fn run(f: &Fixture, engine: &QueryEngine, query: &Query) -> (Vec<String>, QueryStrategy) {
        let (docs, strategy) = f
            .persistence
            .run_in_transaction("query", |txn| {
                engine.run_with_strategy(txn, query, SnapshotVersion::MIN, &DocumentKeySet::new())
            })
            .unwrap();
        (docs.keys().map(|k| k.document_id().to_string()).collect(), strategy)
    }

    fn items_query() -> Query {
        Query::collection("items")
            .where_field("qty", Operator::GreaterThan, 0)
            .order_by("qty", Direction::Descending)
            .limit_to_first(2)
    }

    #[test]
    fn items_query_follows_local_writes() {
        let f = fixture();
        let engine = engine(&f, QueryEngineConfig::default().with_auto_index(false));
        seed(&f, &[remote_doc("items/a", 1, 1), remote_doc("items/b", 3, 1), remote_doc("items/c", 2, 1)]);

        assert_eq!(run(&f, &engine, &items_query()).0, vec!["b", "c"]);

        write(&f, Mutation::delete(key("items/a")));
        assert_eq!(run(&f, &engine, &items_query()).0, vec!["b", "c"]);

        write(&f, Mutation::update(key("items/b"), qty(0)));
        assert_eq!(run(&f, &engine, &items_query()).0, vec!["c"]);
    }

    #[test]
    fn limit_to_last_returns_tail_in_ascending_order() {
        let f = fixture();
        let engine = engine(&f, QueryEngineConfig::default().with_auto_index(false));
        seed(&f, &[remote_doc("items/a", 1, 1), remote_doc("items/b", 3, 1), remote_doc("items/c", 2, 1)]);
        let query = Query::collection("items")
            .order_by("qty", Direction::Ascending)
            .limit_to_last(2);
        assert_eq!(run(&f, &engine, &query).0, vec!["c", "b"]);
    }

    #[test]
    fn previous_results_are_merged_with_recent_changes() {
        let f = fixture();
        let engine = engine(&f, QueryEngineConfig::default().with_auto_index(false));
        seed(&f, &[remote_doc("items/a", 1, 1), remote_doc("items/b", 3, 1)]);
        // Changed after the limbo-free snapshot, so it is picked up even
        // though the previous result did not contain it.
        seed(&f, &[remote_doc("items/c", 2, 5)]);

        let query = Query::collection("items").where_field("qty", Operator::GreaterThan, 0);
        let remote_keys: DocumentKeySet = [key("items/a"), key("items/b")].into_iter().collect();
        let (docs, strategy) = f
            .persistence
            .run_in_transaction("query", |txn| {
                engine.run_with_strategy(txn, &query, SnapshotVersion::from_millis(2), &remote_keys)
            })
            .unwrap();
        assert_eq!(strategy, QueryStrategy::PreviousResults);
        assert_eq!(docs.len(), 3);
    }

    #[test]
    fn limit_query_with_stale_edge_falls_back_to_scan() {
        let f = fixture();
        let engine = engine(&f, QueryEngineConfig::default().with_auto_index(false));
        seed(&f, &[remote_doc("items/a", 1, 1), remote_doc("items/b", 3, 1), remote_doc("items/c", 2, 1)]);
        // b no longer matches locally, so the window may be missing a document.
        write(&f, Mutation::update(key("items/b"), qty(0)));

        let remote_keys: DocumentKeySet = [key("items/b"), key("items/c")].into_iter().collect();
        let (docs, strategy) = f
            .persistence
            .run_in_transaction("query", |txn| {
                engine.run_with_strategy(txn, &items_query(), SnapshotVersion::from_millis(1), &remote_keys)
            })
            .unwrap();
        assert_eq!(strategy, QueryStrategy::FullScan);
        let ids: Vec<_> = docs.keys().map(|k| k.document_id().to_string()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[test]
    fn sparse_full_scans_create_an_index() {
        let f = fixture();
        let config = QueryEngineConfig::default()
            .with_min_collection_size(10)
            .with_relative_index_read_cost(2.0);
        let engine = engine(&f, config);
        let docs: Vec<Document> = (0..20)
            .map(|i| remote_doc(&format!("items/d{i:02}"), i64::from(i == 7), 1))
            .collect();
        seed(&f, &docs);

        let query = Query::collection("items").where_field("qty", Operator::Equal, 1);
        let (first, strategy) = run(&f, &engine, &query);
        assert_eq!(strategy, QueryStrategy::FullScan);
        let (second, strategy) = run(&f, &engine, &query);
        assert_eq!(strategy, QueryStrategy::Index);
        assert_eq!(first, second);
        assert_eq!(second, vec!["d07"]);

        // Pending writes are visible through the index path too.
        write(&f, Mutation::set(key("items/new"), qty(1)));
        let (ids, strategy) = run(&f, &engine, &query);
        assert_eq!(strategy, QueryStrategy::Index);
        assert_eq!(ids, vec!["d07", "new"]);
    }
}
