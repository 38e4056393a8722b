//! The last known server state of every cached document.

use crate::encoding;
use crate::error::LocalResult;
use crate::index_manager::IndexManager;
use docsync_model::{
    Document, DocumentKey, DocumentKeySet, DocumentMap, Query, ResourcePath, SnapshotVersion,
};
use docsync_storage::{KeyBuilder, Table, Transaction};

/// Counters collected while a query runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryContext {
    /// Number of remote documents decoded.
    pub documents_read_count: usize,
}

/// Versioned key to document map of server-confirmed state.
///
/// Documents never carry local mutations here; those live in overlays.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteDocumentCache {
    index_manager: IndexManager,
}

impl RemoteDocumentCache {
    /// Creates a cache that keeps `index_manager`'s entries current.
    #[must_use]
    pub fn new(index_manager: IndexManager) -> Self {
        Self { index_manager }
    }

    /// Stores `doc`, replacing any previous state of its key.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn add(&self, txn: &mut Transaction<'_>, doc: &Document) -> LocalResult<()> {
        txn.put_entity(Table::RemoteDocuments, encoding::document_key(doc.key()), doc)?;
        self.index_manager.update_index_entries(txn, doc)
    }

    /// Forgets `key` entirely.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn remove(&self, txn: &mut Transaction<'_>, key: &DocumentKey) -> LocalResult<()> {
        txn.delete(Table::RemoteDocuments, encoding::document_key(key));
        self.index_manager.remove_index_entries(txn, key)
    }

    /// Reads `key`, returning an invalid document if it is not cached.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn get(&self, txn: &Transaction<'_>, key: &DocumentKey) -> LocalResult<Document> {
        Ok(txn
            .get_entity(Table::RemoteDocuments, &encoding::document_key(key))?
            .unwrap_or_else(|| Document::new_invalid(key.clone())))
    }

    /// Reads every key, with invalid documents for the missing ones.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn get_all(&self, txn: &Transaction<'_>, keys: &DocumentKeySet) -> LocalResult<DocumentMap> {
        keys.iter()
            .map(|key| Ok((key.clone(), self.get(txn, key)?)))
            .collect()
    }

    /// Documents the query may return: those matching it whose read time is
    /// after `since`, plus every key in `mutated_keys` under the query's path.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn get_documents_matching_query(
        &self,
        txn: &Transaction<'_>,
        query: &Query,
        since: SnapshotVersion,
        mutated_keys: &DocumentKeySet,
        mut context: Option<&mut QueryContext>,
    ) -> LocalResult<DocumentMap> {
        let prefix = encoding::collection(KeyBuilder::new(), query.path()).build();
        let mut results = DocumentMap::new();
        for (_, doc) in txn.scan_prefix_entities::<Document>(Table::RemoteDocuments, &prefix)? {
            if let Some(context) = context.as_deref_mut() {
                context.documents_read_count += 1;
            }
            if !in_query_path(query, doc.key()) {
                continue;
            }
            if doc.read_time() <= since && !mutated_keys.contains(doc.key()) {
                continue;
            }
            if mutated_keys.contains(doc.key()) || query.matches(&doc) {
                results.insert(doc.key().clone(), doc);
            }
        }
        Ok(results)
    }

    /// Every cached document directly inside `collection`.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn get_collection(&self, txn: &Transaction<'_>, collection: &ResourcePath) -> LocalResult<Vec<Document>> {
        let prefix = encoding::collection(KeyBuilder::new(), collection).build();
        Ok(txn
            .scan_prefix_entities::<Document>(Table::RemoteDocuments, &prefix)?
            .into_iter()
            .map(|(_, doc)| doc)
            .filter(|doc| collection.is_immediate_parent_of(doc.key().path()))
            .collect())
    }

    /// Every cached document whose collection id is `collection_group`.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn get_collection_group(&self, txn: &Transaction<'_>, collection_group: &str) -> LocalResult<Vec<Document>> {
        Ok(txn
            .scan_prefix_entities::<Document>(Table::RemoteDocuments, &[])?
            .into_iter()
            .map(|(_, doc)| doc)
            .filter(|doc| doc.key().has_collection_id(collection_group))
            .collect())
    }
}

fn in_query_path(query: &Query, key: &DocumentKey) -> bool {
    match query.collection_group_id() {
        Some(group) => key.has_collection_id(group) && query.path().is_prefix_of(key.path()),
        None => query.path().is_immediate_parent_of(key.path()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_model::{ObjectValue, Operator, Value};
    use docsync_storage::Persistence;

    fn doc(path: &str, qty: i64, read_time: i64) -> Document {
        let data: ObjectValue = [("qty", Value::from(qty))].into_iter().collect();
        let mut doc = Document::new_found(
            DocumentKey::parse(path).unwrap(),
            SnapshotVersion::from_millis(read_time),
            data,
        );
        doc.set_read_time(SnapshotVersion::from_millis(read_time));
        doc
    }

    #[test]
    fn missing_documents_read_as_invalid() {
        let persistence = Persistence::open_in_memory().unwrap();
        let cache = RemoteDocumentCache::default();
        let doc = persistence
            .run_in_transaction("read", |txn| cache.get(txn, &DocumentKey::parse("items/a").unwrap()))
            .unwrap();
        assert!(!doc.is_valid_document());
    }

    #[test]
    fn query_scan_respects_path_and_read_time() {
        let persistence = Persistence::open_in_memory().unwrap();
        let cache = RemoteDocumentCache::default();
        let query = Query::collection("items").where_field("qty", Operator::GreaterThan, 0);
        let mut context = QueryContext::default();

        let results = persistence
            .run_in_transaction("scan", |txn| -> LocalResult<_> {
                cache.add(txn, &doc("items/a", 1, 1))?;
                cache.add(txn, &doc("items/b", 2, 5))?;
                cache.add(txn, &doc("items/c", 0, 5))?;
                cache.add(txn, &doc("items/b/parts/x", 9, 5))?;
                cache.add(txn, &doc("itemsx/z", 9, 5))?;
                cache.get_documents_matching_query(
                    txn,
                    &query,
                    SnapshotVersion::from_millis(2),
                    &DocumentKeySet::new(),
                    Some(&mut context),
                )
            })
            .unwrap();
        let ids: Vec<_> = results.keys().map(DocumentKey::document_id).collect();
        assert_eq!(ids, vec!["b"]);
        assert_eq!(context.documents_read_count, 4);
    }

    #[test]
    fn collection_group_scan() {
        let persistence = Persistence::open_in_memory().unwrap();
        let cache = RemoteDocumentCache::default();
        let docs = persistence
            .run_in_transaction("scan", |txn| -> LocalResult<_> {
                cache.add(txn, &doc("items/a/parts/x", 1, 1))?;
                cache.add(txn, &doc("items/b/parts/y", 1, 1))?;
                cache.add(txn, &doc("parts/z", 1, 1))?;
                cache.add(txn, &doc("items/c", 1, 1))?;
                cache.remove(txn, &DocumentKey::parse("parts/z").unwrap())?;
                cache.get_collection_group(txn, "parts")
            })
            .unwrap();
        assert_eq!(docs.len(), 2);
    }
}
