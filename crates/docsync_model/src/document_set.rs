//! Documents kept in query order with keyed lookup.

use crate::document::Document;
use crate::key::DocumentKey;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Total order over documents, normally from [`crate::Query::comparator`].
pub type DocumentComparator = Arc<dyn Fn(&Document, &Document) -> Ordering + Send + Sync>;

/// A set of documents sorted by a comparator.
///
/// The comparator must break ties by key so that the order is total.
#[derive(Clone)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    by_key: HashMap<DocumentKey, Document>,
    sorted: Vec<Document>,
}

impl DocumentSet {
    /// Creates an empty set ordered by `comparator`.
    #[must_use]
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            comparator,
            by_key: HashMap::new(),
            sorted: Vec::new(),
        }
    }

    /// Returns an empty set with the same comparator.
    #[must_use]
    pub fn empty_like(&self) -> Self {
        Self::new(Arc::clone(&self.comparator))
    }

    /// The comparator.
    #[must_use]
    pub fn comparator(&self) -> &DocumentComparator {
        &self.comparator
    }

    /// Number of documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    /// Returns true if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    /// Returns true if `key` is present.
    #[must_use]
    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    /// Looks up a document by key.
    #[must_use]
    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.by_key.get(key)
    }

    /// First document in order.
    #[must_use]
    pub fn first(&self) -> Option<&Document> {
        self.sorted.first()
    }

    /// Last document in order.
    #[must_use]
    pub fn last(&self) -> Option<&Document> {
        self.sorted.last()
    }

    /// Position of `key` in order.
    #[must_use]
    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let doc = self.by_key.get(key)?;
        self.sorted
            .binary_search_by(|probe| (self.comparator)(probe, doc))
            .ok()
    }

    /// Inserts or replaces a document.
    pub fn insert(&mut self, doc: Document) {
        self.remove(doc.key());
        let position = self
            .sorted
            .binary_search_by(|probe| (self.comparator)(probe, &doc))
            .unwrap_or_else(|i| i);
        self.sorted.insert(position, doc.clone());
        self.by_key.insert(doc.key().clone(), doc);
    }

    /// Removes a document by key, returning it.
    pub fn remove(&mut self, key: &DocumentKey) -> Option<Document> {
        let position = self.index_of(key)?;
        self.by_key.remove(key);
        Some(self.sorted.remove(position))
    }

    /// Iterates documents in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Document> {
        self.sorted.iter()
    }

    /// Iterates keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.sorted.iter().map(Document::key)
    }

    /// Copies the documents out in order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Document> {
        self.sorted.clone()
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}

impl fmt::Debug for DocumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}

impl<'a> IntoIterator for &'a DocumentSet {
    type Item = &'a Document;
    type IntoIter = std::slice::Iter<'a, Document>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Direction, Query};
    use crate::{ObjectValue, SnapshotVersion, Value};

    fn doc(path: &str, qty: i64) -> Document {
        let data: ObjectValue = [("qty", Value::from(qty))].into_iter().collect();
        Document::new_found(DocumentKey::parse(path).unwrap(), SnapshotVersion::MIN, data)
    }

    #[test]
    fn keeps_query_order_through_updates() {
        let query = Query::collection("items").order_by("qty", Direction::Descending);
        let mut set = DocumentSet::new(Arc::new(query.comparator()));
        set.insert(doc("items/a", 1));
        set.insert(doc("items/b", 3));
        set.insert(doc("items/c", 2));
        let keys: Vec<_> = set.keys().map(|k| k.document_id().to_string()).collect();
        assert_eq!(keys, vec!["b", "c", "a"]);

        set.insert(doc("items/a", 5));
        assert_eq!(set.first().unwrap().key().document_id(), "a");
        assert_eq!(set.len(), 3);

        set.remove(&DocumentKey::parse("items/b").unwrap());
        assert_eq!(set.index_of(&DocumentKey::parse("items/c").unwrap()), Some(1));
    }
}
