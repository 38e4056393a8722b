//! Row key layouts shared by the local caches.

use docsync_model::{DocumentKey, ResourcePath};
use docsync_storage::KeyBuilder;

/// Appends a document key. The trailing empty segment keeps a document's
/// rows apart from those of documents in its subcollections.
pub(crate) fn document(builder: KeyBuilder, key: &DocumentKey) -> KeyBuilder {
    builder.segments(key.path().segments()).string("")
}

/// Appends a collection path as a prefix of all documents below it.
pub(crate) fn collection(builder: KeyBuilder, path: &ResourcePath) -> KeyBuilder {
    builder.segments(path.segments())
}

pub(crate) fn document_key(key: &DocumentKey) -> Vec<u8> {
    document(KeyBuilder::new(), key).build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_prefix_covers_its_documents() {
        let doc = document_key(&DocumentKey::parse("items/a").unwrap());
        let prefix = collection(KeyBuilder::new(), &ResourcePath::new("items")).build();
        let other = collection(KeyBuilder::new(), &ResourcePath::new("item")).build();
        assert!(doc.starts_with(&prefix));
        assert!(!doc.starts_with(&other));
    }

    #[test]
    fn document_rows_sort_before_subcollection_rows() {
        let parent = document_key(&DocumentKey::parse("items/a").unwrap());
        let child = document_key(&DocumentKey::parse("items/a/parts/x").unwrap());
        assert!(parent < child);
        assert!(!child.starts_with(&parent));
    }
}
