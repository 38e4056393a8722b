//! Documents and their sync state.

use crate::key::DocumentKey;
use crate::path::FieldPath;
use crate::value::{ObjectValue, Value};
use crate::version::SnapshotVersion;
use serde::{Deserialize, Serialize};

/// What is known about a document's existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentType {
    /// Nothing is known; the document is a placeholder.
    Invalid,
    /// The document exists and has data.
    Found,
    /// The document is known not to exist at `version`.
    NoDocument,
    /// The document exists but its contents are not known.
    ///
    /// Produced when a patch is acknowledged for a document that was not in
    /// the cache.
    Unknown,
}

/// Whether a document reflects writes the server has not confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentState {
    /// Matches the server.
    Synced,
    /// Contains local writes not yet acknowledged.
    HasLocalMutations,
    /// Contains writes acknowledged but not yet seen on the watch stream.
    HasCommittedMutations,
}

/// A document as seen by the local cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    key: DocumentKey,
    document_type: DocumentType,
    version: SnapshotVersion,
    read_time: SnapshotVersion,
    data: ObjectValue,
    state: DocumentState,
}

impl Document {
    /// Creates a placeholder for a document nothing is known about.
    #[must_use]
    pub fn new_invalid(key: DocumentKey) -> Self {
        Self {
            key,
            document_type: DocumentType::Invalid,
            version: SnapshotVersion::MIN,
            read_time: SnapshotVersion::MIN,
            data: ObjectValue::new(),
            state: DocumentState::Synced,
        }
    }

    /// Creates an existing document.
    #[must_use]
    pub fn new_found(key: DocumentKey, version: SnapshotVersion, data: ObjectValue) -> Self {
        let mut doc = Self::new_invalid(key);
        doc.convert_to_found(version, data);
        doc
    }

    /// Creates a document known to be missing at `version`.
    #[must_use]
    pub fn new_no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut doc = Self::new_invalid(key);
        doc.convert_to_no_document(version);
        doc
    }

    /// Creates a document whose existence is known but contents are not.
    #[must_use]
    pub fn new_unknown(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut doc = Self::new_invalid(key);
        doc.convert_to_unknown(version);
        doc
    }

    /// Turns this document into an existing one with `data`.
    pub fn convert_to_found(&mut self, version: SnapshotVersion, data: ObjectValue) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::Found;
        self.data = data;
        self.state = DocumentState::Synced;
        self
    }

    /// Turns this document into a deleted one.
    pub fn convert_to_no_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::NoDocument;
        self.data = ObjectValue::new();
        self.state = DocumentState::Synced;
        self
    }

    /// Turns this document into one with unknown contents.
    pub fn convert_to_unknown(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::Unknown;
        self.data = ObjectValue::new();
        self.state = DocumentState::HasCommittedMutations;
        self
    }

    /// Marks the document as containing acknowledged writes.
    pub fn set_has_committed_mutations(&mut self) -> &mut Self {
        self.state = DocumentState::HasCommittedMutations;
        self
    }

    /// Marks the document as containing unacknowledged local writes.
    ///
    /// The version is reset because a locally modified document no longer
    /// corresponds to any server version.
    pub fn set_has_local_mutations(&mut self) -> &mut Self {
        self.state = DocumentState::HasLocalMutations;
        self.version = SnapshotVersion::MIN;
        self
    }

    /// Records the snapshot at which this document was read.
    pub fn set_read_time(&mut self, read_time: SnapshotVersion) -> &mut Self {
        self.read_time = read_time;
        self
    }

    /// The document key.
    #[must_use]
    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    /// The existence state.
    #[must_use]
    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    /// The server version of the document.
    #[must_use]
    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    /// The snapshot at which the document was last read from the server.
    #[must_use]
    pub fn read_time(&self) -> SnapshotVersion {
        self.read_time
    }

    /// The document contents.
    #[must_use]
    pub fn data(&self) -> &ObjectValue {
        &self.data
    }

    /// Returns the value of a field, if present.
    #[must_use]
    pub fn field(&self, path: &FieldPath) -> Option<&Value> {
        self.data.field(path)
    }

    /// The pending-write state.
    #[must_use]
    pub fn state(&self) -> DocumentState {
        self.state
    }

    /// Returns true if this is anything but a placeholder.
    #[must_use]
    pub fn is_valid_document(&self) -> bool {
        self.document_type != DocumentType::Invalid
    }

    /// Returns true if the document exists.
    #[must_use]
    pub fn is_found_document(&self) -> bool {
        self.document_type == DocumentType::Found
    }

    /// Returns true if the document is known to be missing.
    #[must_use]
    pub fn is_no_document(&self) -> bool {
        self.document_type == DocumentType::NoDocument
    }

    /// Returns true if the document's contents are unknown.
    #[must_use]
    pub fn is_unknown_document(&self) -> bool {
        self.document_type == DocumentType::Unknown
    }

    /// Returns true if the document has unacknowledged local writes.
    #[must_use]
    pub fn has_local_mutations(&self) -> bool {
        self.state == DocumentState::HasLocalMutations
    }

    /// Returns true if the document has acknowledged writes not yet seen on watch.
    #[must_use]
    pub fn has_committed_mutations(&self) -> bool {
        self.state == DocumentState::HasCommittedMutations
    }

    /// Returns true if either kind of pending write is present.
    #[must_use]
    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations() || self.has_committed_mutations()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DocumentKey {
        DocumentKey::parse("items/a").unwrap()
    }

    #[test]
    fn local_mutations_reset_version() {
        let mut doc = Document::new_found(key(), SnapshotVersion::from_millis(5), ObjectValue::new());
        doc.set_has_local_mutations();
        assert!(doc.has_local_mutations());
        assert!(doc.version().is_min());
        assert!(doc.has_pending_writes());
    }

    #[test]
    fn conversions_reset_state() {
        let mut doc = Document::new_invalid(key());
        assert!(!doc.is_valid_document());

        doc.convert_to_unknown(SnapshotVersion::from_millis(1));
        assert!(doc.is_unknown_document());
        assert!(doc.has_committed_mutations());

        doc.convert_to_no_document(SnapshotVersion::from_millis(2));
        assert!(doc.is_no_document());
        assert!(!doc.has_pending_writes());
    }
}
