//! Document keys and database identity.

use crate::error::{ModelError, ModelResult};
use crate::path::ResourcePath;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a document: a collection path plus a document id.
///
/// # Invariants
///
/// - The underlying path has an even, non-zero number of segments
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    /// Creates a key from a path, validating that it names a document.
    pub fn from_path(path: ResourcePath) -> ModelResult<Self> {
        if !Self::is_document_key(&path) {
            return Err(ModelError::invalid_path(
                path.canonical_string(),
                "document keys need an even, non-zero number of segments",
            ));
        }
        Ok(Self { path })
    }

    /// Parses a slash-separated key such as `items/a`.
    pub fn parse(path: &str) -> ModelResult<Self> {
        Self::from_path(ResourcePath::parse(path)?)
    }

    /// Returns true if `path` can be used as a document key.
    #[must_use]
    pub fn is_document_key(path: &ResourcePath) -> bool {
        !path.is_empty() && path.len() % 2 == 0
    }

    /// Returns the full path of this key.
    #[must_use]
    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    /// Returns the path of the collection containing this document.
    #[must_use]
    pub fn collection_path(&self) -> ResourcePath {
        self.path.pop_last()
    }

    /// Returns the id of the collection containing this document.
    #[must_use]
    pub fn collection_group(&self) -> &str {
        self.path.get(self.path.len() - 2).unwrap_or_default()
    }

    /// Returns the document id (last path segment).
    #[must_use]
    pub fn document_id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }

    /// Returns true if the immediate parent collection is named `collection_id`.
    #[must_use]
    pub fn has_collection_id(&self, collection_id: &str) -> bool {
        self.collection_group() == collection_id
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}

/// The project/database pair a client is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseId {
    /// Project identifier.
    pub project_id: String,
    /// Database identifier within the project.
    pub database_id: String,
}

impl DatabaseId {
    /// Name of the default database in a project.
    pub const DEFAULT_DATABASE: &'static str = "(default)";

    /// Creates a database id.
    pub fn new(project_id: impl Into<String>, database_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database_id: database_id.into(),
        }
    }

    /// Creates an id for the default database of `project_id`.
    pub fn for_project(project_id: impl Into<String>) -> Self {
        Self::new(project_id, Self::DEFAULT_DATABASE)
    }

    /// Returns the fully qualified resource name of a document.
    ///
    /// This is the string membership tests in existence filters hash.
    #[must_use]
    pub fn document_name(&self, key: &DocumentKey) -> String {
        format!(
            "projects/{}/databases/{}/documents/{}",
            self.project_id,
            self.database_id,
            key.path()
        )
    }
}

impl Default for DatabaseId {
    fn default() -> Self {
        Self::for_project("local")
    }
}
