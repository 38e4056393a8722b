//! Test fixtures and store helpers.
//!
//! Documents are usually written as JSON literals; [`value_from_json`]
//! converts them into field values.

use docsync_local::{LocalStore, QueryEngineConfig};
use docsync_model::{Document, DocumentKey, ObjectValue, SnapshotVersion, User, Value};
use docsync_storage::{Persistence, PersistenceOptions};
use std::path::PathBuf;
use tempfile::TempDir;

/// Parses a document key, panicking on malformed paths.
pub fn key(path: &str) -> DocumentKey {
    DocumentKey::parse(path).expect("Invalid document key")
}

/// Snapshot version from milliseconds.
pub fn version(millis: i64) -> SnapshotVersion {
    SnapshotVersion::from_millis(millis)
}

/// Converts a JSON value into a field value.
///
/// Integral numbers become integers, other numbers doubles.
pub fn value_from_json(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Boolean(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Double(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Array(items) => {
            Value::Array(items.into_iter().map(value_from_json).collect())
        }
        serde_json::Value::Object(map) => Value::Map(object_from_map(map)),
    }
}

/// Converts a JSON object into document data.
///
/// # Panics
///
/// Panics if `json` is not an object.
pub fn object_from_json(json: serde_json::Value) -> ObjectValue {
    match json {
        serde_json::Value::Object(map) => object_from_map(map),
        other => panic!("Expected a JSON object, got {other}"),
    }
}

fn object_from_map(map: serde_json::Map<String, serde_json::Value>) -> ObjectValue {
    map.into_iter()
        .map(|(name, value)| (name, value_from_json(value)))
        .collect()
}

/// Document data with integer fields.
pub fn fields(entries: &[(&str, i64)]) -> ObjectValue {
    entries
        .iter()
        .map(|(name, value)| (*name, Value::from(*value)))
        .collect()
}

/// A found document at `version_millis`.
pub fn found_doc(path: &str, version_millis: i64, data: serde_json::Value) -> Document {
    Document::new_found(key(path), version(version_millis), object_from_json(data))
}

/// Opens a local store over in-memory persistence.
pub fn memory_store() -> LocalStore {
    memory_store_for(User::unauthenticated())
}

/// Opens a local store over in-memory persistence for `user`.
pub fn memory_store_for(user: User) -> LocalStore {
    LocalStore::new(
        Persistence::open_in_memory().expect("Failed to open in-memory persistence"),
        user,
        QueryEngineConfig::default(),
    )
    .expect("Failed to open local store")
}

/// A file-backed persistence directory that survives reopening.
pub struct TestPersistence {
    dir: TempDir,
}

impl TestPersistence {
    /// Creates an empty temporary directory.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Path of the persistence file.
    pub fn path(&self) -> PathBuf {
        self.dir.path().join("docsync.log")
    }

    /// Opens persistence on the file, creating it on first use.
    pub fn open(&self) -> Persistence {
        Persistence::open_file(&self.path(), PersistenceOptions::default())
            .expect("Failed to open file persistence")
    }

    /// Opens a local store on the file.
    pub fn open_store(&self, user: User) -> LocalStore {
        LocalStore::new(self.open(), user, QueryEngineConfig::default())
            .expect("Failed to open local store")
    }
}

impl Default for TestPersistence {
    fn default() -> Self {
        Self::new()
    }
}
