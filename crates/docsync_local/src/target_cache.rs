//! Persisted targets and the document keys the server reported for them.

use crate::encoding;
use crate::error::LocalResult;
use docsync_model::{DocumentKey, DocumentKeySet, SnapshotVersion, Target, TargetData, TargetId};
use docsync_storage::{KeyBuilder, Table, Transaction};
use serde::{Deserialize, Serialize};

const TARGET_GLOBALS_KEY: &[u8] = b"target_globals";

/// Bookkeeping shared by all targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGlobals {
    /// Highest target id ever allocated.
    pub highest_target_id: TargetId,
    /// Version of the last remote event applied.
    pub last_remote_snapshot_version: SnapshotVersion,
    /// Number of persisted targets.
    pub target_count: u64,
}

/// Stores [`TargetData`] by id, with a secondary index by canonical id,
/// and the target to document membership in both directions.
#[derive(Debug, Clone, Copy, Default)]
pub struct TargetCache;

impl TargetCache {
    /// Creates a target cache.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Shared target bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn globals(&self, txn: &Transaction<'_>) -> LocalResult<TargetGlobals> {
        Ok(txn
            .get_entity(Table::Globals, TARGET_GLOBALS_KEY)?
            .unwrap_or_default())
    }

    fn put_globals(&self, txn: &mut Transaction<'_>, globals: &TargetGlobals) -> LocalResult<()> {
        txn.put_entity(Table::Globals, TARGET_GLOBALS_KEY.to_vec(), globals)?;
        Ok(())
    }

    /// Highest target id ever allocated.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn highest_target_id(&self, txn: &Transaction<'_>) -> LocalResult<TargetId> {
        Ok(self.globals(txn)?.highest_target_id)
    }

    /// Version of the last remote event applied.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn last_remote_snapshot_version(&self, txn: &Transaction<'_>) -> LocalResult<SnapshotVersion> {
        Ok(self.globals(txn)?.last_remote_snapshot_version)
    }

    /// Records the version of the last remote event applied.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn set_last_remote_snapshot_version(
        &self,
        txn: &mut Transaction<'_>,
        version: SnapshotVersion,
    ) -> LocalResult<()> {
        let mut globals = self.globals(txn)?;
        globals.last_remote_snapshot_version = version;
        self.put_globals(txn, &globals)
    }

    /// Number of persisted targets.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn target_count(&self, txn: &Transaction<'_>) -> LocalResult<u64> {
        Ok(self.globals(txn)?.target_count)
    }

    /// Persists a new target.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn add_target_data(&self, txn: &mut Transaction<'_>, data: &TargetData) -> LocalResult<()> {
        self.save_target_data(txn, data)?;
        let mut globals = self.globals(txn)?;
        globals.highest_target_id = globals.highest_target_id.max(data.target_id);
        globals.target_count += 1;
        self.put_globals(txn, &globals)
    }

    /// Replaces a persisted target.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn update_target_data(&self, txn: &mut Transaction<'_>, data: &TargetData) -> LocalResult<()> {
        self.save_target_data(txn, data)
    }

    /// Deletes a target and its document membership.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn remove_target_data(&self, txn: &mut Transaction<'_>, data: &TargetData) -> LocalResult<()> {
        if txn.get(Table::Targets, &target_key(data.target_id)).is_none() {
            return Ok(());
        }
        self.remove_matching_keys_for_target(txn, data.target_id)?;
        txn.delete(Table::Targets, target_key(data.target_id));
        txn.delete(
            Table::Targets,
            canonical_key(&data.target.canonical_id(), data.target_id),
        );
        let mut globals = self.globals(txn)?;
        globals.target_count = globals.target_count.saturating_sub(1);
        self.put_globals(txn, &globals)
    }

    /// Looks up a target by value.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn get_target_data(&self, txn: &Transaction<'_>, target: &Target) -> LocalResult<Option<TargetData>> {
        let prefix = KeyBuilder::new()
            .string("canonical")
            .string(&target.canonical_id())
            .build();
        for (_, target_id) in txn.scan_prefix_entities::<TargetId>(Table::Targets, &prefix)? {
            if let Some(data) = self.get_target_data_by_id(txn, target_id)? {
                if &data.target == target {
                    return Ok(Some(data));
                }
            }
        }
        Ok(None)
    }

    /// Looks up a target by id.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn get_target_data_by_id(&self, txn: &Transaction<'_>, target_id: TargetId) -> LocalResult<Option<TargetData>> {
        Ok(txn.get_entity(Table::Targets, &target_key(target_id))?)
    }

    /// Records that the server reported `keys` as members of `target_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn add_matching_keys(
        &self,
        txn: &mut Transaction<'_>,
        keys: &DocumentKeySet,
        target_id: TargetId,
    ) -> LocalResult<()> {
        for key in keys {
            txn.put_entity(Table::TargetDocuments, target_document_key(target_id, key), key)?;
            txn.put(Table::TargetDocuments, document_target_key(key, target_id), Vec::new());
        }
        Ok(())
    }

    /// Records that `keys` left `target_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn remove_matching_keys(
        &self,
        txn: &mut Transaction<'_>,
        keys: &DocumentKeySet,
        target_id: TargetId,
    ) -> LocalResult<()> {
        for key in keys {
            txn.delete(Table::TargetDocuments, target_document_key(target_id, key));
            txn.delete(Table::TargetDocuments, document_target_key(key, target_id));
        }
        Ok(())
    }

    /// Drops every member of `target_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn remove_matching_keys_for_target(&self, txn: &mut Transaction<'_>, target_id: TargetId) -> LocalResult<()> {
        let keys = self.get_matching_keys_for_target(txn, target_id)?;
        self.remove_matching_keys(txn, &keys, target_id)
    }

    /// Members of `target_id` as last reported by the server.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn get_matching_keys_for_target(
        &self,
        txn: &Transaction<'_>,
        target_id: TargetId,
    ) -> LocalResult<DocumentKeySet> {
        let prefix = KeyBuilder::new().string("t").i32(target_id).build();
        Ok(txn
            .scan_prefix_entities::<DocumentKey>(Table::TargetDocuments, &prefix)?
            .into_iter()
            .map(|(_, key)| key)
            .collect())
    }

    /// Returns true if any target contains `key`.
    #[must_use]
    pub fn contains_key(&self, txn: &Transaction<'_>, key: &DocumentKey) -> bool {
        let prefix = encoding::document(KeyBuilder::new().string("d"), key).build();
        !txn.scan_prefix(Table::TargetDocuments, &prefix).is_empty()
    }

    fn save_target_data(&self, txn: &mut Transaction<'_>, data: &TargetData) -> LocalResult<()> {
        txn.put_entity(Table::Targets, target_key(data.target_id), data)?;
        txn.put_entity(
            Table::Targets,
            canonical_key(&data.target.canonical_id(), data.target_id),
            &data.target_id,
        )?;
        Ok(())
    }
}

fn target_key(target_id: TargetId) -> Vec<u8> {
    KeyBuilder::new().string("id").i32(target_id).build()
}

fn canonical_key(canonical_id: &str, target_id: TargetId) -> Vec<u8> {
    KeyBuilder::new()
        .string("canonical")
        .string(canonical_id)
        .i32(target_id)
        .build()
}

fn target_document_key(target_id: TargetId, key: &DocumentKey) -> Vec<u8> {
    encoding::document(KeyBuilder::new().string("t").i32(target_id), key).build()
}

fn document_target_key(key: &DocumentKey, target_id: TargetId) -> Vec<u8> {
    encoding::document(KeyBuilder::new().string("d"), key)
        .i32(target_id)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_model::{Query, TargetPurpose};
    use docsync_storage::Persistence;

    fn keys(paths: &[&str]) -> DocumentKeySet {
        paths.iter().map(|p| DocumentKey::parse(p).unwrap()).collect()
    }

    #[test]
    fn targets_are_found_by_value_and_id() {
        let persistence = Persistence::open_in_memory().unwrap();
        let cache = TargetCache::new();
        let target = Query::collection("items").to_target();
        let data = TargetData::new(target.clone(), 2, TargetPurpose::Listen);
        persistence
            .run_in_transaction("targets", |txn| -> LocalResult<()> {
                cache.add_target_data(txn, &data)?;
                assert_eq!(cache.get_target_data(txn, &target)?, Some(data.clone()));
                assert_eq!(cache.get_target_data_by_id(txn, 2)?, Some(data.clone()));
                assert_eq!(cache.highest_target_id(txn)?, 2);
                assert_eq!(cache.target_count(txn)?, 1);

                let other = Query::collection("other").to_target();
                assert_eq!(cache.get_target_data(txn, &other)?, None);

                cache.remove_target_data(txn, &data)?;
                assert_eq!(cache.get_target_data(txn, &target)?, None);
                assert_eq!(cache.target_count(txn)?, 0);
                assert_eq!(cache.highest_target_id(txn)?, 2);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn matching_keys_are_tracked_both_ways() {
        let persistence = Persistence::open_in_memory().unwrap();
        let cache = TargetCache::new();
        persistence
            .run_in_transaction("keys", |txn| -> LocalResult<()> {
                cache.add_matching_keys(txn, &keys(&["items/a", "items/b"]), 2)?;
                cache.add_matching_keys(txn, &keys(&["items/a"]), 4)?;
                assert_eq!(cache.get_matching_keys_for_target(txn, 2)?.len(), 2);

                cache.remove_matching_keys(txn, &keys(&["items/a"]), 2)?;
                assert!(cache.contains_key(txn, &DocumentKey::parse("items/a").unwrap()));
                cache.remove_matching_keys_for_target(txn, 4)?;
                assert!(!cache.contains_key(txn, &DocumentKey::parse("items/a").unwrap()));
                assert_eq!(
                    cache.get_matching_keys_for_target(txn, 2)?,
                    keys(&["items/b"])
                );
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn last_remote_snapshot_version_survives_reads() {
        let persistence = Persistence::open_in_memory().unwrap();
        let cache = TargetCache::new();
        persistence
            .run_in_transaction("globals", |txn| {
                cache.set_last_remote_snapshot_version(txn, SnapshotVersion::from_millis(9))
            })
            .unwrap();
        let version = persistence
            .run_in_transaction("globals", |txn| cache.last_remote_snapshot_version(txn))
            .unwrap();
        assert_eq!(version, SnapshotVersion::from_millis(9));
    }
}
