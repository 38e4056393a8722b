//! Per-document net effect of pending writes.
//!
//! Rows live under two key spaces of the overlays table: `o` rows hold the
//! overlay of a document, `b` rows index documents by the largest batch id
//! folded into their overlay so an acknowledged or rejected batch can find
//! the overlays it contributed to.

use crate::encoding;
use crate::error::LocalResult;
use docsync_model::{
    BatchId, DocumentKey, DocumentKeySet, Mutation, Overlay, ResourcePath, User,
};
use docsync_storage::{KeyBuilder, Table, Transaction};
use std::collections::BTreeMap;

/// Overlays keyed by document.
pub type OverlayMap = BTreeMap<DocumentKey, Overlay>;

/// The overlay cache of one user.
#[derive(Debug, Clone)]
pub struct OverlayCache {
    uid: String,
}

impl OverlayCache {
    /// Opens the overlays of `user`.
    #[must_use]
    pub fn new(user: &User) -> Self {
        Self {
            uid: user.storage_key().to_string(),
        }
    }

    /// The overlay for `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn get(&self, txn: &Transaction<'_>, key: &DocumentKey) -> LocalResult<Option<Overlay>> {
        Ok(txn.get_entity(Table::Overlays, &self.overlay_key(key))?)
    }

    /// Overlays for every key that has one.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn get_many(&self, txn: &Transaction<'_>, keys: &DocumentKeySet) -> LocalResult<OverlayMap> {
        let mut overlays = OverlayMap::new();
        for key in keys {
            if let Some(overlay) = self.get(txn, key)? {
                overlays.insert(key.clone(), overlay);
            }
        }
        Ok(overlays)
    }

    /// Stores one overlay, replacing any previous one for its key.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn set(&self, txn: &mut Transaction<'_>, overlay: &Overlay) -> LocalResult<()> {
        self.remove(txn, overlay.key())?;
        txn.put_entity(Table::Overlays, self.overlay_key(overlay.key()), overlay)?;
        txn.put_entity(
            Table::Overlays,
            self.batch_index_key(overlay.largest_batch_id, overlay.key()),
            overlay.key(),
        )?;
        Ok(())
    }

    /// Stores the overlays computed for a batch. A `None` mutation removes
    /// the key's overlay.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn save_overlays(
        &self,
        txn: &mut Transaction<'_>,
        largest_batch_id: BatchId,
        overlays: &BTreeMap<DocumentKey, Option<Mutation>>,
    ) -> LocalResult<()> {
        for (key, mutation) in overlays {
            match mutation {
                Some(mutation) => self.set(
                    txn,
                    &Overlay {
                        largest_batch_id,
                        mutation: mutation.clone(),
                    },
                )?,
                None => self.remove(txn, key)?,
            }
        }
        Ok(())
    }

    /// Removes the overlay of `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn remove(&self, txn: &mut Transaction<'_>, key: &DocumentKey) -> LocalResult<()> {
        if let Some(existing) = self.get(txn, key)? {
            txn.delete(Table::Overlays, self.overlay_key(key));
            txn.delete(Table::Overlays, self.batch_index_key(existing.largest_batch_id, key));
        }
        Ok(())
    }

    /// Removes every overlay whose largest batch id is `batch_id`, returning
    /// their keys.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn remove_overlays_for_batch(
        &self,
        txn: &mut Transaction<'_>,
        batch_id: BatchId,
    ) -> LocalResult<DocumentKeySet> {
        let prefix = KeyBuilder::new().string("b").string(&self.uid).i32(batch_id).build();
        let keys: DocumentKeySet = txn
            .scan_prefix_entities::<DocumentKey>(Table::Overlays, &prefix)?
            .into_iter()
            .map(|(_, key)| key)
            .collect();
        for key in &keys {
            self.remove(txn, key)?;
        }
        Ok(keys)
    }

    /// Overlays of documents directly inside `collection` with a largest
    /// batch id above `since_batch_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn overlays_for_collection(
        &self,
        txn: &Transaction<'_>,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> LocalResult<OverlayMap> {
        let prefix = encoding::collection(self.overlay_builder(), collection).build();
        Ok(txn
            .scan_prefix_entities::<Overlay>(Table::Overlays, &prefix)?
            .into_iter()
            .map(|(_, overlay)| overlay)
            .filter(|overlay| {
                overlay.largest_batch_id > since_batch_id
                    && collection.is_immediate_parent_of(overlay.key().path())
            })
            .map(|overlay| (overlay.key().clone(), overlay))
            .collect())
    }

    /// Overlays of documents in any collection named `collection_group`
    /// with a largest batch id above `since_batch_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn overlays_for_collection_group(
        &self,
        txn: &Transaction<'_>,
        collection_group: &str,
        since_batch_id: BatchId,
    ) -> LocalResult<OverlayMap> {
        let prefix = self.overlay_builder().build();
        Ok(txn
            .scan_prefix_entities::<Overlay>(Table::Overlays, &prefix)?
            .into_iter()
            .map(|(_, overlay)| overlay)
            .filter(|overlay| {
                overlay.largest_batch_id > since_batch_id
                    && overlay.key().has_collection_id(collection_group)
            })
            .map(|overlay| (overlay.key().clone(), overlay))
            .collect())
    }

    fn overlay_builder(&self) -> KeyBuilder {
        KeyBuilder::new().string("o").string(&self.uid)
    }

    fn overlay_key(&self, key: &DocumentKey) -> Vec<u8> {
        encoding::document(self.overlay_builder(), key).build()
    }

    fn batch_index_key(&self, batch_id: BatchId, key: &DocumentKey) -> Vec<u8> {
        let builder = KeyBuilder::new().string("b").string(&self.uid).i32(batch_id);
        encoding::document(builder, key).build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_model::{ObjectValue, Value, BATCH_ID_UNKNOWN};
    use docsync_storage::Persistence;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::parse(path).unwrap()
    }

    fn set(path: &str) -> Mutation {
        let data: ObjectValue = [("v", Value::from(1))].into_iter().collect();
        Mutation::set(key(path), data)
    }

    #[test]
    fn save_replaces_and_batch_removal_finds_overlays() {
        let persistence = Persistence::open_in_memory().unwrap();
        let cache = OverlayCache::new(&User::unauthenticated());
        persistence
            .run_in_transaction("overlays", |txn| -> LocalResult<()> {
                let first: BTreeMap<_, _> = [
                    (key("items/a"), Some(set("items/a"))),
                    (key("items/b"), Some(set("items/b"))),
                ]
                .into_iter()
                .collect();
                cache.save_overlays(txn, 1, &first)?;
                let second: BTreeMap<_, _> = [(key("items/a"), Some(set("items/a")))].into_iter().collect();
                cache.save_overlays(txn, 2, &second)?;

                assert_eq!(cache.get(txn, &key("items/a"))?.unwrap().largest_batch_id, 2);
                let removed = cache.remove_overlays_for_batch(txn, 1)?;
                assert_eq!(removed.into_iter().collect::<Vec<_>>(), vec![key("items/b")]);
                assert!(cache.get(txn, &key("items/b"))?.is_none());
                assert!(cache.get(txn, &key("items/a"))?.is_some());

                let cleared: BTreeMap<_, _> = [(key("items/a"), None)].into_iter().collect();
                cache.save_overlays(txn, 3, &cleared)?;
                assert!(cache.get(txn, &key("items/a"))?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn collection_scans_filter_by_path_and_batch() {
        let persistence = Persistence::open_in_memory().unwrap();
        let cache = OverlayCache::new(&User::new("alice"));
        let other_user = OverlayCache::new(&User::new("bob"));
        persistence
            .run_in_transaction("overlays", |txn| -> LocalResult<()> {
                for (batch_id, path) in [(1, "items/a"), (2, "items/b"), (3, "items/b/parts/p")] {
                    let overlays: BTreeMap<_, _> = [(key(path), Some(set(path)))].into_iter().collect();
                    cache.save_overlays(txn, batch_id, &overlays)?;
                }
                let overlays: BTreeMap<_, _> = [(key("items/z"), Some(set("items/z")))].into_iter().collect();
                other_user.save_overlays(txn, 4, &overlays)?;

                let all = cache.overlays_for_collection(txn, &ResourcePath::new("items"), BATCH_ID_UNKNOWN)?;
                assert_eq!(all.len(), 2);
                let recent = cache.overlays_for_collection(txn, &ResourcePath::new("items"), 1)?;
                assert_eq!(recent.keys().collect::<Vec<_>>(), vec![&key("items/b")]);
                let group = cache.overlays_for_collection_group(txn, "parts", BATCH_ID_UNKNOWN)?;
                assert_eq!(group.len(), 1);
                Ok(())
            })
            .unwrap();
    }
}
