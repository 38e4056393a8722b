//! Persistent field indexes over the remote document cache.
//!
//! An index is defined per collection group over an ordered list of fields.
//! Every remote document of that group that has all of the fields gets one
//! entry holding the field values. Entries are rewritten inside the same
//! transaction that changes the document, so an index is always current
//! with the remote document cache and can be dropped and backfilled at any
//! time.

use crate::encoding;
use crate::error::LocalResult;
use docsync_model::{
    Document, DocumentKey, DocumentKeySet, FieldPath, Filter, ObjectValue, SnapshotVersion,
    Target, Value,
};
use docsync_storage::{KeyBuilder, Table, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

const NEXT_INDEX_ID_KEY: &[u8] = b"next_index_id";

/// A persisted index definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldIndex {
    /// Unique id.
    pub index_id: i32,
    /// Collection id the index covers.
    pub collection_group: String,
    /// Indexed fields, in order.
    pub fields: Vec<FieldPath>,
}

impl FieldIndex {
    fn covers(&self, field: &FieldPath) -> bool {
        field.is_key_field() || self.fields.contains(field)
    }
}

/// How well an index serves a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IndexType {
    /// No index applies.
    None,
    /// An index covers some filters; results need re-filtering.
    Partial,
    /// An index covers every filter and ordering field.
    Full,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    key: DocumentKey,
    values: Vec<Value>,
}

/// Maintains index definitions and entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexManager;

impl IndexManager {
    /// Creates an index manager.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Defines a new index and backfills it from `existing` documents.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn add_field_index<'d, I>(
        &self,
        txn: &mut Transaction<'_>,
        collection_group: &str,
        fields: Vec<FieldPath>,
        existing: I,
    ) -> LocalResult<FieldIndex>
    where
        I: IntoIterator<Item = &'d Document>,
    {
        let index_id: i32 = txn
            .get_entity(Table::Globals, NEXT_INDEX_ID_KEY)?
            .unwrap_or(1);
        txn.put_entity(Table::Globals, NEXT_INDEX_ID_KEY.to_vec(), &(index_id + 1))?;

        let index = FieldIndex {
            index_id,
            collection_group: collection_group.to_string(),
            fields,
        };
        txn.put_entity(Table::IndexConfiguration, config_key(collection_group, index_id), &index)?;

        let mut backfilled = 0usize;
        for doc in existing {
            if doc.key().has_collection_id(collection_group) && write_entry(txn, &index, doc)? {
                backfilled += 1;
            }
        }
        debug!(
            index_id,
            collection_group,
            fields = index.fields.len(),
            backfilled,
            "field index created"
        );
        Ok(index)
    }

    /// Removes an index and all of its entries.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn delete_field_index(&self, txn: &mut Transaction<'_>, index: &FieldIndex) -> LocalResult<()> {
        txn.delete(
            Table::IndexConfiguration,
            config_key(&index.collection_group, index.index_id),
        );
        txn.delete_prefix(Table::IndexEntries, &entry_prefix(index.index_id));
        Ok(())
    }

    /// Indexes defined for `collection_group`.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn field_indexes(
        &self,
        txn: &Transaction<'_>,
        collection_group: &str,
    ) -> LocalResult<Vec<FieldIndex>> {
        let prefix = KeyBuilder::new().string(collection_group).build();
        Ok(txn
            .scan_prefix_entities(Table::IndexConfiguration, &prefix)?
            .into_iter()
            .map(|(_, index)| index)
            .collect())
    }

    /// Every index definition.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn all_field_indexes(&self, txn: &Transaction<'_>) -> LocalResult<Vec<FieldIndex>> {
        Ok(txn
            .scan_prefix_entities(Table::IndexConfiguration, &[])?
            .into_iter()
            .map(|(_, index)| index)
            .collect())
    }

    /// Rewrites the entries for `doc` in every index of its group.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn update_index_entries(&self, txn: &mut Transaction<'_>, doc: &Document) -> LocalResult<()> {
        for index in self.field_indexes(txn, doc.key().collection_group())? {
            txn.delete(Table::IndexEntries, entry_key(index.index_id, doc.key()));
            write_entry(txn, &index, doc)?;
        }
        Ok(())
    }

    /// Drops the entries for `key` in every index of its group.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn remove_index_entries(&self, txn: &mut Transaction<'_>, key: &DocumentKey) -> LocalResult<()> {
        for index in self.field_indexes(txn, key.collection_group())? {
            txn.delete(Table::IndexEntries, entry_key(index.index_id, key));
        }
        Ok(())
    }

    /// Classifies how well the existing indexes serve `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn index_type(&self, txn: &Transaction<'_>, target: &Target) -> LocalResult<IndexType> {
        Ok(self
            .best_index(txn, target)?
            .map_or(IndexType::None, |(_, index_type)| index_type))
    }

    /// Keys of documents whose indexed values satisfy every filter of
    /// `target` the index can evaluate.
    ///
    /// Returns `None` if no index applies.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn documents_matching_target(
        &self,
        txn: &Transaction<'_>,
        target: &Target,
    ) -> LocalResult<Option<DocumentKeySet>> {
        let Some((index, _)) = self.best_index(txn, target)? else {
            return Ok(None);
        };
        let evaluable: Vec<&Filter> = target
            .filters
            .iter()
            .filter(|filter| filter.flattened().iter().all(|f| index.covers(&f.field)))
            .collect();

        let mut keys = DocumentKeySet::new();
        for (_, entry) in
            txn.scan_prefix_entities::<IndexEntry>(Table::IndexEntries, &entry_prefix(index.index_id))?
        {
            if !target_path_matches(target, &entry.key) {
                continue;
            }
            let probe = entry_document(&index, entry.key.clone(), entry.values);
            if evaluable.iter().all(|filter| filter.matches(&probe)) {
                keys.insert(entry.key);
            }
        }
        debug!(
            index_id = index.index_id,
            matched = keys.len(),
            "index lookup"
        );
        Ok(Some(keys))
    }

    /// Creates an index covering the filter and ordering fields of `target`
    /// unless one already does.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn create_target_indexes<'d, I>(
        &self,
        txn: &mut Transaction<'_>,
        target: &Target,
        existing: I,
    ) -> LocalResult<Option<FieldIndex>>
    where
        I: IntoIterator<Item = &'d Document>,
    {
        if self.index_type(txn, target)? == IndexType::Full {
            return Ok(None);
        }
        let Some(group) = collection_group_of(target) else {
            return Ok(None);
        };
        let fields = target_fields(target);
        if fields.is_empty() {
            return Ok(None);
        }
        self.add_field_index(txn, &group, fields, existing).map(Some)
    }

    fn best_index(
        &self,
        txn: &Transaction<'_>,
        target: &Target,
    ) -> LocalResult<Option<(FieldIndex, IndexType)>> {
        if target.is_document_target() {
            return Ok(None);
        }
        let Some(group) = collection_group_of(target) else {
            return Ok(None);
        };
        let filter_fields: BTreeSet<FieldPath> = target
            .filters
            .iter()
            .flat_map(Filter::flattened)
            .map(|f| f.field.clone())
            .collect();
        if filter_fields.is_empty() {
            return Ok(None);
        }

        let mut best: Option<(FieldIndex, IndexType)> = None;
        for index in self.field_indexes(txn, &group)? {
            let index_type = if target_fields(target).iter().all(|f| index.covers(f)) {
                IndexType::Full
            } else if filter_fields.iter().any(|f| index.covers(f)) {
                IndexType::Partial
            } else {
                IndexType::None
            };
            if index_type != IndexType::None
                && best.as_ref().map_or(true, |(_, current)| index_type > *current)
            {
                best = Some((index, index_type));
            }
        }
        Ok(best)
    }
}

fn config_key(collection_group: &str, index_id: i32) -> Vec<u8> {
    KeyBuilder::new().string(collection_group).i32(index_id).build()
}

fn entry_prefix(index_id: i32) -> Vec<u8> {
    KeyBuilder::new().i32(index_id).build()
}

fn entry_key(index_id: i32, key: &DocumentKey) -> Vec<u8> {
    encoding::document(KeyBuilder::new().i32(index_id), key).build()
}

fn write_entry(txn: &mut Transaction<'_>, index: &FieldIndex, doc: &Document) -> LocalResult<bool> {
    if !doc.is_found_document() {
        return Ok(false);
    }
    let values: Option<Vec<Value>> = index.fields.iter().map(|f| doc.field(f).cloned()).collect();
    let Some(values) = values else {
        return Ok(false);
    };
    let entry = IndexEntry {
        key: doc.key().clone(),
        values,
    };
    txn.put_entity(Table::IndexEntries, entry_key(index.index_id, doc.key()), &entry)?;
    Ok(true)
}

fn entry_document(index: &FieldIndex, key: DocumentKey, values: Vec<Value>) -> Document {
    let mut data = ObjectValue::new();
    for (field, value) in index.fields.iter().zip(values) {
        data.set(field, value);
    }
    Document::new_found(key, SnapshotVersion::MIN, data)
}

fn collection_group_of(target: &Target) -> Option<String> {
    target
        .collection_group
        .clone()
        .or_else(|| target.path.last_segment().map(str::to_string))
}

fn target_path_matches(target: &Target, key: &DocumentKey) -> bool {
    match &target.collection_group {
        Some(group) => key.has_collection_id(group) && target.path.is_prefix_of(key.path()),
        None => target.path.is_immediate_parent_of(key.path()),
    }
}

/// Filter fields followed by ordering fields, without duplicates or the key.
fn target_fields(target: &Target) -> Vec<FieldPath> {
    let mut fields: Vec<FieldPath> = Vec::new();
    let candidates = target
        .filters
        .iter()
        .flat_map(Filter::flattened)
        .map(|f| &f.field)
        .chain(target.order_by.iter().map(|o| &o.field));
    for field in candidates {
        if !field.is_key_field() && !fields.contains(field) {
            fields.push(field.clone());
        }
    }
    fields
}
