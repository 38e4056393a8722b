//! Durable, ordered queue of unacknowledged mutation batches.
//!
//! Batches are stored per user, keyed by batch id so a prefix scan returns
//! them in id order. A second table maps `(user, document, batch id)` so that
//! finding the batches touching a set of keys costs time proportional to
//! those batches rather than to the whole queue.
//!
//! Batch ids come from a counter shared by all users and persisted with the
//! batch, so an id is never handed out twice, even across restarts.

use crate::encoding;
use crate::error::{LocalError, LocalResult};
use docsync_model::{
    BatchId, DocumentKey, DocumentKeySet, Mutation, MutationBatch, Query, Timestamp, User,
    BATCH_ID_UNKNOWN,
};
use docsync_storage::{KeyBuilder, Table, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

const NEXT_BATCH_ID_KEY: &[u8] = b"next_batch_id";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueMetadata {
    last_acknowledged_batch_id: BatchId,
    last_stream_token: Vec<u8>,
}

/// The mutation queue of one user.
#[derive(Debug, Clone)]
pub struct MutationQueue {
    uid: String,
}

impl MutationQueue {
    /// Opens the queue of `user`.
    #[must_use]
    pub fn new(user: &User) -> Self {
        Self {
            uid: user.storage_key().to_string(),
        }
    }

    /// Persists a new batch and returns it with its assigned id.
    ///
    /// # Errors
    ///
    /// Returns [`LocalError::EmptyBatch`] if `mutations` is empty, or an
    /// error if persistence fails.
    pub fn add_batch(
        &self,
        txn: &mut Transaction<'_>,
        local_write_time: Timestamp,
        mutations: Vec<Mutation>,
    ) -> LocalResult<MutationBatch> {
        if mutations.is_empty() {
            return Err(LocalError::EmptyBatch);
        }
        let batch_id: BatchId = txn.get_entity(Table::Globals, NEXT_BATCH_ID_KEY)?.unwrap_or(1);
        txn.put_entity(Table::Globals, NEXT_BATCH_ID_KEY.to_vec(), &(batch_id + 1))?;

        let batch = MutationBatch::new(batch_id, local_write_time, mutations);
        txn.put_entity(Table::Mutations, self.batch_key(batch_id), &batch)?;
        for key in batch.keys() {
            txn.put_entity(Table::DocumentMutations, self.document_mutation_key(&key, batch_id), &key)?;
        }
        debug!(batch_id, mutations = batch.mutations.len(), uid = %self.uid, "batch queued");
        Ok(batch)
    }

    /// Looks up a pending batch.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn lookup_batch(&self, txn: &Transaction<'_>, batch_id: BatchId) -> LocalResult<Option<MutationBatch>> {
        Ok(txn.get_entity(Table::Mutations, &self.batch_key(batch_id))?)
    }

    /// The first pending batch with an id above `batch_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn next_batch_after(&self, txn: &Transaction<'_>, batch_id: BatchId) -> LocalResult<Option<MutationBatch>> {
        Ok(self
            .all_batches(txn)?
            .into_iter()
            .find(|batch| batch.batch_id > batch_id))
    }

    /// Every pending batch in id order.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn all_batches(&self, txn: &Transaction<'_>) -> LocalResult<Vec<MutationBatch>> {
        Ok(txn
            .scan_prefix_entities(Table::Mutations, &self.user_prefix())?
            .into_iter()
            .map(|(_, batch)| batch)
            .collect())
    }

    /// Pending batches that write any of `keys`, in id order.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn batches_affecting(&self, txn: &Transaction<'_>, keys: &DocumentKeySet) -> LocalResult<Vec<MutationBatch>> {
        let mut batch_ids = BTreeSet::new();
        for key in keys {
            let prefix = encoding::document(self.user_builder(), key).build();
            for (row, _) in txn.scan_prefix(Table::DocumentMutations, &prefix) {
                if let Some(batch_id) = trailing_batch_id(&row) {
                    batch_ids.insert(batch_id);
                }
            }
        }
        self.load_batches(txn, batch_ids)
    }

    /// Pending batches that write a document the query could match, in id
    /// order.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn batches_affecting_query(&self, txn: &Transaction<'_>, query: &Query) -> LocalResult<Vec<MutationBatch>> {
        let prefix = encoding::collection(self.user_builder(), query.path()).build();
        let mut batch_ids = BTreeSet::new();
        for (row, key) in txn.scan_prefix_entities::<DocumentKey>(Table::DocumentMutations, &prefix)? {
            let in_path = match query.collection_group_id() {
                Some(group) => key.has_collection_id(group),
                None => query.path().is_immediate_parent_of(key.path()),
            };
            if in_path {
                if let Some(batch_id) = trailing_batch_id(&row) {
                    batch_ids.insert(batch_id);
                }
            }
        }
        self.load_batches(txn, batch_ids)
    }

    /// Deletes a batch and its per-document index rows.
    ///
    /// # Errors
    ///
    /// Returns [`LocalError::BatchNotFound`] if the batch is not pending, or
    /// an error if persistence fails.
    pub fn remove_batch(&self, txn: &mut Transaction<'_>, batch: &MutationBatch) -> LocalResult<()> {
        let key = self.batch_key(batch.batch_id);
        if txn.get(Table::Mutations, &key).is_none() {
            return Err(LocalError::BatchNotFound(batch.batch_id));
        }
        txn.delete(Table::Mutations, key);
        for doc_key in batch.keys() {
            txn.delete(
                Table::DocumentMutations,
                self.document_mutation_key(&doc_key, batch.batch_id),
            );
        }
        debug!(batch_id = batch.batch_id, uid = %self.uid, "batch removed");
        Ok(())
    }

    /// Records that `batch_id` was acknowledged along with the stream token
    /// that came with it.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn acknowledge_batch(
        &self,
        txn: &mut Transaction<'_>,
        batch_id: BatchId,
        stream_token: Vec<u8>,
    ) -> LocalResult<()> {
        let mut metadata = self.metadata(txn)?;
        metadata.last_acknowledged_batch_id = metadata.last_acknowledged_batch_id.max(batch_id);
        metadata.last_stream_token = stream_token;
        self.put_metadata(txn, &metadata)
    }

    /// The highest acknowledged batch id, or [`BATCH_ID_UNKNOWN`].
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn highest_acknowledged_batch_id(&self, txn: &Transaction<'_>) -> LocalResult<BatchId> {
        Ok(self.metadata(txn)?.last_acknowledged_batch_id)
    }

    /// The highest pending batch id, or [`BATCH_ID_UNKNOWN`].
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn highest_unacknowledged_batch_id(&self, txn: &Transaction<'_>) -> LocalResult<BatchId> {
        Ok(self
            .all_batches(txn)?
            .last()
            .map_or(BATCH_ID_UNKNOWN, |batch| batch.batch_id))
    }

    /// The write stream token last received for this user.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn last_stream_token(&self, txn: &Transaction<'_>) -> LocalResult<Vec<u8>> {
        Ok(self.metadata(txn)?.last_stream_token)
    }

    /// Replaces the stored write stream token.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn set_last_stream_token(&self, txn: &mut Transaction<'_>, token: Vec<u8>) -> LocalResult<()> {
        let mut metadata = self.metadata(txn)?;
        metadata.last_stream_token = token;
        self.put_metadata(txn, &metadata)
    }

    /// Returns true if no batch is pending.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn is_empty(&self, txn: &Transaction<'_>) -> LocalResult<bool> {
        Ok(txn.scan_prefix(Table::Mutations, &self.user_prefix()).is_empty())
    }

    fn load_batches(&self, txn: &Transaction<'_>, batch_ids: BTreeSet<BatchId>) -> LocalResult<Vec<MutationBatch>> {
        let mut batches = Vec::with_capacity(batch_ids.len());
        for batch_id in batch_ids {
            match self.lookup_batch(txn, batch_id)? {
                Some(batch) => batches.push(batch),
                None => return Err(LocalError::BatchNotFound(batch_id)),
            }
        }
        Ok(batches)
    }

    fn metadata(&self, txn: &Transaction<'_>) -> LocalResult<QueueMetadata> {
        Ok(txn
            .get_entity(Table::MutationQueues, &self.user_prefix())?
            .unwrap_or(QueueMetadata {
                last_acknowledged_batch_id: BATCH_ID_UNKNOWN,
                last_stream_token: Vec::new(),
            }))
    }

    fn put_metadata(&self, txn: &mut Transaction<'_>, metadata: &QueueMetadata) -> LocalResult<()> {
        txn.put_entity(Table::MutationQueues, self.user_prefix(), metadata)?;
        Ok(())
    }

    fn user_builder(&self) -> KeyBuilder {
        KeyBuilder::new().string(&self.uid)
    }

    fn user_prefix(&self) -> Vec<u8> {
        self.user_builder().build()
    }

    fn batch_key(&self, batch_id: BatchId) -> Vec<u8> {
        self.user_builder().i32(batch_id).build()
    }

    fn document_mutation_key(&self, key: &DocumentKey, batch_id: BatchId) -> Vec<u8> {
        encoding::document(self.user_builder(), key).i32(batch_id).build()
    }
}

fn trailing_batch_id(row: &[u8]) -> Option<BatchId> {
    let bytes: [u8; 4] = row.get(row.len().checked_sub(4)?..)?.try_into().ok()?;
    Some((u32::from_be_bytes(bytes) ^ 0x8000_0000) as BatchId)
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_model::{ObjectValue, Value};
    use docsync_storage::Persistence;

    fn set(path: &str, value: i64) -> Mutation {
        let data: ObjectValue = [("v", Value::from(value))].into_iter().collect();
        Mutation::set(DocumentKey::parse(path).unwrap(), data)
    }

    fn keys(paths: &[&str]) -> DocumentKeySet {
        paths.iter().map(|p| DocumentKey::parse(p).unwrap()).collect()
    }

    #[test]
    fn batch_ids_increase_and_are_not_reused() {
        let persistence = Persistence::open_in_memory().unwrap();
        let queue = MutationQueue::new(&User::unauthenticated());
        persistence
            .run_in_transaction("queue", |txn| -> LocalResult<()> {
                let first = queue.add_batch(txn, Timestamp::now(), vec![set("items/a", 1)])?;
                let second = queue.add_batch(txn, Timestamp::now(), vec![set("items/b", 1)])?;
                assert_eq!(first.batch_id, 1);
                assert_eq!(second.batch_id, 2);

                queue.remove_batch(txn, &second)?;
                let third = queue.add_batch(txn, Timestamp::now(), vec![set("items/c", 1)])?;
                assert_eq!(third.batch_id, 3);
                assert_eq!(queue.highest_unacknowledged_batch_id(txn)?, 3);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn batches_affecting_uses_document_index() {
        let persistence = Persistence::open_in_memory().unwrap();
        let queue = MutationQueue::new(&User::new("alice"));
        let other = MutationQueue::new(&User::new("bob"));
        persistence
            .run_in_transaction("queue", |txn| -> LocalResult<()> {
                queue.add_batch(txn, Timestamp::now(), vec![set("items/a", 1)])?;
                queue.add_batch(txn, Timestamp::now(), vec![set("items/b", 1), set("items/a", 2)])?;
                queue.add_batch(txn, Timestamp::now(), vec![set("items/a/parts/x", 1)])?;
                other.add_batch(txn, Timestamp::now(), vec![set("items/a", 9)])?;

                let ids: Vec<_> = queue
                    .batches_affecting(txn, &keys(&["items/a"]))?
                    .iter()
                    .map(|b| b.batch_id)
                    .collect();
                assert_eq!(ids, vec![1, 2]);

                let ids: Vec<_> = queue
                    .batches_affecting_query(txn, &Query::collection("items"))?
                    .iter()
                    .map(|b| b.batch_id)
                    .collect();
                assert_eq!(ids, vec![1, 2]);

                let ids: Vec<_> = queue
                    .batches_affecting_query(txn, &Query::collection_group("parts"))?
                    .iter()
                    .map(|b| b.batch_id)
                    .collect();
                assert_eq!(ids, vec![3]);
                assert_eq!(other.all_batches(txn)?.len(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn acknowledgement_is_monotonic_and_keeps_token() {
        let persistence = Persistence::open_in_memory().unwrap();
        let queue = MutationQueue::new(&User::unauthenticated());
        persistence
            .run_in_transaction("queue", |txn| -> LocalResult<()> {
                assert_eq!(queue.highest_acknowledged_batch_id(txn)?, BATCH_ID_UNKNOWN);
                queue.acknowledge_batch(txn, 4, b"t4".to_vec())?;
                queue.acknowledge_batch(txn, 2, b"t5".to_vec())?;
                assert_eq!(queue.highest_acknowledged_batch_id(txn)?, 4);
                assert_eq!(queue.last_stream_token(txn)?, b"t5");
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn removing_unknown_batch_fails() {
        let persistence = Persistence::open_in_memory().unwrap();
        let queue = MutationQueue::new(&User::unauthenticated());
        let batch = MutationBatch::new(7, Timestamp::now(), vec![set("items/a", 1)]);
        let result = persistence.run_in_transaction("queue", |txn| queue.remove_batch(txn, &batch));
        assert!(matches!(result, Err(LocalError::BatchNotFound(7))));
    }

    #[test]
    fn empty_batch_is_rejected() {
        let persistence = Persistence::open_in_memory().unwrap();
        let queue = MutationQueue::new(&User::unauthenticated());
        let result = persistence.run_in_transaction("queue", |txn| {
            queue.add_batch(txn, Timestamp::now(), Vec::new())
        });
        assert!(matches!(result, Err(LocalError::EmptyBatch)));
    }
}
