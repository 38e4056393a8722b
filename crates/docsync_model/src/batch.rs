//! Mutation batches.

use crate::document::Document;
use crate::error::{ModelError, ModelResult};
use crate::mutation::{FieldMask, Mutation, MutationResult};
use crate::version::{SnapshotVersion, Timestamp};
use crate::DocumentKeySet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Monotonic identifier of a mutation batch.
pub type BatchId = i32;

/// Sentinel for "no batch".
pub const BATCH_ID_UNKNOWN: BatchId = -1;

/// An ordered group of mutations applied atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationBatch {
    /// Unique, strictly increasing id.
    pub batch_id: BatchId,
    /// Local time the batch was created.
    pub local_write_time: Timestamp,
    /// Mutations in application order.
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    /// Creates a batch.
    #[must_use]
    pub fn new(batch_id: BatchId, local_write_time: Timestamp, mutations: Vec<Mutation>) -> Self {
        Self {
            batch_id,
            local_write_time,
            mutations,
        }
    }

    /// Returns every key written by this batch.
    #[must_use]
    pub fn keys(&self) -> DocumentKeySet {
        self.mutations.iter().map(|m| m.key.clone()).collect()
    }

    /// Applies this batch's mutations for `doc` to the local view.
    ///
    /// See [`Mutation::apply_to_local_view`] for the meaning of the mask.
    pub fn apply_to_local_view(
        &self,
        doc: &mut Document,
        mut mask: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in &self.mutations {
            if &mutation.key == doc.key() {
                mask = mutation.apply_to_local_view(doc, mask, self.local_write_time);
            }
        }
        mask
    }

    /// Applies the acknowledged results of this batch to `doc`.
    pub fn apply_to_remote_document(&self, doc: &mut Document, result: &MutationBatchResult) {
        for (mutation, mutation_result) in self.mutations.iter().zip(&result.mutation_results) {
            if &mutation.key == doc.key() {
                mutation.apply_to_remote_document(doc, mutation_result);
            }
        }
    }
}

/// A batch together with the server's acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationBatchResult {
    /// The acknowledged batch.
    pub batch: MutationBatch,
    /// Commit version of the write.
    pub commit_version: SnapshotVersion,
    /// One result per mutation.
    pub mutation_results: Vec<MutationResult>,
    /// Write stream token received with the acknowledgement.
    pub stream_token: Vec<u8>,
    /// Version of each written document after the commit.
    pub doc_versions: BTreeMap<crate::DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    /// Pairs a batch with its results, checking that every mutation has one.
    pub fn new(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> ModelResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(ModelError::MutationResultMismatch {
                expected: batch.mutations.len(),
                actual: mutation_results.len(),
            });
        }
        let doc_versions = batch
            .mutations
            .iter()
            .zip(&mutation_results)
            .map(|(m, r)| (m.key.clone(), r.version))
            .collect();
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DocumentKey, ObjectValue, Value};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::parse(path).unwrap()
    }

    #[test]
    fn result_count_must_match() {
        let batch = MutationBatch::new(1, Timestamp::default(), vec![Mutation::delete(key("items/a"))]);
        let err = MutationBatchResult::new(batch, SnapshotVersion::from_millis(1), vec![], vec![]);
        assert!(matches!(
            err,
            Err(ModelError::MutationResultMismatch {
                expected: 1,
                actual: 0
            })
        ));
    }

    #[test]
    fn local_view_only_touches_matching_key() {
        let value: ObjectValue = [("x", Value::from(5))].into_iter().collect();
        let batch = MutationBatch::new(
            1,
            Timestamp::default(),
            vec![Mutation::set(key("items/a"), value), Mutation::delete(key("items/b"))],
        );
        let mut doc = Document::new_invalid(key("items/a"));
        let mask = batch.apply_to_local_view(&mut doc, Some(FieldMask::default()));
        assert!(mask.is_none());
        assert!(doc.is_found_document());
        assert_eq!(batch.keys().len(), 2);
    }
}
