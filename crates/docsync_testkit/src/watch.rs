//! Builders for scripted listen stream traffic.
//!
//! A backend answering a new target sends, in order: [`added`], the
//! matching documents, [`current`] and a global [`snapshot`].
//! [`initial_results`] produces that whole sequence.

use docsync_model::{Document, DatabaseId, DocumentKey, SnapshotVersion, TargetId};
use docsync_protocol::{
    BloomFilter, DocumentChange, DocumentRemove, ExistenceFilter,
    ExistenceFilterChange, Status, WatchChange, WatchTargetChange, WatchTargetChangeState,
};

fn target_change(state: WatchTargetChangeState, target_ids: &[TargetId]) -> WatchTargetChange {
    WatchTargetChange::new(state, target_ids.to_vec())
}

/// Acknowledges that `target_ids` were added.
pub fn added(target_ids: &[TargetId]) -> WatchChange {
    WatchChange::TargetChange(target_change(WatchTargetChangeState::Added, target_ids))
}

/// Marks `target_ids` current with `resume_token`.
pub fn current(target_ids: &[TargetId], resume_token: &str) -> WatchChange {
    WatchChange::TargetChange(
        target_change(WatchTargetChangeState::Current, target_ids)
            .with_resume_token(resume_token.as_bytes().to_vec()),
    )
}

/// Tells the client to drop its results for `target_ids`.
pub fn reset(target_ids: &[TargetId]) -> WatchChange {
    WatchChange::TargetChange(target_change(WatchTargetChangeState::Reset, target_ids))
}

/// Removes `target_ids`; with a cause this rejects the listen.
pub fn removed(target_ids: &[TargetId], cause: Option<Status>) -> WatchChange {
    let change = target_change(WatchTargetChangeState::Removed, target_ids);
    WatchChange::TargetChange(match cause {
        Some(cause) => change.with_cause(cause),
        None => change,
    })
}

/// A global snapshot boundary.
pub fn snapshot(read_time: SnapshotVersion, resume_token: &str) -> WatchChange {
    WatchChange::TargetChange(WatchTargetChange::snapshot(
        read_time,
        resume_token.as_bytes().to_vec(),
    ))
}

/// `doc` now matches `target_ids`.
pub fn document_change(doc: Document, target_ids: &[TargetId]) -> WatchChange {
    WatchChange::DocumentChange(DocumentChange {
        document: doc,
        updated_target_ids: target_ids.to_vec(),
        removed_target_ids: Vec::new(),
    })
}

/// `key` left `target_ids` without its new state being known.
pub fn document_remove(key: DocumentKey, target_ids: &[TargetId]) -> WatchChange {
    WatchChange::DocumentRemove(DocumentRemove {
        key,
        removed_target_ids: target_ids.to_vec(),
    })
}

/// An existence filter whose bloom filter holds exactly `present`.
pub fn existence_filter_with_bloom(
    database_id: &DatabaseId,
    target_id: TargetId,
    present: &[DocumentKey],
) -> WatchChange {
    let names: Vec<String> = present
        .iter()
        .map(|key| database_id.document_name(key))
        .collect();
    let bloom = BloomFilter::with_values(512, 7, names.iter().map(String::as_str))
        .expect("Invalid bloom filter");
    WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id,
        filter: ExistenceFilter {
            count: i32::try_from(present.len()).expect("Too many documents"),
            unchanged_names: Some(bloom.to_params()),
        },
    })
}

/// The full answer to a newly added target.
pub fn initial_results(
    target_id: TargetId,
    docs: Vec<Document>,
    read_time: SnapshotVersion,
    resume_token: &str,
) -> Vec<WatchChange> {
    let mut changes = vec![added(&[target_id])];
    changes.extend(docs.into_iter().map(|doc| document_change(doc, &[target_id])));
    changes.push(current(&[target_id], resume_token));
    changes.push(snapshot(read_time, resume_token));
    changes
}
