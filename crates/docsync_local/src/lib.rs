//! # docsync Local
//!
//! Local state of a docsync client: everything that survives going offline.
//!
//! This crate provides:
//! - [`RemoteDocumentCache`]: the last known server state of each document
//! - [`MutationQueue`]: durable, ordered batches of pending writes per user
//! - [`OverlayCache`]: the net effect of pending writes per document
//! - [`LocalDocumentsView`]: remote state with overlays applied
//! - [`IndexManager`] and [`QueryEngine`]: query execution with persistent
//!   field indexes created on demand
//! - [`TargetCache`]: watched targets, resume tokens and target membership
//! - [`LocalStore`]: the transactional facade the sync engine drives
//!
//! Every operation runs inside one [`docsync_storage::Persistence`]
//! transaction, so a crash never leaves a batch half queued or an overlay
//! out of step with the queue.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod encoding;
mod error;
mod index_manager;
mod local_documents_view;
mod local_store;
mod mutation_queue;
mod overlay_cache;
mod query_engine;
mod remote_document_cache;
mod target_cache;

pub use error::{LocalError, LocalResult};
pub use index_manager::{FieldIndex, IndexManager, IndexType};
pub use local_documents_view::LocalDocumentsView;
pub use local_store::{
    LocalStore, LocalViewChanges, LocalWriteResult, QueryResult, UserChangeResult,
};
pub use mutation_queue::MutationQueue;
pub use overlay_cache::{OverlayCache, OverlayMap};
pub use query_engine::{QueryEngine, QueryEngineConfig, QueryStrategy};
pub use remote_document_cache::{QueryContext, RemoteDocumentCache};
pub use target_cache::{TargetCache, TargetGlobals};
