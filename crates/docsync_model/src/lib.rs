//! # docsync Model
//!
//! Value types shared by every docsync crate.
//!
//! This crate provides:
//! - Resource paths, field paths and document keys
//! - Snapshot versions and timestamps
//! - Field values with a fixed cross-type ordering
//! - Documents with existence and pending-write state
//! - Mutations, field transforms and mutation batches
//! - Queries, targets and ordered document sets
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod document;
mod document_set;
mod error;
mod key;
mod mutation;
mod path;
mod query;
mod target;
mod user;
mod value;
mod version;

pub use batch::{BatchId, MutationBatch, MutationBatchResult, BATCH_ID_UNKNOWN};
pub use document::{Document, DocumentState, DocumentType};
pub use document_set::{DocumentComparator, DocumentSet};
pub use error::{ModelError, ModelResult};
pub use key::{DatabaseId, DocumentKey};
pub use mutation::{
    calculate_overlay_mutation, FieldMask, FieldTransform, Mutation, MutationKind, MutationResult,
    Overlay, Precondition, TransformOperation,
};
pub use path::{FieldPath, ResourcePath};
pub use query::{
    Bound, CompositeFilter, CompositeOperator, Direction, FieldFilter, Filter, LimitType,
    Operator, OrderBy, Query,
};
pub use target::{Target, TargetData, TargetId, TargetIdGenerator, TargetPurpose};
pub use user::User;
pub use value::{ObjectValue, TypeOrder, Value};
pub use version::{SnapshotVersion, Timestamp};

/// Map of document keys to documents, ordered by key.
pub type DocumentMap = std::collections::BTreeMap<DocumentKey, Document>;

/// Ordered set of document keys.
pub type DocumentKeySet = std::collections::BTreeSet<DocumentKey>;
