//! # docsync Storage
//!
//! The persistence boundary of docsync.
//!
//! Two layers live here:
//!
//! - [`StorageBackend`]: an **opaque append-only byte store** (memory or file)
//! - [`Persistence`]: named tables of byte keys to CBOR-encoded entities,
//!   with transactions that commit atomically as one framed log record
//!
//! Nothing in this crate knows about documents, mutations or targets; the
//! local store decides what the tables hold.
//!
//! ## Example
//!
//! ```rust
//! use docsync_storage::{Persistence, Table};
//!
//! let persistence = Persistence::open_in_memory().unwrap();
//! persistence
//!     .run_in_transaction("example", |txn| {
//!         txn.put_entity(Table::Globals, b"answer".to_vec(), &42u32)
//!     })
//!     .unwrap();
//! let answer: Option<u32> = persistence
//!     .run_in_transaction("read", |txn| txn.get_entity(Table::Globals, b"answer"))
//!     .unwrap();
//! assert_eq!(answer, Some(42));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod key;
mod memory;
mod persistence;
mod record;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use key::KeyBuilder;
pub use memory::InMemoryBackend;
pub use persistence::{Persistence, PersistenceOptions, Table, Transaction};
pub use record::{compute_crc32, LOG_MAGIC};
