//! Transactional entity tables on top of a [`StorageBackend`].
//!
//! All state lives in memory as ordered tables of byte keys to encoded
//! entities. A committed transaction is appended to the backend as one
//! framed record before the in-memory tables change, so a crash either
//! loses the whole transaction or none of it.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use crate::memory::InMemoryBackend;
use crate::record::{decode_record, encode_record, Decoded};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, trace, warn};

/// Logical tables of the local cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Table {
    /// Remote documents by key.
    RemoteDocuments,
    /// Mutation batches by user and batch id.
    Mutations,
    /// Index from (user, document key, batch id) to nothing.
    DocumentMutations,
    /// Per-user queue metadata (stream token, next batch id).
    MutationQueues,
    /// Overlays by user and document key.
    Overlays,
    /// Target data by target id.
    Targets,
    /// Membership of documents in targets.
    TargetDocuments,
    /// Field index definitions.
    IndexConfiguration,
    /// Field index entries.
    IndexEntries,
    /// Singleton values such as the highest target id.
    Globals,
}

#[derive(Debug, Serialize, Deserialize)]
enum LogOp {
    Put {
        table: Table,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        table: Table,
        key: Vec<u8>,
    },
}

type Tables = BTreeMap<Table, BTreeMap<Vec<u8>, Vec<u8>>>;
type Pending = BTreeMap<(Table, Vec<u8>), Option<Vec<u8>>>;

/// Options controlling durability.
#[derive(Debug, Clone, Copy)]
pub struct PersistenceOptions {
    /// Sync the backend after every commit rather than only flushing.
    pub sync_on_commit: bool,
}

impl Default for PersistenceOptions {
    fn default() -> Self {
        Self {
            sync_on_commit: true,
        }
    }
}

struct Inner {
    backend: Box<dyn StorageBackend>,
    tables: Tables,
    options: PersistenceOptions,
    records: u64,
}

/// Durable, transactional storage for the local cache.
pub struct Persistence {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Persistence")
            .field("records", &inner.records)
            .field("tables", &inner.tables.len())
            .finish()
    }
}

impl Persistence {
    /// Opens persistence over `backend`, replaying its log.
    ///
    /// A torn or corrupt record at the tail is cut off and everything
    /// before it is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read or truncated.
    pub fn open(
        mut backend: Box<dyn StorageBackend>,
        options: PersistenceOptions,
    ) -> StorageResult<Self> {
        let data = backend.read_all()?;
        let mut tables = Tables::new();
        let mut offset = 0usize;
        let mut records = 0u64;

        while offset < data.len() {
            match decode_record(&data[offset..]) {
                Decoded::Record(payload, len) => match decode::<Vec<LogOp>>(payload) {
                    Ok(ops) => {
                        apply_ops(&mut tables, ops);
                        offset += len;
                        records += 1;
                    }
                    Err(err) => {
                        warn!(offset, error = %err, "undecodable log record, truncating");
                        backend.truncate(offset as u64)?;
                        break;
                    }
                },
                Decoded::Torn => {
                    warn!(offset, "torn log record at tail, truncating");
                    backend.truncate(offset as u64)?;
                    break;
                }
                Decoded::Corrupt(reason) => {
                    warn!(offset, %reason, "corrupt log record, truncating");
                    backend.truncate(offset as u64)?;
                    break;
                }
            }
        }

        debug!(records, bytes = offset, "persistence opened");
        Ok(Self {
            inner: Mutex::new(Inner {
                backend,
                tables,
                options,
                records,
            }),
        })
    }

    /// Opens a fresh in-memory persistence.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature matches [`Persistence::open`].
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::open(
            Box::new(InMemoryBackend::new()),
            PersistenceOptions::default(),
        )
    }

    /// Opens file-backed persistence at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, is locked, or cannot
    /// be replayed.
    pub fn open_file(path: &Path, options: PersistenceOptions) -> StorageResult<Self> {
        Self::open(Box::new(FileBackend::open(path)?), options)
    }

    /// Runs `f` in a transaction and commits its writes atomically.
    ///
    /// Reads inside the transaction see its own pending writes. If `f`
    /// returns an error, or the commit cannot be written, nothing changes.
    /// Transactions are serialized; do not start one from inside another.
    ///
    /// # Errors
    ///
    /// Returns the error of `f`, or a storage error converted into `E` if
    /// the commit fails.
    pub fn run_in_transaction<T, E, F>(&self, label: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, E>,
        E: From<StorageError>,
    {
        let mut inner = self.inner.lock();
        let mut txn = Transaction {
            tables: &inner.tables,
            pending: Pending::new(),
        };
        let result = f(&mut txn)?;
        let pending = txn.pending;
        if !pending.is_empty() {
            inner.commit(label, pending)?;
        }
        Ok(result)
    }

    /// Rewrites the log as a single snapshot record.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn compact(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let ops: Vec<LogOp> = inner
            .tables
            .iter()
            .flat_map(|(table, rows)| {
                rows.iter().map(|(key, value)| LogOp::Put {
                    table: *table,
                    key: key.clone(),
                    value: value.clone(),
                })
            })
            .collect();
        let record = encode_record(&encode(&ops)?)?;
        inner.backend.replace(&record)?;
        inner.records = 1;
        debug!(rows = ops.len(), bytes = record.len(), "log compacted");
        Ok(())
    }

    /// Number of records in the log.
    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.inner.lock().records
    }

    /// Current size of the log in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report its size.
    pub fn log_size(&self) -> StorageResult<u64> {
        self.inner.lock().backend.size()
    }
}

impl Inner {
    fn commit(&mut self, label: &str, pending: Pending) -> StorageResult<()> {
        let ops: Vec<LogOp> = pending
            .into_iter()
            .map(|((table, key), value)| match value {
                Some(value) => LogOp::Put { table, key, value },
                None => LogOp::Delete { table, key },
            })
            .collect();
        let record = encode_record(&encode(&ops)?)?;

        let start = self.backend.size()?;
        let written = self.backend.append(&record).and_then(|_| {
            if self.options.sync_on_commit {
                self.backend.flush()?;
                self.backend.sync()
            } else {
                self.backend.flush()
            }
        });
        if let Err(err) = written {
            warn!(label, error = %err, "commit failed");
            // Leave no partial record behind for the next replay.
            if self.backend.size().is_ok_and(|size| size > start) {
                let _ = self.backend.truncate(start);
            }
            return Err(err);
        }

        trace!(label, ops = ops.len(), bytes = record.len(), "transaction committed");
        apply_ops(&mut self.tables, ops);
        self.records += 1;
        Ok(())
    }
}

fn apply_ops(tables: &mut Tables, ops: Vec<LogOp>) {
    for op in ops {
        match op {
            LogOp::Put { table, key, value } => {
                tables.entry(table).or_default().insert(key, value);
            }
            LogOp::Delete { table, key } => {
                if let Some(rows) = tables.get_mut(&table) {
                    rows.remove(&key);
                }
            }
        }
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> StorageResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StorageError::Encoding(e.to_string()))?;
    Ok(buf)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StorageResult<T> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Decoding(e.to_string()))
}

/// A read/write view of the tables inside [`Persistence::run_in_transaction`].
pub struct Transaction<'a> {
    tables: &'a Tables,
    pending: Pending,
}

impl Transaction<'_> {
    /// Reads raw bytes, seeing this transaction's own writes.
    #[must_use]
    pub fn get(&self, table: Table, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(pending) = self.pending.get(&(table, key.to_vec())) {
            return pending.clone();
        }
        self.tables
            .get(&table)
            .and_then(|rows| rows.get(key))
            .cloned()
    }

    /// Writes raw bytes.
    pub fn put(&mut self, table: Table, key: Vec<u8>, value: Vec<u8>) {
        self.pending.insert((table, key), Some(value));
    }

    /// Deletes a row.
    pub fn delete(&mut self, table: Table, key: Vec<u8>) {
        self.pending.insert((table, key), None);
    }

    /// Returns every row whose key starts with `prefix`, in key order.
    #[must_use]
    pub fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut rows: BTreeMap<Vec<u8>, Vec<u8>> = self
            .tables
            .get(&table)
            .map(|rows| {
                rows.range(prefix.to_vec()..)
                    .take_while(|(k, _)| k.starts_with(prefix))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();

        for ((_, key), value) in self
            .pending
            .range((table, prefix.to_vec())..)
            .take_while(|((t, k), _)| *t == table && k.starts_with(prefix))
        {
            match value {
                Some(value) => {
                    rows.insert(key.clone(), value.clone());
                }
                None => {
                    rows.remove(key);
                }
            }
        }
        rows.into_iter().collect()
    }

    /// Deletes every row whose key starts with `prefix`.
    pub fn delete_prefix(&mut self, table: Table, prefix: &[u8]) {
        for (key, _) in self.scan_prefix(table, prefix) {
            self.delete(table, key);
        }
    }

    /// Reads and decodes an entity.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Decoding`] if the stored bytes do not decode.
    pub fn get_entity<T: DeserializeOwned>(&self, table: Table, key: &[u8]) -> StorageResult<Option<T>> {
        self.get(table, key).map(|bytes| decode(&bytes)).transpose()
    }

    /// Encodes and writes an entity.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Encoding`] if the value cannot be encoded.
    pub fn put_entity<T: Serialize + ?Sized>(
        &mut self,
        table: Table,
        key: Vec<u8>,
        value: &T,
    ) -> StorageResult<()> {
        let bytes = encode(value)?;
        self.put(table, key, bytes);
        Ok(())
    }

    /// Reads and decodes every entity whose key starts with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Decoding`] if any row does not decode.
    pub fn scan_prefix_entities<T: DeserializeOwned>(
        &self,
        table: Table,
        prefix: &[u8],
    ) -> StorageResult<Vec<(Vec<u8>, T)>> {
        self.scan_prefix(table, prefix)
            .into_iter()
            .map(|(key, bytes)| Ok((key, decode(&bytes)?)))
            .collect()
    }
}
