//! The sync engine.
//!
//! Glues the local store, the remote store and the views together. It is a
//! plain synchronous state machine: the client runs it on its serial queue,
//! tests drive it directly with a [`ManualScheduler`](crate::ManualScheduler)
//! and a loopback connection.
//!
//! Every entry point ends by acting on the [`RemoteOutput`]s the remote store
//! returned, so one call leaves the engine in a consistent state.

use crate::config::{PersistenceMode, SyncConfig};
use crate::connection::{Connection, CredentialsProvider, Dispatcher, InboundEvent, StreamKind};
use crate::error::{SyncError, SyncResult};
use crate::event_manager::{
    EventManager, ListenOptions, ListenerId, QueryListener, QuerySnapshot, SnapshotSender,
};
use crate::online_state::OnlineState;
use crate::remote_store::{RemoteKeys, RemoteOutput, RemoteStore};
use crate::scheduler::{Scheduler, TimerToken};
use crate::view::{ChangeType, DocumentViewChange, LimboDocumentChange, View, ViewSnapshot};
use docsync_local::{LocalStore, LocalViewChanges};
use docsync_model::{
    BatchId, Document, DocumentKey, DocumentKeySet, DocumentMap, DocumentSet, Mutation,
    MutationBatchResult, Query, SnapshotVersion, Target, TargetData, TargetId, TargetIdGenerator,
    TargetPurpose, Timestamp, User,
};
use docsync_protocol::{RemoteEvent, Status};
use docsync_storage::{Persistence, PersistenceOptions};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Where a one-shot read is served from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Source {
    /// The backend if reachable, the cache otherwise.
    #[default]
    Default,
    /// The backend only; fails while offline.
    Server,
    /// The local cache only.
    Cache,
}

/// Client-wide events that belong to no single listener or write.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The online state changed.
    OnlineStateChanged(OnlineState),
    /// A write failed transiently and stays queued.
    WriteRetrying {
        /// The batch.
        batch_id: BatchId,
        /// The transient failure.
        status: Status,
        /// Consecutive failures so far.
        attempts: u32,
    },
    /// File persistence could not be opened; the cache lives in memory.
    PersistenceDegraded {
        /// Why persistence failed.
        reason: String,
    },
    /// A stream stopped after its credentials were rejected twice.
    AuthenticationFailed {
        /// The stream.
        stream: StreamKind,
        /// The final rejection.
        status: Status,
    },
}

struct QueryView {
    target_id: TargetId,
    view: View,
}

#[derive(Debug)]
struct LimboResolution {
    key: DocumentKey,
    received_document: bool,
}

/// Bookkeeping of limbo documents: which views reference them, which are
/// being resolved and which wait for a free slot.
#[derive(Debug)]
struct LimboTracker {
    max_active: usize,
    enqueued: VecDeque<DocumentKey>,
    active_by_key: BTreeMap<DocumentKey, TargetId>,
    active_by_target: BTreeMap<TargetId, LimboResolution>,
    references: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    ids: TargetIdGenerator,
}

impl LimboTracker {
    fn new(max_active: usize) -> Self {
        Self {
            max_active,
            enqueued: VecDeque::new(),
            active_by_key: BTreeMap::new(),
            active_by_target: BTreeMap::new(),
            references: BTreeMap::new(),
            ids: TargetIdGenerator::for_sync_engine(),
        }
    }

    fn add_reference(&mut self, key: DocumentKey, target_id: TargetId) {
        self.references
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if !self.active_by_key.contains_key(&key) && !self.enqueued.contains(&key) {
            debug!(%key, "new document in limbo");
            self.enqueued.push_back(key);
        }
    }

    /// Drops one reference. Returns the limbo target to stop if the key is
    /// no longer referenced and was being resolved.
    fn remove_reference(&mut self, key: &DocumentKey, target_id: TargetId) -> Option<TargetId> {
        let references = self.references.get_mut(key)?;
        references.remove(&target_id);
        if !references.is_empty() {
            return None;
        }
        self.references.remove(key);
        self.forget(key)
    }

    /// Drops every reference held by a view's target.
    fn remove_target_references(&mut self, target_id: TargetId) -> Vec<TargetId> {
        let keys: Vec<DocumentKey> = self
            .references
            .iter()
            .filter(|(_, targets)| targets.contains(&target_id))
            .map(|(key, _)| key.clone())
            .collect();
        keys.iter()
            .filter_map(|key| self.remove_reference(key, target_id))
            .collect()
    }

    fn forget(&mut self, key: &DocumentKey) -> Option<TargetId> {
        self.enqueued.retain(|queued| queued != key);
        let target_id = self.active_by_key.remove(key)?;
        self.active_by_target.remove(&target_id);
        Some(target_id)
    }

    /// Takes the next queued key if a slot is free and assigns it a target.
    fn next_to_start(&mut self) -> Option<(DocumentKey, TargetId)> {
        while self.active_by_target.len() < self.max_active {
            let key = self.enqueued.pop_front()?;
            if self.active_by_key.contains_key(&key) {
                continue;
            }
            let target_id = self.ids.next_id();
            self.active_by_key.insert(key.clone(), target_id);
            self.active_by_target.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            return Some((key, target_id));
        }
        None
    }

    fn resolution(&self, target_id: TargetId) -> Option<&LimboResolution> {
        self.active_by_target.get(&target_id)
    }

    fn resolution_mut(&mut self, target_id: TargetId) -> Option<&mut LimboResolution> {
        self.active_by_target.get_mut(&target_id)
    }
}

/// Remote keys as the engine sees them, built from disjoint field borrows so
/// the remote store can be borrowed mutably at the same time.
struct EngineKeys<'a> {
    views: &'a HashMap<Query, QueryView>,
    queries_by_target: &'a BTreeMap<TargetId, Vec<Query>>,
    limbo: &'a LimboTracker,
}

impl RemoteKeys for EngineKeys<'_> {
    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        if let Some(resolution) = self.limbo.resolution(target_id) {
            let mut keys = DocumentKeySet::new();
            if resolution.received_document {
                keys.insert(resolution.key.clone());
            }
            return keys;
        }
        let mut keys = DocumentKeySet::new();
        for query in self.queries_by_target.get(&target_id).into_iter().flatten() {
            if let Some(query_view) = self.views.get(query) {
                keys.extend(query_view.view.synced_documents().iter().cloned());
            }
        }
        keys
    }
}

/// Orchestrates local state, remote streams and views.
pub struct SyncEngine {
    local: LocalStore,
    remote: RemoteStore,
    event_manager: EventManager,
    views: HashMap<Query, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,
    limbo: LimboTracker,
    pending_writes: BTreeMap<BatchId, oneshot::Sender<SyncResult<()>>>,
    max_pending_writes: Option<usize>,
    events: broadcast::Sender<SyncEvent>,
    persistence_degraded: bool,
    next_listener_id: u64,
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("user", self.local.user())
            .field("remote", &self.remote)
            .field("views", &self.views.len())
            .field("limbo", &self.limbo)
            .field("pending_writes", &self.pending_writes.len())
            .field("persistence_degraded", &self.persistence_degraded)
            .finish()
    }
}

/// Opens the configured persistence, falling back to memory if the file
/// cannot be opened. Returns the reason for the fallback, if any.
pub fn open_persistence(config: &SyncConfig) -> SyncResult<(Persistence, Option<String>)> {
    match &config.persistence {
        PersistenceMode::Memory => Ok((
            Persistence::open_in_memory().map_err(docsync_local::LocalError::from)?,
            None,
        )),
        PersistenceMode::File(path) => {
            let options = PersistenceOptions {
                sync_on_commit: config.sync_on_commit,
            };
            match Persistence::open_file(path, options) {
                Ok(persistence) => Ok((persistence, None)),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "file persistence unavailable, using memory");
                    let persistence =
                        Persistence::open_in_memory().map_err(docsync_local::LocalError::from)?;
                    Ok((persistence, Some(err.to_string())))
                }
            }
        }
    }
}

impl SyncEngine {
    /// Creates an engine over existing stores.
    pub fn new(config: &SyncConfig, local: LocalStore, remote: RemoteStore) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            local,
            remote,
            event_manager: EventManager::new(),
            views: HashMap::new(),
            queries_by_target: BTreeMap::new(),
            limbo: LimboTracker::new(config.max_concurrent_limbo_resolutions.max(1)),
            pending_writes: BTreeMap::new(),
            max_pending_writes: config.max_pending_writes,
            events,
            persistence_degraded: false,
            next_listener_id: 0,
        }
    }

    /// Opens persistence and builds both stores.
    ///
    /// # Errors
    ///
    /// Returns an error if even in-memory persistence cannot be opened.
    pub fn open(
        config: &SyncConfig,
        user: User,
        connection: Box<dyn Connection>,
        credentials: Box<dyn CredentialsProvider>,
        scheduler: Box<dyn Scheduler>,
        dispatcher: Dispatcher,
    ) -> SyncResult<Self> {
        let (persistence, degraded) = open_persistence(config)?;
        let local = LocalStore::new(persistence, user, config.query_engine.clone())?;
        let remote = RemoteStore::new(config, connection, credentials, scheduler, dispatcher);
        let mut engine = Self::new(config, local, remote);
        if let Some(reason) = degraded {
            engine.mark_persistence_degraded(reason);
        }
        Ok(engine)
    }

    /// The local store.
    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    /// The remote store.
    pub fn remote(&self) -> &RemoteStore {
        &self.remote
    }

    /// Current online state.
    pub fn online_state(&self) -> OnlineState {
        self.remote.online_state()
    }

    /// Subscribes to client-wide events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<SyncEvent> {
        self.events.clone()
    }

    /// Returns true if the cache fell back to memory.
    pub fn is_persistence_degraded(&self) -> bool {
        self.persistence_degraded
    }

    /// Records that the cache fell back to memory.
    pub fn mark_persistence_degraded(&mut self, reason: String) {
        self.persistence_degraded = true;
        self.emit(SyncEvent::PersistenceDegraded { reason });
    }

    /// Number of limbo documents being resolved.
    pub fn active_limbo_resolutions(&self) -> usize {
        self.limbo.active_by_target.len()
    }

    /// Number of limbo documents waiting for a free slot.
    pub fn enqueued_limbo_resolutions(&self) -> usize {
        self.limbo.enqueued.len()
    }

    /// Keys being resolved with their limbo targets.
    pub fn active_limbo_targets(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.limbo.active_by_key.clone()
    }

    /// Number of writes awaiting acknowledgement.
    pub fn pending_write_count(&self) -> usize {
        self.pending_writes.len()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.event_manager.listener_count()
    }

    fn emit(&self, event: SyncEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// Enables the network.
    pub fn enable_network(&mut self) -> SyncResult<()> {
        let outputs = self.remote.enable_network(&self.local)?;
        self.process_outputs(outputs);
        Ok(())
    }

    /// Disables the network; listeners see from-cache results.
    pub fn disable_network(&mut self) {
        let outputs = self.remote.disable_network();
        self.process_outputs(outputs);
    }

    /// Stops both streams for good.
    pub fn shutdown(&mut self) {
        self.remote.shutdown();
        for (batch_id, sender) in std::mem::take(&mut self.pending_writes) {
            debug!(batch_id, "pending write abandoned at shutdown");
            let _ = sender.send(Err(SyncError::Shutdown));
        }
    }

    /// Registers a listener for `query`. Its snapshots arrive on `sender`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query's view cannot be built.
    pub fn listen(
        &mut self,
        query: Query,
        options: ListenOptions,
        sender: SnapshotSender,
    ) -> SyncResult<ListenerId> {
        self.next_listener_id += 1;
        let id = ListenerId(self.next_listener_id);
        let listener = QueryListener::new(id, query.clone(), options, sender);
        if self.event_manager.listen(listener) {
            match self.initialize_view(&query) {
                Ok(snapshot) => self.event_manager.on_view_snapshots(vec![snapshot]),
                Err(err) => {
                    self.event_manager.unlisten(id);
                    return Err(err);
                }
            }
        }
        debug!(listener = %id, query = %query.canonical_id(), "listening");
        Ok(id)
    }

    /// Removes a listener. Unknown or already removed ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if releasing the query's target fails.
    pub fn unlisten(&mut self, id: ListenerId) -> SyncResult<()> {
        let Some(query) = self.event_manager.unlisten(id) else {
            return Ok(());
        };
        debug!(listener = %id, query = %query.canonical_id(), "last listener removed");
        self.remove_view(&query)
    }

    fn initialize_view(&mut self, query: &Query) -> SyncResult<ViewSnapshot> {
        let target_data = self.local.allocate_target(query.to_target())?;
        let target_id = target_data.target_id;
        let result = self.local.execute_query(query, true)?;

        let mut view = View::new(query.clone(), result.remote_keys)
            .with_cached_results(!target_data.resume_token.is_empty());
        let computed = view.compute_doc_changes(&to_document_map(&result.documents), None);
        let change = view.apply_changes(computed, true, None, false);
        self.update_tracked_limbos(target_id, change.limbo_changes);

        let snapshot = match change.snapshot {
            Some(snapshot) => snapshot,
            None => ViewSnapshot::from_initial_documents(
                query.clone(),
                view.documents().clone(),
                DocumentKeySet::new(),
                true,
                !target_data.resume_token.is_empty(),
                SnapshotVersion::MIN,
            ),
        };
        self.views
            .insert(query.clone(), QueryView { target_id, view });
        self.queries_by_target
            .entry(target_id)
            .or_default()
            .push(query.clone());

        let keys = EngineKeys {
            views: &self.views,
            queries_by_target: &self.queries_by_target,
            limbo: &self.limbo,
        };
        let outputs = self.remote.listen(target_data, &keys);
        self.process_outputs(outputs);
        self.pump_limbo_resolutions();
        Ok(snapshot)
    }

    fn remove_view(&mut self, query: &Query) -> SyncResult<()> {
        let Some(query_view) = self.views.remove(query) else {
            return Ok(());
        };
        let target_id = query_view.target_id;
        let Some(queries) = self.queries_by_target.get_mut(&target_id) else {
            return Ok(());
        };
        queries.retain(|q| q != query);
        if !queries.is_empty() {
            return Ok(());
        }
        self.queries_by_target.remove(&target_id);
        let outputs = self.remote.unlisten(target_id);
        self.process_outputs(outputs);
        self.local.release_target(target_id, true)?;
        self.remove_limbo_references(target_id);
        Ok(())
    }

    /// Queues `mutations` as one batch and applies them to local views.
    ///
    /// Returns once the batch is durably queued; the receiver resolves when
    /// the backend accepts or rejects it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::TooManyPendingWrites`] if the configured limit is
    /// reached, or the local error if the batch could not be committed. The
    /// write is not applied in either case.
    pub fn write(
        &mut self,
        mutations: Vec<Mutation>,
    ) -> SyncResult<(BatchId, oneshot::Receiver<SyncResult<()>>)> {
        if let Some(limit) = self.max_pending_writes {
            if self.pending_writes.len() >= limit {
                return Err(SyncError::TooManyPendingWrites { limit });
            }
        }
        let result = self.local.write_locally(mutations, Timestamp::now())?;
        let (tx, rx) = oneshot::channel();
        self.pending_writes.insert(result.batch_id, tx);
        debug!(batch_id = result.batch_id, documents = result.changes.len(), "write queued");

        if let Err(err) = self.emit_new_snapshots(&result.changes, None) {
            warn!(batch_id = result.batch_id, error = %err, "failed to update views after write");
        }
        match self.remote.fill_write_pipeline(&self.local) {
            Ok(outputs) => self.process_outputs(outputs),
            Err(err) => {
                warn!(batch_id = result.batch_id, error = %err, "failed to fill write pipeline");
            }
        }
        Ok((result.batch_id, rx))
    }

    /// Runs `query` against the cache only.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store fails.
    pub fn get_from_cache(&self, query: &Query) -> SyncResult<QuerySnapshot> {
        let result = self.local.execute_query(query, true)?;
        let changes = result
            .documents
            .iter()
            .map(|doc| DocumentViewChange {
                kind: ChangeType::Added,
                document: doc.clone(),
            })
            .collect();
        Ok(QuerySnapshot {
            query: query.clone(),
            has_pending_writes: result.documents.iter().any(Document::has_local_mutations),
            documents: result.documents,
            changes,
            from_cache: true,
            snapshot_version: self.local.last_remote_snapshot_version()?,
        })
    }

    /// Reads one document from the cache; `None` if it is not known to
    /// exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store fails.
    pub fn get_document_from_cache(&self, key: &DocumentKey) -> SyncResult<Option<Document>> {
        let doc = self.local.read_document(key)?;
        Ok(doc.is_found_document().then_some(doc))
    }

    /// Switches to another user. Pending writes of the previous user are
    /// cancelled and the streams restart with the new credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store cannot switch queues.
    pub fn handle_user_change(&mut self, user: User) -> SyncResult<()> {
        if *self.local.user() == user {
            return Ok(());
        }
        info!(from = %self.local.user(), to = %user, "user changed");
        for (batch_id, sender) in std::mem::take(&mut self.pending_writes) {
            debug!(batch_id, "cancelling write of previous user");
            let _ = sender.send(Err(SyncError::Cancelled("user changed".to_string())));
        }
        let result = self.local.handle_user_change(user)?;
        self.emit_new_snapshots(&result.affected_documents, None)?;
        let outputs = self.remote.restart_network(&self.local)?;
        self.process_outputs(outputs);
        Ok(())
    }

    /// Handles an event of either stream.
    pub fn handle_stream_event(&mut self, generation: u64, event: InboundEvent) {
        let result = match event {
            InboundEvent::Listen(event) => {
                let keys = EngineKeys {
                    views: &self.views,
                    queries_by_target: &self.queries_by_target,
                    limbo: &self.limbo,
                };
                self.remote
                    .handle_listen_event(generation, event, &self.local, &keys)
            }
            InboundEvent::Write(event) => {
                self.remote
                    .handle_write_event(generation, event, &self.local)
            }
        };
        match result {
            Ok(outputs) => self.process_outputs(outputs),
            Err(err) => warn!(error = %err, "failed to handle stream event"),
        }
    }

    /// Handles a fired timer.
    pub fn handle_timer(&mut self, token: TimerToken) {
        let outputs = self.remote.handle_timer(token);
        self.process_outputs(outputs);
    }

    fn process_outputs(&mut self, outputs: Vec<RemoteOutput>) {
        for output in outputs {
            let result = match output {
                RemoteOutput::Event(event) => self.apply_remote_event(event),
                RemoteOutput::RejectListen { target_id, status } => {
                    self.reject_listen(target_id, status)
                }
                RemoteOutput::WriteAcknowledged(result) => self.apply_successful_write(result),
                RemoteOutput::WriteRejected { batch_id, status } => {
                    self.reject_failed_write(batch_id, status)
                }
                RemoteOutput::WriteRetrying {
                    batch_id,
                    status,
                    attempts,
                } => {
                    self.emit(SyncEvent::WriteRetrying {
                        batch_id,
                        status,
                        attempts,
                    });
                    Ok(())
                }
                RemoteOutput::OnlineStateChanged(state) => {
                    self.apply_online_state_change(state);
                    Ok(())
                }
                RemoteOutput::AuthenticationFailed { stream, status } => {
                    let message = status.message.clone();
                    match stream {
                        StreamKind::Listen => self
                            .event_manager
                            .broadcast_error(|| SyncError::AuthenticationFailed(message.clone())),
                        StreamKind::Write => self.fail_pending_writes(&message),
                    }
                    self.emit(SyncEvent::AuthenticationFailed { stream, status });
                    Ok(())
                }
            };
            if let Err(err) = result {
                warn!(error = %err, "failed to apply remote output");
            }
        }
    }

    fn apply_remote_event(&mut self, event: RemoteEvent) -> SyncResult<()> {
        for (target_id, change) in &event.target_changes {
            let Some(resolution) = self.limbo.resolution_mut(*target_id) else {
                continue;
            };
            let touched = change.added_documents.len()
                + change.modified_documents.len()
                + change.removed_documents.len();
            if touched > 1 {
                warn!(target_id, "limbo target reported more than one document");
            }
            if !change.added_documents.is_empty() {
                resolution.received_document = true;
            } else if !change.removed_documents.is_empty() {
                resolution.received_document = false;
            }
        }

        let changes = self.local.apply_remote_event(&event)?;
        self.emit_new_snapshots(&changes, Some(&event))
    }

    fn reject_listen(&mut self, target_id: TargetId, status: Status) -> SyncResult<()> {
        if let Some(resolution) = self.limbo.resolution(target_id) {
            // The document cannot be read; treat it as deleted so views stop
            // waiting for it.
            let key = resolution.key.clone();
            self.limbo.forget(&key);
            self.pump_limbo_resolutions();
            let mut event = RemoteEvent::empty(SnapshotVersion::MIN);
            event.document_updates.insert(
                key.clone(),
                Document::new_no_document(key.clone(), SnapshotVersion::MIN),
            );
            event.resolved_limbo_documents.insert(key);
            return self.apply_remote_event(event);
        }

        let queries = self.queries_by_target.remove(&target_id).unwrap_or_default();
        self.local.release_target(target_id, false)?;
        self.remove_limbo_references(target_id);
        for query in queries {
            self.views.remove(&query);
            let status = status.clone();
            self.event_manager
                .on_listen_error(&query, || SyncError::Server(status.clone()));
        }
        Ok(())
    }

    fn apply_successful_write(&mut self, result: MutationBatchResult) -> SyncResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = self.local.acknowledge_batch(&result)?;
        if let Some(sender) = self.pending_writes.remove(&batch_id) {
            let _ = sender.send(Ok(()));
        }
        self.emit_new_snapshots(&changes, None)?;
        let outputs = self.remote.fill_write_pipeline(&self.local)?;
        self.process_outputs(outputs);
        Ok(())
    }

    /// Resolves every outstanding write with an auth error. The batches stay
    /// queued and are sent once the network is re-enabled.
    fn fail_pending_writes(&mut self, message: &str) {
        for (batch_id, sender) in std::mem::take(&mut self.pending_writes) {
            warn!(batch_id, "write stream could not authenticate");
            let _ = sender.send(Err(SyncError::AuthenticationFailed(message.to_string())));
        }
    }

    fn reject_failed_write(&mut self, batch_id: BatchId, status: Status) -> SyncResult<()> {
        warn!(batch_id, %status, "write rejected");
        let changes = self.local.reject_batch(batch_id)?;
        if let Some(sender) = self.pending_writes.remove(&batch_id) {
            let _ = sender.send(Err(SyncError::Server(status)));
        }
        self.emit_new_snapshots(&changes, None)?;
        let outputs = self.remote.fill_write_pipeline(&self.local)?;
        self.process_outputs(outputs);
        Ok(())
    }

    fn apply_online_state_change(&mut self, state: OnlineState) {
        let mut snapshots = Vec::new();
        for query_view in self.views.values_mut() {
            let change = query_view.view.apply_online_state_change(state);
            debug_assert!(change.limbo_changes.is_empty());
            snapshots.extend(change.snapshot);
        }
        self.event_manager.on_view_snapshots(snapshots);
        self.event_manager.on_online_state_change(state);
        self.emit(SyncEvent::OnlineStateChanged(state));
    }

    fn emit_new_snapshots(
        &mut self,
        changes: &DocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> SyncResult<()> {
        let mut snapshots = Vec::new();
        let mut view_changes = Vec::new();
        let mut limbo_changes = Vec::new();

        for (query, query_view) in &mut self.views {
            let mut computed = query_view.view.compute_doc_changes(changes, None);
            if computed.needs_refill {
                // The limit edge moved; recompute from the full local result.
                let result = self.local.execute_query(query, false)?;
                computed = query_view
                    .view
                    .compute_doc_changes(&to_document_map(&result.documents), Some(computed));
            }
            let target_change =
                remote_event.and_then(|event| event.target_changes.get(&query_view.target_id));
            let pending_reset = remote_event
                .is_some_and(|event| event.target_mismatches.contains_key(&query_view.target_id));
            if let Some(event) = remote_event {
                query_view.view.advance_snapshot_version(event.snapshot_version);
            }
            let change = query_view
                .view
                .apply_changes(computed, true, target_change, pending_reset);
            limbo_changes.push((query_view.target_id, change.limbo_changes));

            if let Some(snapshot) = change.snapshot {
                view_changes.push(local_view_changes(query_view.target_id, &snapshot));
                snapshots.push(snapshot);
            }
        }

        self.event_manager.on_view_snapshots(snapshots);
        self.local.notify_local_view_changes(&view_changes);
        for (target_id, changes) in limbo_changes {
            self.update_tracked_limbos(target_id, changes);
        }
        self.pump_limbo_resolutions();
        Ok(())
    }

    fn update_tracked_limbos(&mut self, target_id: TargetId, changes: Vec<LimboDocumentChange>) {
        for change in changes {
            match change {
                LimboDocumentChange::Added(key) => self.limbo.add_reference(key, target_id),
                LimboDocumentChange::Removed(key) => {
                    debug!(%key, "document left limbo");
                    if let Some(limbo_target) = self.limbo.remove_reference(&key, target_id) {
                        let outputs = self.remote.unlisten(limbo_target);
                        self.process_outputs(outputs);
                    }
                }
            }
        }
    }

    fn remove_limbo_references(&mut self, target_id: TargetId) {
        for limbo_target in self.limbo.remove_target_references(target_id) {
            let outputs = self.remote.unlisten(limbo_target);
            self.process_outputs(outputs);
        }
        self.pump_limbo_resolutions();
    }

    fn pump_limbo_resolutions(&mut self) {
        while let Some((key, target_id)) = self.limbo.next_to_start() {
            debug!(%key, target_id, "resolving limbo document");
            let target_data =
                TargetData::new(Target::for_document(&key), target_id, TargetPurpose::LimboResolution);
            let keys = EngineKeys {
                views: &self.views,
                queries_by_target: &self.queries_by_target,
                limbo: &self.limbo,
            };
            let outputs = self.remote.listen(target_data, &keys);
            self.process_outputs(outputs);
        }
    }
}

fn to_document_map(documents: &DocumentSet) -> DocumentMap {
    documents
        .iter()
        .map(|doc| (doc.key().clone(), doc.clone()))
        .collect()
}

fn local_view_changes(target_id: TargetId, snapshot: &ViewSnapshot) -> LocalViewChanges {
    let mut changes = LocalViewChanges {
        target_id,
        from_cache: snapshot.from_cache,
        ..LocalViewChanges::default()
    };
    for change in &snapshot.changes {
        match change.kind {
            ChangeType::Added => {
                changes.added_keys.insert(change.document.key().clone());
            }
            ChangeType::Removed => {
                changes.removed_keys.insert(change.document.key().clone());
            }
            ChangeType::Modified | ChangeType::Metadata => {}
        }
    }
    changes
}
