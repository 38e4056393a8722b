//! Fan-out of view snapshots to query listeners.
//!
//! Every query has one view in the sync engine no matter how many listeners
//! share it. The event manager keeps the listeners of each query, applies
//! their options and decides which snapshots they actually see.

use crate::error::{SyncError, SyncResult};
use crate::online_state::OnlineState;
use crate::view::{ChangeType, DocumentViewChange, ViewSnapshot};
use docsync_model::{Document, DocumentKey, DocumentSet, Query, SnapshotVersion};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// Identifies one listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Options for a listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots in which only metadata changed, e.g. `from_cache` or
    /// pending writes.
    pub include_metadata_changes: bool,
    /// Hold back from-cache snapshots while the client may be online.
    pub wait_for_sync_when_online: bool,
}

impl ListenOptions {
    /// Sets whether metadata-only snapshots are raised.
    pub fn with_metadata_changes(mut self, include: bool) -> Self {
        self.include_metadata_changes = include;
        self
    }

    /// Sets whether from-cache snapshots wait for the backend while online.
    pub fn with_wait_for_sync_when_online(mut self, wait: bool) -> Self {
        self.wait_for_sync_when_online = wait;
        self
    }
}

/// What a listener receives.
#[derive(Debug, Clone)]
pub struct QuerySnapshot {
    /// The query.
    pub query: Query,
    /// Matching documents in query order.
    pub documents: DocumentSet,
    /// Changes since the previous snapshot of this listener.
    pub changes: Vec<DocumentViewChange>,
    /// Whether the result may not match the backend.
    pub from_cache: bool,
    /// Whether any document has writes not yet acknowledged.
    pub has_pending_writes: bool,
    /// Latest remote snapshot version reflected.
    pub snapshot_version: SnapshotVersion,
}

impl QuerySnapshot {
    /// Number of documents.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Returns true if no document matches.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Looks up a document of the result.
    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.documents.get(key)
    }

    /// Document ids in query order.
    pub fn document_ids(&self) -> Vec<String> {
        self.documents
            .keys()
            .map(|key| key.document_id().to_string())
            .collect()
    }
}

impl From<ViewSnapshot> for QuerySnapshot {
    fn from(snapshot: ViewSnapshot) -> Self {
        Self {
            has_pending_writes: snapshot.has_pending_writes(),
            query: snapshot.query,
            documents: snapshot.documents,
            changes: snapshot.changes,
            from_cache: snapshot.from_cache,
            snapshot_version: snapshot.snapshot_version,
        }
    }
}

/// Where a listener's snapshots go.
pub type SnapshotSender = UnboundedSender<SyncResult<QuerySnapshot>>;

/// One registered listener.
pub(crate) struct QueryListener {
    id: ListenerId,
    query: Query,
    options: ListenOptions,
    sender: SnapshotSender,
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl QueryListener {
    pub(crate) fn new(id: ListenerId, query: Query, options: ListenOptions, sender: SnapshotSender) -> Self {
        Self {
            id,
            query,
            options,
            sender,
            raised_initial_event: false,
            snapshot: None,
            online_state: OnlineState::Unknown,
        }
    }

    /// Returns true if a snapshot was raised.
    fn on_view_snapshot(&mut self, mut snapshot: ViewSnapshot) -> bool {
        if !self.options.include_metadata_changes {
            snapshot
                .changes
                .retain(|change| change.kind != ChangeType::Metadata);
            snapshot.excludes_metadata_changes = true;
        }

        let raised = if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                self.raise_initial_event(&snapshot);
                true
            } else {
                false
            }
        } else if self.should_raise_event(&snapshot) {
            self.raise(snapshot.clone());
            true
        } else {
            false
        };
        self.snapshot = Some(snapshot);
        raised
    }

    fn on_online_state_change(&mut self, state: OnlineState) -> bool {
        self.online_state = state;
        let Some(snapshot) = self.snapshot.clone() else {
            return false;
        };
        if !self.raised_initial_event && self.should_raise_initial_event(&snapshot, state) {
            self.raise_initial_event(&snapshot);
            return true;
        }
        false
    }

    fn on_error(&self, error: SyncError) {
        if self.sender.send(Err(error)).is_err() {
            debug!(listener = %self.id, "listener detached, dropping error");
        }
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // An empty cached result is only worth showing once the backend is
        // known to be unreachable.
        !snapshot.documents.is_empty()
            || snapshot.has_cached_results
            || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snapshot
            .as_ref()
            .is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot) {
        let initial = ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.documents.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
            snapshot.has_cached_results,
            snapshot.snapshot_version,
        );
        self.raised_initial_event = true;
        self.raise(initial);
    }

    fn raise(&self, snapshot: ViewSnapshot) {
        if self.sender.send(Ok(snapshot.into())).is_err() {
            debug!(listener = %self.id, "listener detached, dropping snapshot");
        }
    }
}

#[derive(Default)]
struct QueryListeners {
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<QueryListener>,
}

/// Routes view snapshots, errors and online state to listeners.
pub(crate) struct EventManager {
    queries: HashMap<Query, QueryListeners>,
    query_by_listener: HashMap<ListenerId, Query>,
    online_state: OnlineState,
}

impl EventManager {
    pub(crate) fn new() -> Self {
        Self {
            queries: HashMap::new(),
            query_by_listener: HashMap::new(),
            online_state: OnlineState::Unknown,
        }
    }

    /// Registers a listener. Returns true if it is the first one for its
    /// query, i.e. the caller has to create the view.
    pub(crate) fn listen(&mut self, mut listener: QueryListener) -> bool {
        let query = listener.query.clone();
        let entry = self.queries.entry(query.clone()).or_default();
        let first = entry.listeners.is_empty();

        listener.on_online_state_change(self.online_state);
        if let Some(snapshot) = entry.view_snapshot.clone() {
            listener.on_view_snapshot(snapshot);
        }
        self.query_by_listener.insert(listener.id, query);
        entry.listeners.push(listener);
        first
    }

    /// Removes a listener. Returns its query if no listener is left for it.
    /// Unknown ids are ignored.
    pub(crate) fn unlisten(&mut self, id: ListenerId) -> Option<Query> {
        let query = self.query_by_listener.remove(&id)?;
        let entry = self.queries.get_mut(&query)?;
        entry.listeners.retain(|listener| listener.id != id);
        if entry.listeners.is_empty() {
            self.queries.remove(&query);
            return Some(query);
        }
        None
    }

    /// Hands new view snapshots to their listeners.
    pub(crate) fn on_view_snapshots(&mut self, snapshots: Vec<ViewSnapshot>) {
        for snapshot in snapshots {
            let Some(entry) = self.queries.get_mut(&snapshot.query) else {
                continue;
            };
            for listener in &mut entry.listeners {
                listener.on_view_snapshot(snapshot.clone());
            }
            entry.view_snapshot = Some(snapshot);
        }
    }

    /// Fails every listener of `query` and forgets them.
    pub(crate) fn on_listen_error(&mut self, query: &Query, error: impl Fn() -> SyncError) {
        let Some(entry) = self.queries.remove(query) else {
            return;
        };
        for listener in entry.listeners {
            self.query_by_listener.remove(&listener.id);
            listener.on_error(error());
        }
    }

    /// Sends an error to every listener without detaching them.
    pub(crate) fn broadcast_error(&self, error: impl Fn() -> SyncError) {
        for entry in self.queries.values() {
            for listener in &entry.listeners {
                listener.on_error(error());
            }
        }
    }

    pub(crate) fn on_online_state_change(&mut self, state: OnlineState) {
        self.online_state = state;
        for entry in self.queries.values_mut() {
            for listener in &mut entry.listeners {
                listener.on_online_state_change(state);
            }
        }
    }

    /// Number of listeners across all queries.
    pub(crate) fn listener_count(&self) -> usize {
        self.query_by_listener.len()
    }
}
