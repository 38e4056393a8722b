//! Drives a [`SyncEngine`] against a loopback backend without a runtime.

#![allow(dead_code)]

use docsync_engine::{
    loopback, CredentialsProvider, Dispatcher, EmptyCredentials, InboundEvent, ListenOptions,
    ListenerId, LoopbackServer, ManualScheduler, QuerySnapshot, SyncConfig, SyncEngine,
    SyncResult, TimerId,
};
use docsync_model::{
    BatchId, DocumentKey, Mutation, MutationResult, Query, SnapshotVersion, Target, TargetId, User,
};
use docsync_protocol::{ListenRequest, Status, WatchChange, WriteRequest, WriteResponse};
use docsync_testkit::init_tracing;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

pub type Inbox = Arc<Mutex<Vec<(u64, InboundEvent)>>>;

pub struct Harness {
    pub engine: SyncEngine,
    pub server: LoopbackServer,
    pub scheduler: ManualScheduler,
    inbox: Inbox,
}

impl Harness {
    /// An engine with the network enabled.
    pub fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    pub fn with_config(config: SyncConfig) -> Self {
        Self::with_credentials(config, Box::new(EmptyCredentials))
    }

    pub fn with_credentials(config: SyncConfig, credentials: Box<dyn CredentialsProvider>) -> Self {
        init_tracing();
        let (connection, server) = loopback();
        let scheduler = ManualScheduler::new();
        let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&inbox);
        let dispatcher: Dispatcher = Arc::new(move |generation: u64, event: InboundEvent| {
            sink.lock().push((generation, event));
        });
        let engine = SyncEngine::open(
            &config,
            User::unauthenticated(),
            Box::new(connection),
            credentials,
            Box::new(scheduler.clone()),
            dispatcher,
        )
        .unwrap();
        let mut harness = Self {
            engine,
            server,
            scheduler,
            inbox,
        };
        harness.engine.enable_network().unwrap();
        harness.pump();
        harness
    }

    /// An engine with the network disabled.
    pub fn offline() -> Self {
        let mut harness = Self::new();
        harness.engine.disable_network();
        harness.pump();
        harness
    }

    /// Delivers queued stream events until none are left.
    pub fn pump(&mut self) {
        loop {
            let events = std::mem::take(&mut *self.inbox.lock());
            if events.is_empty() {
                break;
            }
            for (generation, event) in events {
                self.engine.handle_stream_event(generation, event);
            }
        }
    }

    /// Fires a pending timer.
    pub fn fire(&mut self, id: TimerId) {
        let token = self
            .scheduler
            .take(id)
            .unwrap_or_else(|| panic!("timer {id:?} is not scheduled"));
        self.engine.handle_timer(token);
        self.pump();
    }

    pub fn listen(
        &mut self,
        query: Query,
        options: ListenOptions,
    ) -> (ListenerId, mpsc::UnboundedReceiver<SyncResult<QuerySnapshot>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.engine.listen(query, options, tx).unwrap();
        self.pump();
        (id, rx)
    }

    /// Listens and returns the target the backend was asked to watch.
    pub fn listen_target(
        &mut self,
        query: Query,
    ) -> (TargetId, mpsc::UnboundedReceiver<SyncResult<QuerySnapshot>>) {
        self.listen_target_with(query, ListenOptions::default())
    }

    pub fn listen_target_with(
        &mut self,
        query: Query,
        options: ListenOptions,
    ) -> (TargetId, mpsc::UnboundedReceiver<SyncResult<QuerySnapshot>>) {
        let (_, rx) = self.listen(query.clone(), options);
        let expected = query.to_target();
        let target_id = self
            .added_targets()
            .into_iter()
            .find(|(_, target)| *target == expected)
            .map(|(target_id, _)| target_id)
            .expect("no AddTarget for the query");
        (target_id, rx)
    }

    /// AddTarget requests received since the last call.
    pub fn added_targets(&mut self) -> Vec<(TargetId, Target)> {
        self.server
            .drain_listen_requests()
            .into_iter()
            .filter_map(|request| match request {
                ListenRequest::AddTarget {
                    target_id, target, ..
                } => Some((target_id, target)),
                ListenRequest::RemoveTarget { .. } => None,
            })
            .collect()
    }

    pub fn send(&mut self, change: WatchChange) {
        assert!(
            self.server.send_watch_change(change),
            "listen stream is not open"
        );
        self.pump();
    }

    pub fn send_all(&mut self, changes: Vec<WatchChange>) {
        for change in changes {
            self.send(change);
        }
    }

    pub fn write(&mut self, mutations: Vec<Mutation>) -> (BatchId, oneshot::Receiver<SyncResult<()>>) {
        let result = self.engine.write(mutations).unwrap();
        self.pump();
        result
    }

    /// Answers the write stream handshake; returns the mutations of every
    /// write sent after it.
    pub fn complete_handshake(&mut self) -> Vec<Vec<Mutation>> {
        let requests = self.server.drain_write_requests();
        assert_eq!(requests.first(), Some(&WriteRequest::Handshake));
        self.respond(WriteResponse {
            stream_token: b"handshake".to_vec(),
            commit_version: SnapshotVersion::MIN,
            results: Vec::new(),
        });
        self.sent_writes()
    }

    /// Mutations of the write requests received since the last call.
    pub fn sent_writes(&mut self) -> Vec<Vec<Mutation>> {
        self.server
            .drain_write_requests()
            .into_iter()
            .filter_map(|request| match request {
                WriteRequest::Write { mutations, .. } => Some(mutations),
                WriteRequest::Handshake => None,
            })
            .collect()
    }

    /// Acknowledges the oldest write in flight with `mutation_count` results.
    pub fn acknowledge(&mut self, commit_millis: i64, mutation_count: usize) {
        let commit_version = SnapshotVersion::from_millis(commit_millis);
        self.respond(WriteResponse {
            stream_token: format!("ack-{commit_millis}").into_bytes(),
            commit_version,
            results: vec![MutationResult::new(commit_version); mutation_count],
        });
    }

    pub fn respond(&mut self, response: WriteResponse) {
        assert!(
            self.server.send_write_response(response),
            "write stream is not open"
        );
        self.pump();
    }

    pub fn fail_write_stream(&mut self, status: Status) {
        assert!(self.server.close_write_stream(status));
        self.pump();
    }

    pub fn fail_listen_stream(&mut self, status: Status) {
        assert!(self.server.close_listen_stream(status));
        self.pump();
    }
}

/// Snapshots delivered so far; panics on errors.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<SyncResult<QuerySnapshot>>) -> Vec<QuerySnapshot> {
    let mut snapshots = Vec::new();
    while let Ok(result) = rx.try_recv() {
        snapshots.push(result.unwrap());
    }
    snapshots
}

/// The most recent snapshot delivered so far.
pub fn latest(rx: &mut mpsc::UnboundedReceiver<SyncResult<QuerySnapshot>>) -> QuerySnapshot {
    drain(rx).pop().expect("no snapshot was raised")
}

pub fn ids(keys: &[DocumentKey]) -> Vec<String> {
    keys.iter().map(|key| key.document_id().to_string()).collect()
}
