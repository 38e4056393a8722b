//! The remote channel manager.
//!
//! Owns the listen and write streams and everything needed to drive them:
//! the targets being listened to, the watch change aggregator, the pipeline
//! of writes in flight and the online state. It never touches views or
//! pending write senders; instead every entry point returns the
//! [`RemoteOutput`]s the sync engine has to act on.

use crate::config::SyncConfig;
use crate::connection::{
    Connection, CredentialsProvider, Dispatcher, InboundEvent, StreamEvent, StreamKind,
    StreamSink,
};
use crate::error::SyncResult;
use crate::online_state::{OnlineState, OnlineStateTracker};
use crate::scheduler::{Scheduler, TimerId, TimerToken, Timers};
use crate::stream::{CloseOutcome, PersistentStream, StreamState};
use docsync_local::LocalStore;
use docsync_model::{
    BatchId, DatabaseId, DocumentKeySet, ModelError, Mutation, MutationBatch, MutationBatchResult,
    SnapshotVersion, TargetData, TargetId, BATCH_ID_UNKNOWN,
};
use docsync_protocol::{
    Code, ListenRequest, ProtocolError, RemoteEvent, ResumeFrom, Status, TargetMetadataProvider,
    WatchChange, WatchChangeAggregator, WatchTargetChangeState, WriteRequest, WriteResponse,
};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Maximum number of batches sent to the backend without an acknowledgement.
pub const MAX_PENDING_WRITES: usize = 10;

/// Keys the sync engine considers synced for a target.
pub trait RemoteKeys {
    /// Keys of documents the backend has confirmed for `target_id`.
    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;
}

/// Something the sync engine must act on.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutput {
    /// A consistent snapshot from the listen stream.
    Event(RemoteEvent),
    /// The backend refused to serve a target.
    RejectListen {
        /// The refused target.
        target_id: TargetId,
        /// Why.
        status: Status,
    },
    /// A batch was committed.
    WriteAcknowledged(MutationBatchResult),
    /// A batch failed permanently or ran out of retries.
    WriteRejected {
        /// The failed batch.
        batch_id: BatchId,
        /// Why.
        status: Status,
    },
    /// A batch failed transiently and stays queued.
    WriteRetrying {
        /// The batch at the head of the pipeline.
        batch_id: BatchId,
        /// The transient failure.
        status: Status,
        /// Consecutive failures so far.
        attempts: u32,
    },
    /// The online state changed.
    OnlineStateChanged(OnlineState),
    /// A stream was stopped after its credentials were rejected twice.
    AuthenticationFailed {
        /// The stream.
        stream: StreamKind,
        /// The final rejection.
        status: Status,
    },
}

struct TargetMetadata<'a> {
    listen_targets: &'a BTreeMap<TargetId, TargetData>,
    keys: &'a dyn RemoteKeys,
}

impl TargetMetadataProvider for TargetMetadata<'_> {
    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        self.keys.remote_keys_for_target(target_id)
    }

    fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.listen_targets.get(&target_id).cloned()
    }
}

/// Drives the listen and write streams.
pub struct RemoteStore {
    database_id: DatabaseId,
    connection: Box<dyn Connection>,
    credentials: Box<dyn CredentialsProvider>,
    dispatcher: Dispatcher,
    timers: Timers,
    listen_stream: PersistentStream<ListenRequest>,
    write_stream: PersistentStream<WriteRequest>,
    aggregator: WatchChangeAggregator,
    listen_targets: BTreeMap<TargetId, TargetData>,
    write_pipeline: VecDeque<MutationBatch>,
    write_stream_token: Vec<u8>,
    handshake_complete: bool,
    write_failures: u32,
    write_retry_limit: Option<u32>,
    online: OnlineStateTracker,
    network_enabled: bool,
}

impl fmt::Debug for RemoteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStore")
            .field("listen_stream", &self.listen_stream.state())
            .field("write_stream", &self.write_stream.state())
            .field("listen_targets", &self.listen_targets.len())
            .field("write_pipeline", &self.write_pipeline.len())
            .field("online_state", &self.online.state())
            .field("network_enabled", &self.network_enabled)
            .finish()
    }
}

impl RemoteStore {
    /// Creates a remote store with the network disabled.
    pub fn new(
        config: &SyncConfig,
        connection: Box<dyn Connection>,
        credentials: Box<dyn CredentialsProvider>,
        scheduler: Box<dyn Scheduler>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            database_id: config.database_id.clone(),
            connection,
            credentials,
            dispatcher,
            timers: Timers::new(scheduler),
            listen_stream: PersistentStream::new(
                StreamKind::Listen,
                config.backoff.clone(),
                config.idle_stream_timeout,
            ),
            write_stream: PersistentStream::new(
                StreamKind::Write,
                config.backoff.clone(),
                config.idle_stream_timeout,
            ),
            aggregator: WatchChangeAggregator::new(config.database_id.clone()),
            listen_targets: BTreeMap::new(),
            write_pipeline: VecDeque::new(),
            write_stream_token: Vec::new(),
            handshake_complete: false,
            write_failures: 0,
            write_retry_limit: config.write_retry_limit,
            online: OnlineStateTracker::new(
                config.max_watch_stream_failures,
                config.online_state_timeout,
            ),
            network_enabled: false,
        }
    }

    /// Current online state.
    pub fn online_state(&self) -> OnlineState {
        self.online.state()
    }

    /// State of the listen stream.
    pub fn listen_stream_state(&self) -> StreamState {
        self.listen_stream.state()
    }

    /// State of the write stream.
    pub fn write_stream_state(&self) -> StreamState {
        self.write_stream.state()
    }

    /// Returns true if `target_id` is being listened to.
    pub fn is_listening(&self, target_id: TargetId) -> bool {
        self.listen_targets.contains_key(&target_id)
    }

    /// Ids of all listened targets.
    pub fn listen_target_ids(&self) -> Vec<TargetId> {
        self.listen_targets.keys().copied().collect()
    }

    /// Number of batches sent or waiting to be sent.
    pub fn write_pipeline_len(&self) -> usize {
        self.write_pipeline.len()
    }

    /// Returns true while the network is enabled.
    pub fn is_network_enabled(&self) -> bool {
        self.network_enabled
    }

    fn can_use_network(&self) -> bool {
        self.network_enabled
    }

    fn should_start_listen_stream(&self) -> bool {
        self.can_use_network() && self.listen_stream.can_start() && !self.listen_targets.is_empty()
    }

    fn should_start_write_stream(&self) -> bool {
        self.can_use_network() && self.write_stream.can_start() && !self.write_pipeline.is_empty()
    }

    fn push_online_change(change: Option<OnlineState>, out: &mut Vec<RemoteOutput>) {
        if let Some(state) = change {
            out.push(RemoteOutput::OnlineStateChanged(state));
        }
    }

    /// Enables the network and starts whichever streams have work.
    pub fn enable_network(&mut self, local: &LocalStore) -> SyncResult<Vec<RemoteOutput>> {
        let mut out = Vec::new();
        self.network_enabled = true;
        self.listen_stream.reset_auth_failures();
        self.write_stream.reset_auth_failures();

        if self.should_start_listen_stream() {
            self.start_listen_stream(&mut out);
        } else {
            let change = self.online.set(OnlineState::Unknown, &mut self.timers);
            Self::push_online_change(change, &mut out);
        }
        out.extend(self.fill_write_pipeline(local)?);
        Ok(out)
    }

    /// Stops both streams and reports the client offline.
    pub fn disable_network(&mut self) -> Vec<RemoteOutput> {
        let mut out = Vec::new();
        self.network_enabled = false;
        self.disable_network_internal();
        let change = self.online.set(OnlineState::Offline, &mut self.timers);
        Self::push_online_change(change, &mut out);
        out
    }

    fn disable_network_internal(&mut self) {
        self.write_stream.stop(&mut self.timers);
        self.listen_stream.stop(&mut self.timers);
        if !self.write_pipeline.is_empty() {
            debug!(
                pending = self.write_pipeline.len(),
                "dropping write pipeline; batches stay queued locally"
            );
            self.write_pipeline.clear();
        }
        self.handshake_complete = false;
        self.write_failures = 0;
        self.aggregator = WatchChangeAggregator::new(self.database_id.clone());
    }

    /// Restarts both streams, e.g. after the user changed.
    pub fn restart_network(&mut self, local: &LocalStore) -> SyncResult<Vec<RemoteOutput>> {
        if !self.network_enabled {
            return Ok(Vec::new());
        }
        info!("restarting streams");
        self.disable_network_internal();
        self.write_stream_token.clear();
        let mut out = Vec::new();
        let change = self.online.set(OnlineState::Unknown, &mut self.timers);
        Self::push_online_change(change, &mut out);
        out.extend(self.enable_network(local)?);
        Ok(out)
    }

    /// Stops everything for good.
    pub fn shutdown(&mut self) {
        self.network_enabled = false;
        self.disable_network_internal();
        self.timers.cancel_all();
    }

    /// Starts listening to a target.
    pub fn listen(&mut self, target_data: TargetData, keys: &dyn RemoteKeys) -> Vec<RemoteOutput> {
        let mut out = Vec::new();
        let target_id = target_data.target_id;
        if self.listen_targets.contains_key(&target_id) {
            return out;
        }
        debug!(target_id, purpose = ?target_data.purpose, "listen");
        self.listen_targets.insert(target_id, target_data.clone());

        if self.should_start_listen_stream() {
            self.start_listen_stream(&mut out);
        } else if self.listen_stream.is_open() {
            self.send_watch_request(target_data, keys);
        }
        out
    }

    /// Stops listening to a target.
    pub fn unlisten(&mut self, target_id: TargetId) -> Vec<RemoteOutput> {
        let mut out = Vec::new();
        if self.listen_targets.remove(&target_id).is_none() {
            return out;
        }
        debug!(target_id, "unlisten");
        if self.listen_stream.is_open() {
            self.send_unwatch_request(target_id);
        }
        if self.listen_targets.is_empty() {
            if self.listen_stream.is_open() {
                self.listen_stream.mark_idle(&mut self.timers);
            } else if self.can_use_network() {
                // Without targets nothing can prove the stream healthy.
                let change = self.online.set(OnlineState::Unknown, &mut self.timers);
                Self::push_online_change(change, &mut out);
            }
        }
        out
    }

    fn send_watch_request(&mut self, target_data: TargetData, keys: &dyn RemoteKeys) {
        let target_id = target_data.target_id;
        self.aggregator.record_pending_target_request(target_id);

        let resume = if !target_data.resume_token.is_empty() {
            ResumeFrom::Token(target_data.resume_token.clone())
        } else if target_data.snapshot_version > SnapshotVersion::MIN {
            ResumeFrom::ReadTime(target_data.snapshot_version)
        } else {
            ResumeFrom::None
        };
        let expected_count = match resume {
            ResumeFrom::None => None,
            _ => Some(
                i32::try_from(keys.remote_keys_for_target(target_id).len()).unwrap_or(i32::MAX),
            ),
        };

        self.listen_stream.send(
            ListenRequest::AddTarget {
                target_id,
                target: target_data.target,
                resume,
                expected_count,
            },
            &mut self.timers,
        );
    }

    fn send_unwatch_request(&mut self, target_id: TargetId) {
        self.aggregator.record_pending_target_request(target_id);
        self.listen_stream
            .send(ListenRequest::RemoveTarget { target_id }, &mut self.timers);
    }

    fn start_listen_stream(&mut self, out: &mut Vec<RemoteOutput>) {
        self.aggregator = WatchChangeAggregator::new(self.database_id.clone());
        let change = self.online.handle_watch_stream_start(&mut self.timers);
        Self::push_online_change(change, out);
        if self.listen_stream.start(&mut self.timers) {
            self.open_listen_stream(out);
        }
    }

    fn open_listen_stream(&mut self, out: &mut Vec<RemoteOutput>) {
        let generation = self.listen_stream.begin_open(&mut self.timers);
        match self.credentials.get_token() {
            Ok(token) => {
                let dispatcher = Arc::clone(&self.dispatcher);
                let sink = StreamSink::new(move |event| {
                    dispatcher(generation, InboundEvent::Listen(event));
                });
                let handle = self.connection.open_listen_stream(token, sink);
                self.listen_stream.attach(handle);
            }
            Err(status) => {
                warn!(stream = "listen", %status, "failed to get credentials");
                self.on_listen_stream_close(generation, status, out);
            }
        }
    }

    fn start_write_stream(&mut self, out: &mut Vec<RemoteOutput>) {
        if self.write_stream.start(&mut self.timers) {
            self.open_write_stream(out);
        }
    }

    fn open_write_stream(&mut self, out: &mut Vec<RemoteOutput>) {
        let generation = self.write_stream.begin_open(&mut self.timers);
        self.handshake_complete = false;
        match self.credentials.get_token() {
            Ok(token) => {
                let dispatcher = Arc::clone(&self.dispatcher);
                let sink = StreamSink::new(move |event| {
                    dispatcher(generation, InboundEvent::Write(event));
                });
                let handle = self.connection.open_write_stream(token, sink);
                self.write_stream.attach(handle);
            }
            Err(status) => {
                warn!(stream = "write", %status, "failed to get credentials");
                if let Err(err) = self.on_write_stream_close(generation, status, None, out) {
                    warn!(stream = "write", error = %err, "failed to handle close");
                }
            }
        }
    }

    /// Handles an event of the listen stream.
    pub fn handle_listen_event(
        &mut self,
        generation: u64,
        event: StreamEvent<WatchChange>,
        local: &LocalStore,
        keys: &dyn RemoteKeys,
    ) -> SyncResult<Vec<RemoteOutput>> {
        let mut out = Vec::new();
        match event {
            StreamEvent::Open => {
                if self.listen_stream.on_open(generation) {
                    let targets: Vec<TargetData> = self.listen_targets.values().cloned().collect();
                    for target_data in targets {
                        self.send_watch_request(target_data, keys);
                    }
                }
            }
            StreamEvent::Message(change) => {
                if self.listen_stream.accepts_message(generation) {
                    self.listen_stream.on_message();
                    let online = self.online.set(OnlineState::Online, &mut self.timers);
                    Self::push_online_change(online, &mut out);
                    self.handle_watch_change(change, local, keys, &mut out)?;
                }
            }
            StreamEvent::Close(status) => self.on_listen_stream_close(generation, status, &mut out),
        }
        Ok(out)
    }

    fn handle_watch_change(
        &mut self,
        change: WatchChange,
        local: &LocalStore,
        keys: &dyn RemoteKeys,
        out: &mut Vec<RemoteOutput>,
    ) -> SyncResult<()> {
        let snapshot_version = change.snapshot_version();

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == WatchTargetChangeState::Removed {
                if let Some(cause) = &target_change.cause {
                    for target_id in &target_change.target_ids {
                        if self.listen_targets.remove(target_id).is_some() {
                            warn!(target_id, status = %cause, "listen rejected");
                            self.aggregator.remove_target(*target_id);
                            out.push(RemoteOutput::RejectListen {
                                target_id: *target_id,
                                status: cause.clone(),
                            });
                        }
                    }
                    return Ok(());
                }
            }
        }

        let provider = TargetMetadata {
            listen_targets: &self.listen_targets,
            keys,
        };
        match change {
            WatchChange::TargetChange(target_change) => {
                self.aggregator.handle_target_change(&provider, &target_change);
            }
            WatchChange::DocumentChange(document_change) => {
                self.aggregator
                    .handle_document_change(&provider, document_change);
            }
            WatchChange::DocumentDelete(delete) => {
                self.aggregator.handle_document_delete(&provider, delete);
            }
            WatchChange::DocumentRemove(remove) => {
                self.aggregator.handle_document_remove(&provider, remove);
            }
            WatchChange::ExistenceFilter(filter) => {
                let target_id = filter.target_id;
                if let Some(outcome) = self.aggregator.handle_existence_filter(&provider, filter) {
                    debug!(target_id, ?outcome, "applied existence filter");
                }
            }
        }

        if snapshot_version != SnapshotVersion::MIN {
            let last_remote_version = local.last_remote_snapshot_version()?;
            if snapshot_version >= last_remote_version {
                let event = self.aggregator.create_remote_event(
                    &TargetMetadata {
                        listen_targets: &self.listen_targets,
                        keys,
                    },
                    snapshot_version,
                );
                self.raise_remote_event(event, keys, out);
            } else {
                debug!(%snapshot_version, %last_remote_version, "ignoring stale snapshot");
            }
        }
        Ok(())
    }

    fn raise_remote_event(&mut self, event: RemoteEvent, keys: &dyn RemoteKeys, out: &mut Vec<RemoteOutput>) {
        for (target_id, change) in &event.target_changes {
            if change.resume_token.is_empty() {
                continue;
            }
            if let Some(target_data) = self.listen_targets.get_mut(target_id) {
                *target_data =
                    target_data.with_resume_token(change.resume_token.clone(), event.snapshot_version);
            }
        }

        for (target_id, purpose) in &event.target_mismatches {
            let Some(target_data) = self.listen_targets.get(target_id).cloned() else {
                continue;
            };
            // Resume from scratch; the old token would replay the drift.
            self.listen_targets.insert(
                *target_id,
                target_data.with_resume_token(Vec::new(), target_data.snapshot_version),
            );
            self.send_unwatch_request(*target_id);
            let request = TargetData::new(target_data.target.clone(), *target_id, *purpose);
            self.send_watch_request(request, keys);
        }

        out.push(RemoteOutput::Event(event));
    }

    fn on_listen_stream_close(&mut self, generation: u64, status: Status, out: &mut Vec<RemoteOutput>) {
        let Some(outcome) = self
            .listen_stream
            .on_close(generation, &status, &mut self.timers)
        else {
            return;
        };
        self.aggregator = WatchChangeAggregator::new(self.database_id.clone());

        match outcome {
            CloseOutcome::AuthenticationFailed => {
                let change = self.online.set(OnlineState::Offline, &mut self.timers);
                Self::push_online_change(change, out);
                out.push(RemoteOutput::AuthenticationFailed {
                    stream: StreamKind::Listen,
                    status,
                });
                return;
            }
            CloseOutcome::InvalidateToken => self.credentials.invalidate_token(),
            CloseOutcome::Closed => {}
        }

        if self.should_start_listen_stream() {
            if !status.is_ok() {
                let change = self.online.handle_watch_stream_failure(&mut self.timers);
                Self::push_online_change(change, out);
            }
            self.start_listen_stream(out);
        } else {
            let change = self.online.set(OnlineState::Unknown, &mut self.timers);
            Self::push_online_change(change, out);
        }
    }

    /// Handles an event of the write stream.
    pub fn handle_write_event(
        &mut self,
        generation: u64,
        event: StreamEvent<WriteResponse>,
        local: &LocalStore,
    ) -> SyncResult<Vec<RemoteOutput>> {
        let mut out = Vec::new();
        match event {
            StreamEvent::Open => {
                if self.write_stream.on_open(generation) {
                    self.write_stream
                        .send(WriteRequest::Handshake, &mut self.timers);
                }
            }
            StreamEvent::Message(response) => {
                if self.write_stream.accepts_message(generation) {
                    self.handle_write_response(response, local, &mut out)?;
                }
            }
            StreamEvent::Close(status) => {
                self.on_write_stream_close(generation, status, Some(local), &mut out)?;
            }
        }
        Ok(out)
    }

    fn handle_write_response(
        &mut self,
        response: WriteResponse,
        local: &LocalStore,
        out: &mut Vec<RemoteOutput>,
    ) -> SyncResult<()> {
        if response.stream_token.is_empty() {
            self.reject_write_response(ProtocolError::MissingStreamToken, out);
            return Ok(());
        }
        if self.handshake_complete {
            if let Some(batch) = self.write_pipeline.front() {
                if batch.mutations.len() != response.results.len() {
                    let err = ModelError::MutationResultMismatch {
                        expected: batch.mutations.len(),
                        actual: response.results.len(),
                    };
                    self.reject_write_response(err.into(), out);
                    return Ok(());
                }
            }
        }
        self.write_stream.on_message();
        self.write_stream_token = response.stream_token.clone();

        if !self.handshake_complete {
            debug!(stream = "write", "handshake complete");
            self.handshake_complete = true;
            local.set_last_stream_token(response.stream_token)?;
            let pending: Vec<Vec<Mutation>> = self
                .write_pipeline
                .iter()
                .map(|batch| batch.mutations.clone())
                .collect();
            for mutations in pending {
                self.write_stream.send(
                    WriteRequest::Write {
                        stream_token: self.write_stream_token.clone(),
                        mutations,
                    },
                    &mut self.timers,
                );
            }
            return Ok(());
        }

        let Some(batch) = self.write_pipeline.pop_front() else {
            warn!(stream = "write", "acknowledgement without a pending write");
            return Ok(());
        };
        self.write_failures = 0;
        debug!(batch_id = batch.batch_id, version = %response.commit_version, "write acknowledged");
        let result = MutationBatchResult::new(
            batch,
            response.commit_version,
            response.results,
            response.stream_token,
        )
        .map_err(ProtocolError::from)?;
        out.push(RemoteOutput::WriteAcknowledged(result));
        if self.write_pipeline.is_empty() {
            self.write_stream.mark_idle(&mut self.timers);
        }
        Ok(())
    }

    /// Drops the write stream after a response it cannot apply. The pipeline
    /// is kept so the batches are replayed in order after the next handshake.
    fn reject_write_response(&mut self, err: ProtocolError, out: &mut Vec<RemoteOutput>) {
        warn!(stream = "write", error = %err, "closing write stream");
        self.handshake_complete = false;
        self.write_stream
            .close_with_error(&Status::new(Code::Internal, err.to_string()), &mut self.timers);
        if self.should_start_write_stream() {
            self.start_write_stream(out);
        }
    }

    fn on_write_stream_close(
        &mut self,
        generation: u64,
        status: Status,
        local: Option<&LocalStore>,
        out: &mut Vec<RemoteOutput>,
    ) -> SyncResult<()> {
        let Some(outcome) = self
            .write_stream
            .on_close(generation, &status, &mut self.timers)
        else {
            return Ok(());
        };
        let handshake_complete = std::mem::replace(&mut self.handshake_complete, false);

        match outcome {
            CloseOutcome::AuthenticationFailed => {
                out.push(RemoteOutput::AuthenticationFailed {
                    stream: StreamKind::Write,
                    status,
                });
                return Ok(());
            }
            CloseOutcome::InvalidateToken => self.credentials.invalidate_token(),
            CloseOutcome::Closed => {}
        }

        if !status.is_ok() && status.code != Code::Unauthenticated {
            if handshake_complete {
                self.handle_write_error(status, out);
            } else if status.code.is_permanent_error() {
                debug!(stream = "write", %status, "handshake failed; resetting stream token");
                self.write_stream_token.clear();
                if let Some(local) = local {
                    local.set_last_stream_token(Vec::new())?;
                }
            }
        }

        if self.should_start_write_stream() {
            self.start_write_stream(out);
        }
        Ok(())
    }

    fn handle_write_error(&mut self, status: Status, out: &mut Vec<RemoteOutput>) {
        let Some(batch_id) = self.write_pipeline.front().map(|batch| batch.batch_id) else {
            return;
        };
        if status.code.is_permanent_write_error() {
            self.write_pipeline.pop_front();
            self.write_failures = 0;
            // A bad request says nothing about server health.
            self.write_stream.inhibit_backoff();
            out.push(RemoteOutput::WriteRejected { batch_id, status });
            return;
        }

        self.write_failures += 1;
        if self
            .write_retry_limit
            .is_some_and(|limit| self.write_failures >= limit)
        {
            warn!(batch_id, attempts = self.write_failures, %status, "write retry limit reached");
            self.write_pipeline.pop_front();
            self.write_failures = 0;
            out.push(RemoteOutput::WriteRejected { batch_id, status });
            return;
        }
        out.push(RemoteOutput::WriteRetrying {
            batch_id,
            status,
            attempts: self.write_failures,
        });
    }

    /// Moves queued batches into the pipeline and starts the write stream if
    /// there is anything to send.
    pub fn fill_write_pipeline(&mut self, local: &LocalStore) -> SyncResult<Vec<RemoteOutput>> {
        let mut out = Vec::new();
        let mut last_batch_id = self
            .write_pipeline
            .back()
            .map_or(BATCH_ID_UNKNOWN, |batch| batch.batch_id);
        while self.can_use_network() && self.write_pipeline.len() < MAX_PENDING_WRITES {
            match local.next_mutation_batch(last_batch_id)? {
                Some(batch) => {
                    last_batch_id = batch.batch_id;
                    self.add_to_write_pipeline(batch);
                }
                None => {
                    if self.write_pipeline.is_empty() {
                        self.write_stream.mark_idle(&mut self.timers);
                    }
                    break;
                }
            }
        }
        if self.should_start_write_stream() {
            self.start_write_stream(&mut out);
        }
        Ok(out)
    }

    fn add_to_write_pipeline(&mut self, batch: MutationBatch) {
        if self.write_stream.is_open() && self.handshake_complete {
            self.write_stream.send(
                WriteRequest::Write {
                    stream_token: self.write_stream_token.clone(),
                    mutations: batch.mutations.clone(),
                },
                &mut self.timers,
            );
        }
        self.write_pipeline.push_back(batch);
    }

    /// Handles a fired timer.
    pub fn handle_timer(&mut self, token: TimerToken) -> Vec<RemoteOutput> {
        let mut out = Vec::new();
        if !self.timers.fire(token) {
            return out;
        }
        match token.id {
            TimerId::ListenStreamIdle => {
                if self.listen_targets.is_empty() && self.listen_stream.is_open() {
                    debug!(stream = "listen", "closing idle stream");
                    self.listen_stream.stop(&mut self.timers);
                    self.aggregator = WatchChangeAggregator::new(self.database_id.clone());
                    let change = self.online.set(OnlineState::Unknown, &mut self.timers);
                    Self::push_online_change(change, &mut out);
                }
            }
            TimerId::WriteStreamIdle => {
                if self.write_pipeline.is_empty() && self.write_stream.is_open() {
                    debug!(stream = "write", "closing idle stream");
                    self.write_stream.stop(&mut self.timers);
                    self.handshake_complete = false;
                }
            }
            TimerId::ListenStreamBackoff => {
                if self.listen_stream.backoff_elapsed() {
                    self.open_listen_stream(&mut out);
                }
            }
            TimerId::WriteStreamBackoff => {
                if self.write_stream.backoff_elapsed() {
                    self.open_write_stream(&mut out);
                }
            }
            TimerId::OnlineStateTimeout => {
                let change = self.online.handle_timeout();
                Self::push_online_change(change, &mut out);
            }
        }
        out
    }

    /// The token the write stream threads through its requests.
    pub fn write_stream_token(&self) -> &[u8] {
        &self.write_stream_token
    }
}
