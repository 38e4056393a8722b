//! The async client.
//!
//! [`DocSync`] owns one [`SyncEngine`] on its own [`AsyncQueue`]. Every
//! public operation is one enqueued closure; network events and timers are
//! enqueued on the same queue, so the engine never runs two things at once.

use crate::config::SyncConfig;
use crate::connection::{Connection, CredentialsProvider, Dispatcher, InboundEvent};
use crate::error::{SyncError, SyncResult};
use crate::event_manager::{ListenOptions, ListenerId, QuerySnapshot};
use crate::queue::AsyncQueue;
use crate::scheduler::QueueScheduler;
use crate::sync_engine::{Source, SyncEngine, SyncEvent};
use docsync_model::{BatchId, Document, DocumentKey, Mutation, ObjectValue, Query, User};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

/// A live query subscription.
///
/// Dropping the listener unregisters it.
pub struct Listener {
    id: ListenerId,
    receiver: mpsc::UnboundedReceiver<SyncResult<QuerySnapshot>>,
    queue: AsyncQueue<SyncEngine>,
}

impl Listener {
    /// The listener's id, usable with [`DocSync::unlisten`].
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Waits for the next snapshot or error. `None` once the client has
    /// shut down or the listener was removed.
    pub async fn next(&mut self) -> Option<SyncResult<QuerySnapshot>> {
        self.receiver.recv().await
    }

    /// Returns a snapshot that already arrived, if any.
    pub fn try_next(&mut self) -> Option<SyncResult<QuerySnapshot>> {
        self.receiver.try_recv().ok()
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener").field("id", &self.id).finish()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let id = self.id;
        self.queue.enqueue_and_forget(move |engine| {
            if let Err(err) = engine.unlisten(id) {
                warn!(listener = %id, error = %err, "failed to unlisten dropped listener");
            }
        });
    }
}

/// A write that is durably queued and awaits the backend.
#[derive(Debug)]
pub struct PendingWrite {
    batch_id: BatchId,
    receiver: oneshot::Receiver<SyncResult<()>>,
}

impl PendingWrite {
    /// Id of the batch.
    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    /// Waits until the backend accepted or rejected the write.
    ///
    /// # Errors
    ///
    /// Returns the rejection, [`SyncError::Cancelled`] if the user changed
    /// before the write was sent, or [`SyncError::Shutdown`].
    pub async fn acknowledged(self) -> SyncResult<()> {
        self.receiver.await.map_err(|_| SyncError::Shutdown)?
    }
}

/// A local-first document cache synchronized with a backend.
pub struct DocSync {
    queue: AsyncQueue<SyncEngine>,
    events: broadcast::Sender<SyncEvent>,
    persistence_degraded: bool,
}

impl fmt::Debug for DocSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocSync")
            .field("shut_down", &self.queue.is_shut_down())
            .field("persistence_degraded", &self.persistence_degraded)
            .finish()
    }
}

impl DocSync {
    /// Opens the cache, spawns the engine and enables the network.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if no persistence at all can be opened.
    pub async fn start(
        config: SyncConfig,
        user: User,
        connection: Box<dyn Connection>,
        credentials: Box<dyn CredentialsProvider>,
    ) -> SyncResult<Self> {
        let queue = AsyncQueue::try_spawn_with(|queue: AsyncQueue<SyncEngine>| {
            let events_queue = queue.clone();
            let dispatcher: Dispatcher = Arc::new(move |generation: u64, event: InboundEvent| {
                events_queue.enqueue_and_forget(move |engine| {
                    engine.handle_stream_event(generation, event);
                });
            });
            let scheduler = Box::new(QueueScheduler::new(queue));
            SyncEngine::open(&config, user, connection, credentials, scheduler, dispatcher)
        })?;

        let (events, persistence_degraded) = queue
            .enqueue(|engine| (engine.event_sender(), engine.is_persistence_degraded()))
            .await?;
        queue.enqueue(|engine| engine.enable_network()).await??;
        info!(persistence_degraded, "client started");
        Ok(Self {
            queue,
            events,
            persistence_degraded,
        })
    }

    /// Returns true if file persistence failed and the cache lives in
    /// memory for this session.
    pub fn is_persistence_degraded(&self) -> bool {
        self.persistence_degraded
    }

    /// Subscribes to client-wide events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Listens to `query`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query cannot be run locally.
    pub async fn listen(&self, query: Query, options: ListenOptions) -> SyncResult<Listener> {
        let (tx, receiver) = mpsc::unbounded_channel();
        let id = self
            .queue
            .enqueue(move |engine| engine.listen(query, options, tx))
            .await??;
        Ok(Listener {
            id,
            receiver,
            queue: self.queue.clone(),
        })
    }

    /// Removes a listener. Removing it twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the client has shut down or the target cannot be
    /// released.
    pub async fn unlisten(&self, id: ListenerId) -> SyncResult<()> {
        self.queue.enqueue(move |engine| engine.unlisten(id)).await?
    }

    /// Reads the result of `query` once.
    ///
    /// # Errors
    ///
    /// With [`Source::Server`], returns [`SyncError::Unavailable`] if the
    /// backend cannot be reached.
    pub async fn get(&self, query: Query, source: Source) -> SyncResult<QuerySnapshot> {
        if source == Source::Cache {
            return self
                .queue
                .enqueue(move |engine| engine.get_from_cache(&query))
                .await?;
        }

        let options = ListenOptions::default()
            .with_metadata_changes(true)
            .with_wait_for_sync_when_online(true);
        let mut listener = self.listen(query, options).await?;
        let snapshot = match listener.next().await {
            Some(result) => result?,
            None => return Err(SyncError::Shutdown),
        };
        self.unlisten(listener.id()).await?;
        if source == Source::Server && snapshot.from_cache {
            return Err(SyncError::Unavailable(
                "failed to get documents from server".to_string(),
            ));
        }
        Ok(snapshot)
    }

    /// Reads one document once. `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// As for [`DocSync::get`].
    pub async fn get_document(&self, key: DocumentKey, source: Source) -> SyncResult<Option<Document>> {
        if source == Source::Cache {
            return self
                .queue
                .enqueue(move |engine| engine.get_document_from_cache(&key))
                .await?;
        }
        let snapshot = self.get(Query::document(&key), source).await?;
        Ok(snapshot.get(&key).cloned())
    }

    /// Queues `mutations` as one atomic batch.
    ///
    /// Returns once the batch is durably queued and visible to local reads.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch could not be queued; it is then not
    /// applied locally either.
    pub async fn write(&self, mutations: Vec<Mutation>) -> SyncResult<PendingWrite> {
        let (batch_id, receiver) = self
            .queue
            .enqueue(move |engine| engine.write(mutations))
            .await??;
        debug!(batch_id, "write committed locally");
        Ok(PendingWrite { batch_id, receiver })
    }

    /// Replaces a document.
    ///
    /// # Errors
    ///
    /// As for [`DocSync::write`].
    pub async fn set(&self, key: DocumentKey, data: ObjectValue) -> SyncResult<PendingWrite> {
        self.write(vec![Mutation::set(key, data)]).await
    }

    /// Merges fields into an existing document.
    ///
    /// # Errors
    ///
    /// As for [`DocSync::write`].
    pub async fn update(&self, key: DocumentKey, data: ObjectValue) -> SyncResult<PendingWrite> {
        self.write(vec![Mutation::update(key, data)]).await
    }

    /// Deletes a document.
    ///
    /// # Errors
    ///
    /// As for [`DocSync::write`].
    pub async fn delete(&self, key: DocumentKey) -> SyncResult<PendingWrite> {
        self.write(vec![Mutation::delete(key)]).await
    }

    /// Reconnects both streams.
    ///
    /// # Errors
    ///
    /// Returns an error if the client has shut down.
    pub async fn enable_network(&self) -> SyncResult<()> {
        self.queue.enqueue(|engine| engine.enable_network()).await?
    }

    /// Closes both streams; reads and writes keep working against the cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the client has shut down.
    pub async fn disable_network(&self) -> SyncResult<()> {
        self.queue.enqueue(|engine| engine.disable_network()).await
    }

    /// Switches to another user.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store cannot switch queues.
    pub async fn change_user(&self, user: User) -> SyncResult<()> {
        self.queue
            .enqueue(move |engine| engine.handle_user_change(user))
            .await?
    }

    /// Stops the streams and the queue. Pending writes stay queued in
    /// persistence and are sent by the next client.
    pub async fn shutdown(&self) {
        if self.queue.is_shut_down() {
            return;
        }
        let _ = self.queue.enqueue(|engine| engine.shutdown()).await;
        self.queue.shutdown().await;
        info!("client shut down");
    }
}

impl Drop for DocSync {
    fn drop(&mut self) {
        if !self.queue.is_shut_down() {
            self.queue.enqueue_and_forget(|engine| engine.shutdown());
            self.queue.shutdown_in_background();
        }
    }
}
