//! The serial operation queue.
//!
//! Every state transition of a client runs on one tokio task that owns the
//! state exclusively. Callers enqueue closures; the task runs them strictly
//! in enqueue order and hands each result back through a oneshot channel.
//!
//! ```text
//!   AsyncQueue<S> (Clone)      mpsc       queue task (owns S)
//!   ┌──────────────────┐  ──────────▶  ┌───────────────────────┐
//!   │ enqueue(op)      │               │ op(&mut S), in order  │
//!   │ enqueue_after_.. │  ◀──────────  │                       │
//!   └──────────────────┘    oneshot    └───────────────────────┘
//! ```

use crate::error::{SyncError, SyncResult};
use crate::scheduler::TimerId;
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

type Operation<S> = Box<dyn FnOnce(&mut S) + Send>;

enum Message<S> {
    Run(Operation<S>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a serial queue owning state of type `S`.
pub struct AsyncQueue<S> {
    tx: mpsc::UnboundedSender<Message<S>>,
}

impl<S> Clone for AsyncQueue<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S> fmt::Debug for AsyncQueue<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncQueue")
            .field("shut_down", &self.tx.is_closed())
            .finish()
    }
}

impl<S: Send + 'static> AsyncQueue<S> {
    /// Spawns the queue task owning `state`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(state: S) -> Self {
        match Self::try_spawn_with(|_| Ok::<S, std::convert::Infallible>(state)) {
            Ok(queue) => queue,
            Err(never) => match never {},
        }
    }

    /// Builds the state with access to its own queue, then spawns the task.
    ///
    /// `init` runs on the caller's thread; if it fails nothing is spawned.
    pub fn try_spawn_with<E>(init: impl FnOnce(AsyncQueue<S>) -> Result<S, E>) -> Result<Self, E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self { tx };
        let state = init(queue.clone())?;
        tokio::spawn(run(state, rx));
        Ok(queue)
    }

    /// Runs `op` after every previously enqueued operation and returns its
    /// result.
    pub async fn enqueue<R, F>(&self, op: F) -> SyncResult<R>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::Run(Box::new(move |state| {
                let _ = reply.send(op(state));
            })))
            .map_err(|_| SyncError::Shutdown)?;
        rx.await.map_err(|_| SyncError::Shutdown)
    }

    /// Enqueues `op` without waiting for it.
    ///
    /// Returns false if the queue has shut down.
    pub fn enqueue_and_forget<F>(&self, op: F) -> bool
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.tx.send(Message::Run(Box::new(op))).is_ok()
    }

    /// Enqueues `op` once `delay` has elapsed.
    ///
    /// Cancelling the returned handle before the delay elapses guarantees
    /// `op` never runs.
    pub fn enqueue_after_delay<F>(&self, timer: TimerId, delay: Duration, op: F) -> DelayedOperation
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Message::Run(Box::new(op)));
        });
        DelayedOperation { timer, handle }
    }

    /// Stops the queue after the operations already enqueued and drops the
    /// state. Later operations fail with [`SyncError::Shutdown`].
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Message::Shutdown(reply)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Asks the queue to stop without waiting for it.
    pub fn shutdown_in_background(&self) {
        let (reply, _rx) = oneshot::channel();
        let _ = self.tx.send(Message::Shutdown(reply));
    }

    /// Returns true once the queue task has stopped.
    pub fn is_shut_down(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn run<S>(mut state: S, mut rx: mpsc::UnboundedReceiver<Message<S>>) {
    while let Some(message) = rx.recv().await {
        match message {
            Message::Run(op) => op(&mut state),
            Message::Shutdown(reply) => {
                debug!("async queue shutting down");
                rx.close();
                drop(state);
                let _ = reply.send(());
                return;
            }
        }
    }
}

/// An operation waiting for its delay on an [`AsyncQueue`].
#[derive(Debug)]
pub struct DelayedOperation {
    timer: TimerId,
    handle: JoinHandle<()>,
}

impl DelayedOperation {
    /// The timer this operation belongs to.
    pub fn timer_id(&self) -> TimerId {
        self.timer
    }

    /// Cancels the operation if it has not been enqueued yet.
    pub fn cancel(self) {
        self.handle.abort();
    }
}
