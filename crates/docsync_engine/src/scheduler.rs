//! Engine timers.
//!
//! The engine never sleeps. It arms timers by id through a [`Scheduler`] and
//! is told when they fire via [`SyncEngine::handle_timer`]. Each arming gets
//! a fresh sequence number so a timer that fires after being cancelled or
//! re-armed is ignored.

use crate::queue::{AsyncQueue, DelayedOperation};
use crate::sync_engine::SyncEngine;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Identifies one of the engine's timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    /// Closes an idle listen stream.
    ListenStreamIdle,
    /// Closes an idle write stream.
    WriteStreamIdle,
    /// Reopens the listen stream after a failure.
    ListenStreamBackoff,
    /// Reopens the write stream after a failure.
    WriteStreamBackoff,
    /// Declares the client offline when the listen stream stays silent.
    OnlineStateTimeout,
}

/// One arming of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken {
    /// The timer.
    pub id: TimerId,
    seq: u64,
}

/// Runs engine timers.
pub trait Scheduler: Send {
    /// Arranges for `token` to be delivered to the engine after `delay`,
    /// replacing any pending delivery for the same timer id.
    fn schedule(&mut self, token: TimerToken, delay: Duration);

    /// Drops the pending delivery for `id`, if any.
    fn cancel(&mut self, id: TimerId);
}

/// Armed timers of one engine.
pub(crate) struct Timers {
    scheduler: Box<dyn Scheduler>,
    armed: HashMap<TimerId, u64>,
    next_seq: u64,
}

impl Timers {
    pub(crate) fn new(scheduler: Box<dyn Scheduler>) -> Self {
        Self {
            scheduler,
            armed: HashMap::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn arm(&mut self, id: TimerId, delay: Duration) {
        self.next_seq += 1;
        let token = TimerToken {
            id,
            seq: self.next_seq,
        };
        self.armed.insert(id, token.seq);
        self.scheduler.schedule(token, delay);
    }

    pub(crate) fn cancel(&mut self, id: TimerId) {
        if self.armed.remove(&id).is_some() {
            self.scheduler.cancel(id);
        }
    }

    pub(crate) fn is_armed(&self, id: TimerId) -> bool {
        self.armed.contains_key(&id)
    }

    /// Consumes a fired token; false if it is stale.
    pub(crate) fn fire(&mut self, token: TimerToken) -> bool {
        if self.armed.get(&token.id) == Some(&token.seq) {
            self.armed.remove(&token.id);
            true
        } else {
            false
        }
    }

    pub(crate) fn cancel_all(&mut self) {
        let ids: Vec<TimerId> = self.armed.keys().copied().collect();
        for id in ids {
            self.cancel(id);
        }
    }
}

/// A scheduler that only records timers; tests fire them by hand.
#[derive(Debug, Clone, Default)]
pub struct ManualScheduler {
    pending: Arc<Mutex<BTreeMap<TimerId, (TimerToken, Duration)>>>,
}

impl ManualScheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns the pending token for `id`.
    pub fn take(&self, id: TimerId) -> Option<TimerToken> {
        self.pending.lock().remove(&id).map(|(token, _)| token)
    }

    /// The delay a pending timer was armed with.
    pub fn delay(&self, id: TimerId) -> Option<Duration> {
        self.pending.lock().get(&id).map(|(_, delay)| *delay)
    }

    /// Returns true if `id` is pending.
    pub fn is_scheduled(&self, id: TimerId) -> bool {
        self.pending.lock().contains_key(&id)
    }

    /// Ids of all pending timers.
    pub fn scheduled(&self) -> Vec<TimerId> {
        self.pending.lock().keys().copied().collect()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&mut self, token: TimerToken, delay: Duration) {
        self.pending.lock().insert(token.id, (token, delay));
    }

    fn cancel(&mut self, id: TimerId) {
        self.pending.lock().remove(&id);
    }
}

/// Delivers timers through the engine's own [`AsyncQueue`].
pub struct QueueScheduler {
    queue: AsyncQueue<SyncEngine>,
    delayed: HashMap<TimerId, DelayedOperation>,
}

impl QueueScheduler {
    /// Creates a scheduler enqueueing fired timers on `queue`.
    pub fn new(queue: AsyncQueue<SyncEngine>) -> Self {
        Self {
            queue,
            delayed: HashMap::new(),
        }
    }
}

impl Scheduler for QueueScheduler {
    fn schedule(&mut self, token: TimerToken, delay: Duration) {
        self.cancel(token.id);
        let operation = self
            .queue
            .enqueue_after_delay(token.id, delay, move |engine: &mut SyncEngine| {
                engine.handle_timer(token)
            });
        self.delayed.insert(token.id, operation);
    }

    fn cancel(&mut self, id: TimerId) {
        if let Some(operation) = self.delayed.remove(&id) {
            operation.cancel();
        }
    }
}
