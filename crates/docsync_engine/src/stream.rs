//! Lifecycle of one persistent stream.
//!
//! ```text
//! Initial ──start──▶ Starting ──Open──▶ Open
//!    ▲                  │                 │
//!    │ stop / idle      └──────Close──────┤
//!    │                                    ▼
//!    └──────────── Backoff ◀──start──── Error
//! ```
//!
//! The stream itself never talks to the network. The remote store opens the
//! transport and feeds inbound events back in; every open bumps the
//! generation so events from an older transport stream are ignored.

use crate::backoff::ExponentialBackoff;
use crate::config::BackoffConfig;
use crate::connection::{OutboundStream, StreamKind};
use crate::scheduler::{TimerId, Timers};
use docsync_protocol::{Code, Status};
use std::time::Duration;
use tracing::{debug, warn};

/// Where a stream is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// Never opened, closed cleanly, stopped or idle-closed.
    Initial,
    /// Credentials fetched and transport opening.
    Starting,
    /// Ready for requests.
    Open,
    /// Closed with an error; the next start backs off.
    Error,
    /// Waiting for the backoff timer before reopening.
    Backoff,
    /// Credentials were rejected twice in a row; only a network restart or
    /// user change starts it again.
    Stopped,
}

/// What a close means for the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseOutcome {
    /// Closed cleanly or with a transient error.
    Closed,
    /// Credentials were rejected once; fetch a fresh token and retry.
    InvalidateToken,
    /// Credentials were rejected again; the stream is stopped.
    AuthenticationFailed,
}

pub(crate) struct PersistentStream<Req> {
    kind: StreamKind,
    state: StreamState,
    generation: u64,
    handle: Option<Box<dyn OutboundStream<Req>>>,
    backoff: ExponentialBackoff,
    idle_timeout: Duration,
    auth_failures: u32,
}

impl<Req> PersistentStream<Req> {
    pub(crate) fn new(kind: StreamKind, backoff: BackoffConfig, idle_timeout: Duration) -> Self {
        Self {
            kind,
            state: StreamState::Initial,
            generation: 0,
            handle: None,
            backoff: ExponentialBackoff::new(backoff),
            idle_timeout,
            auth_failures: 0,
        }
    }

    pub(crate) fn state(&self) -> StreamState {
        self.state
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }

    /// Returns true if a start request would do something.
    pub(crate) fn can_start(&self) -> bool {
        matches!(self.state, StreamState::Initial | StreamState::Error)
    }

    fn idle_timer(&self) -> TimerId {
        match self.kind {
            StreamKind::Listen => TimerId::ListenStreamIdle,
            StreamKind::Write => TimerId::WriteStreamIdle,
        }
    }

    fn backoff_timer(&self) -> TimerId {
        match self.kind {
            StreamKind::Listen => TimerId::ListenStreamBackoff,
            StreamKind::Write => TimerId::WriteStreamBackoff,
        }
    }

    /// Requests a start. Returns true if the caller should open the
    /// transport now; after an error the backoff timer is armed instead.
    pub(crate) fn start(&mut self, timers: &mut Timers) -> bool {
        match self.state {
            StreamState::Initial => true,
            StreamState::Error => {
                self.state = StreamState::Backoff;
                let delay = self.backoff.next_delay();
                debug!(stream = %self.kind, ?delay, "backing off before reconnect");
                timers.arm(self.backoff_timer(), delay);
                false
            }
            _ => false,
        }
    }

    /// The backoff timer fired. Returns true if the caller should open the
    /// transport now.
    pub(crate) fn backoff_elapsed(&self) -> bool {
        self.state == StreamState::Backoff
    }

    /// Marks the stream as opening and returns the generation its events
    /// will carry.
    pub(crate) fn begin_open(&mut self, timers: &mut Timers) -> u64 {
        timers.cancel(self.backoff_timer());
        self.generation += 1;
        self.state = StreamState::Starting;
        self.generation
    }

    pub(crate) fn attach(&mut self, handle: Box<dyn OutboundStream<Req>>) {
        self.handle = Some(handle);
    }

    /// Handles the transport's `Open`; false if stale.
    pub(crate) fn on_open(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.state != StreamState::Starting {
            return false;
        }
        debug!(stream = %self.kind, generation, "stream open");
        self.state = StreamState::Open;
        true
    }

    /// Returns true if a message of `generation` belongs to the open stream.
    pub(crate) fn accepts_message(&self, generation: u64) -> bool {
        generation == self.generation && self.state == StreamState::Open
    }

    /// A valid message arrived; the connection is healthy.
    pub(crate) fn on_message(&mut self) {
        self.backoff.reset();
        self.auth_failures = 0;
    }

    /// Handles the transport's `Close`; `None` if stale.
    pub(crate) fn on_close(
        &mut self,
        generation: u64,
        status: &Status,
        timers: &mut Timers,
    ) -> Option<CloseOutcome> {
        if generation != self.generation
            || !matches!(self.state, StreamState::Starting | StreamState::Open)
        {
            return None;
        }
        self.handle = None;
        Some(self.handle_close(status, timers))
    }

    /// Closes the stream from the client side because of `status`, e.g. a
    /// malformed response.
    pub(crate) fn close_with_error(&mut self, status: &Status, timers: &mut Timers) -> CloseOutcome {
        if let Some(mut handle) = self.handle.take() {
            handle.close();
        }
        self.handle_close(status, timers)
    }

    fn handle_close(&mut self, status: &Status, timers: &mut Timers) -> CloseOutcome {
        timers.cancel(self.idle_timer());
        self.generation += 1;

        if status.is_ok() {
            debug!(stream = %self.kind, "stream closed");
            self.state = StreamState::Initial;
            self.backoff.reset();
            return CloseOutcome::Closed;
        }

        warn!(stream = %self.kind, %status, "stream closed with error");
        match status.code {
            Code::Unauthenticated => {
                self.auth_failures += 1;
                if self.auth_failures >= 2 {
                    self.state = StreamState::Stopped;
                    return CloseOutcome::AuthenticationFailed;
                }
                self.backoff.reset();
                self.state = StreamState::Error;
                CloseOutcome::InvalidateToken
            }
            Code::ResourceExhausted => {
                self.backoff.reset_to_max();
                self.state = StreamState::Error;
                CloseOutcome::Closed
            }
            _ => {
                self.state = StreamState::Error;
                CloseOutcome::Closed
            }
        }
    }

    /// Closes the stream and returns to `Initial`.
    pub(crate) fn stop(&mut self, timers: &mut Timers) {
        if let Some(mut handle) = self.handle.take() {
            handle.close();
        }
        timers.cancel(self.idle_timer());
        timers.cancel(self.backoff_timer());
        if self.state != StreamState::Initial {
            debug!(stream = %self.kind, "stream stopped");
        }
        self.generation += 1;
        self.state = StreamState::Initial;
        self.backoff.reset();
    }

    /// Forgets rejected credentials so a stopped stream may start again.
    pub(crate) fn reset_auth_failures(&mut self) {
        self.auth_failures = 0;
        if self.state == StreamState::Stopped {
            self.state = StreamState::Initial;
        }
    }

    /// The next reconnect happens without delay.
    pub(crate) fn inhibit_backoff(&mut self) {
        self.backoff.reset();
    }

    pub(crate) fn send(&mut self, request: Req, timers: &mut Timers) {
        timers.cancel(self.idle_timer());
        if let Some(handle) = self.handle.as_mut() {
            handle.send(request);
        }
    }

    /// Arms the idle timer if the stream is open and not already idle.
    pub(crate) fn mark_idle(&mut self, timers: &mut Timers) {
        if self.is_open() && !timers.is_armed(self.idle_timer()) {
            timers.arm(self.idle_timer(), self.idle_timeout);
        }
    }
}
