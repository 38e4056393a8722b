//! Online state derived from listen stream health.

use crate::scheduler::{TimerId, Timers};
use std::time::Duration;
use tracing::{debug, info};

/// Whether the client believes it can reach the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OnlineState {
    /// Not yet known; from-cache results are held back while possibly online.
    Unknown,
    /// The listen stream delivered a message.
    Online,
    /// The listen stream failed repeatedly or stayed silent too long.
    Offline,
}

/// Tracks [`OnlineState`] from listen stream events.
///
/// Every method returns the new state if it changed.
#[derive(Debug)]
pub(crate) struct OnlineStateTracker {
    state: OnlineState,
    watch_stream_failures: u32,
    max_watch_stream_failures: u32,
    online_state_timeout: Duration,
}

impl OnlineStateTracker {
    pub(crate) fn new(max_watch_stream_failures: u32, online_state_timeout: Duration) -> Self {
        Self {
            state: OnlineState::Unknown,
            watch_stream_failures: 0,
            max_watch_stream_failures: max_watch_stream_failures.max(1),
            online_state_timeout,
        }
    }

    pub(crate) fn state(&self) -> OnlineState {
        self.state
    }

    /// The listen stream is (re)starting.
    pub(crate) fn handle_watch_stream_start(&mut self, timers: &mut Timers) -> Option<OnlineState> {
        if self.watch_stream_failures > 0 {
            return None;
        }
        let change = self.transition(OnlineState::Unknown);
        timers.arm(TimerId::OnlineStateTimeout, self.online_state_timeout);
        change
    }

    /// The listen stream closed with an error.
    pub(crate) fn handle_watch_stream_failure(&mut self, timers: &mut Timers) -> Option<OnlineState> {
        if self.state == OnlineState::Online {
            // One failure of a healthy stream only makes the state uncertain.
            return self.transition(OnlineState::Unknown);
        }
        self.watch_stream_failures += 1;
        if self.watch_stream_failures >= self.max_watch_stream_failures {
            debug!(
                failures = self.watch_stream_failures,
                "listen stream failed repeatedly"
            );
            timers.cancel(TimerId::OnlineStateTimeout);
            return self.transition(OnlineState::Offline);
        }
        None
    }

    /// The online state timer fired.
    pub(crate) fn handle_timeout(&mut self) -> Option<OnlineState> {
        if self.state != OnlineState::Unknown {
            return None;
        }
        debug!(timeout = ?self.online_state_timeout, "backend did not respond in time");
        self.transition(OnlineState::Offline)
    }

    /// Sets the state from outside, e.g. on the first message or when the
    /// network is disabled, and forgets counted failures.
    pub(crate) fn set(&mut self, state: OnlineState, timers: &mut Timers) -> Option<OnlineState> {
        timers.cancel(TimerId::OnlineStateTimeout);
        self.watch_stream_failures = 0;
        self.transition(state)
    }

    fn transition(&mut self, state: OnlineState) -> Option<OnlineState> {
        if self.state == state {
            return None;
        }
        info!(from = ?self.state, to = ?state, "online state changed");
        self.state = state;
        Some(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;

    fn tracker(max_failures: u32) -> (OnlineStateTracker, Timers, ManualScheduler) {
        let scheduler = ManualScheduler::new();
        let timers = Timers::new(Box::new(scheduler.clone()));
        (
            OnlineStateTracker::new(max_failures, Duration::from_secs(10)),
            timers,
            scheduler,
        )
    }

    #[test]
    fn first_message_goes_online() {
        let (mut tracker, mut timers, scheduler) = tracker(1);
        assert_eq!(tracker.handle_watch_stream_start(&mut timers), None);
        assert!(scheduler.is_scheduled(TimerId::OnlineStateTimeout));

        assert_eq!(
            tracker.set(OnlineState::Online, &mut timers),
            Some(OnlineState::Online)
        );
        assert!(!scheduler.is_scheduled(TimerId::OnlineStateTimeout));
        assert_eq!(tracker.set(OnlineState::Online, &mut timers), None);
    }

    #[test]
    fn timeout_goes_offline() {
        let (mut tracker, mut timers, scheduler) = tracker(1);
        tracker.handle_watch_stream_start(&mut timers);
        let token = scheduler.take(TimerId::OnlineStateTimeout).unwrap();
        assert!(timers.fire(token));
        assert_eq!(tracker.handle_timeout(), Some(OnlineState::Offline));
    }

    #[test]
    fn consecutive_failures_go_offline() {
        let (mut tracker, mut timers, _) = tracker(3);
        tracker.handle_watch_stream_start(&mut timers);
        assert_eq!(tracker.handle_watch_stream_failure(&mut timers), None);
        assert_eq!(tracker.handle_watch_stream_failure(&mut timers), None);
        assert_eq!(
            tracker.handle_watch_stream_failure(&mut timers),
            Some(OnlineState::Offline)
        );
    }

    #[test]
    fn failure_while_online_goes_unknown() {
        let (mut tracker, mut timers, _) = tracker(1);
        tracker.set(OnlineState::Online, &mut timers);
        assert_eq!(
            tracker.handle_watch_stream_failure(&mut timers),
            Some(OnlineState::Unknown)
        );
        assert_eq!(
            tracker.handle_watch_stream_failure(&mut timers),
            Some(OnlineState::Offline)
        );
    }
}
