//! Exponential backoff with jitter for stream reconnects.

use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// Computes successive reconnect delays.
///
/// Each delay is the current base delay with up to ±50% jitter; the base
/// grows by the multiplier after every attempt and is capped at the maximum.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current_base: Duration,
}

impl ExponentialBackoff {
    /// Creates a backoff that starts with no delay.
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current_base: Duration::ZERO,
        }
    }

    /// Returns the delay before the next attempt and advances the base.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current_base.as_secs_f64();
        let jitter = if base > 0.0 {
            rand::thread_rng().gen_range(-0.5..=0.5) * base
        } else {
            0.0
        };
        let delay = Duration::from_secs_f64((base + jitter).max(0.0));

        let next = if self.current_base.is_zero() {
            self.config.initial_delay.as_secs_f64()
        } else {
            base * self.config.multiplier
        };
        self.current_base =
            Duration::from_secs_f64(next.min(self.config.max_delay.as_secs_f64()));
        delay
    }

    /// Makes the next attempt immediate.
    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
    }

    /// Makes the next attempt wait the maximum delay.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.config.max_delay;
    }

    /// The base delay of the next attempt.
    pub fn current_base(&self) -> Duration {
        self.current_base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> ExponentialBackoff {
        ExponentialBackoff::new(BackoffConfig::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
            2.0,
        ))
    }

    #[test]
    fn first_attempt_is_immediate() {
        let mut backoff = backoff();
        assert_eq!(backoff.next_delay(), Duration::ZERO);
        assert_eq!(backoff.current_base(), Duration::from_millis(100));
    }

    #[test]
    fn delays_grow_with_jitter_and_cap() {
        let mut backoff = backoff();
        backoff.next_delay();

        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_millis(50));
        assert!(delay <= Duration::from_millis(150));
        assert_eq!(backoff.current_base(), Duration::from_millis(200));

        for _ in 0..10 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_millis(1500));
        }
        assert_eq!(backoff.current_base(), Duration::from_secs(1));
    }

    #[test]
    fn reset_to_max_waits_longest() {
        let mut backoff = backoff();
        backoff.reset_to_max();
        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_millis(500));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }
}
