//! Reconnect backoff policy and state machine
//!
//! The delay schedule is exponential with a cap:
//! `delay = min(base * 2^attempts, max)`. Attempts are unbounded; only a
//! successful connection resets them.
//!
//! `ReconnectBackoff` is an explicit state machine over
//! `{Idle, Waiting(deadline), Connecting}` driven by caller-supplied
//! `Instant`s, so it is independent of any timer API: whichever component owns
//! the timers asks for a deadline and reports what happened.

use std::time::{Duration, Instant};

/// Backoff policy configuration
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first reconnect attempt
    pub base_delay: Duration,
    /// Cap on the exponential growth
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay for a given attempt (0-indexed): `min(base * 2^attempt, max)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exponential = base_ms.saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(exponential.min(self.max_delay.as_millis() as u64))
    }
}

/// Where the reconnect loop currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffState {
    /// No attempt outstanding
    Idle,
    /// An attempt is scheduled for the deadline
    Waiting { deadline: Instant },
    /// An attempt is in flight
    Connecting,
}

/// Explicit reconnect state machine over a backoff policy
#[derive(Debug)]
pub struct ReconnectBackoff {
    policy: BackoffPolicy,
    state: BackoffState,
    attempts: u32,
}

impl ReconnectBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            state: BackoffState::Idle,
            attempts: 0,
        }
    }

    pub fn state(&self) -> BackoffState {
        self.state
    }

    /// Attempts made since the last successful connection
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Schedule the next attempt, returning its deadline.
    ///
    /// Idempotent while an attempt is already scheduled: the existing deadline
    /// is returned unchanged and the attempt counter is not bumped again.
    pub fn schedule(&mut self, now: Instant) -> Instant {
        if let BackoffState::Waiting { deadline } = self.state {
            return deadline;
        }

        let delay = self.policy.delay_for(self.attempts);
        let deadline = now + delay;
        self.attempts = self.attempts.saturating_add(1);
        self.state = BackoffState::Waiting { deadline };

        tracing::debug!(
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );

        deadline
    }

    /// The scheduled deadline fired; an attempt is now in flight.
    pub fn begin_connect(&mut self) {
        self.state = BackoffState::Connecting;
    }

    /// The attempt succeeded; reset the counter.
    pub fn succeeded(&mut self) {
        self.attempts = 0;
        self.state = BackoffState::Idle;
    }

    /// Cancel any scheduled attempt (explicit teardown).
    pub fn cancel(&mut self) {
        self.state = BackoffState::Idle;
    }
}
