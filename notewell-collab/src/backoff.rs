//! Reconnect backoff policy.
//!
//! Automatic reconnection after a transport failure backs off exponentially
//! (1s, 2s, 4s, ...) up to a cap, and keeps retrying at the cap until the
//! session is destroyed. A manual reconnect resets the schedule.

use std::time::Duration;

/// Capped exponential backoff.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            initial,
            cap,
            attempt: 0,
        }
    }

    /// Delay to wait before the next attempt. Each call advances the
    /// schedule.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.initial.saturating_mul(1u32 << exp);
        delay.min(self.cap)
    }

    /// Number of failed attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Back to the initial delay (connection succeeded, or the user asked
    /// for an immediate reconnect).
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}
