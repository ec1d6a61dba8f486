//! Sliding-window limiter for unlock attempts.
//!
//! Attempts are recorded before any key derivation runs, so a rejected
//! attempt costs nothing.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct RateLimiter {
    max_attempts: usize,
    window: Duration,
    attempts: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1) as usize,
            window,
            attempts: VecDeque::new(),
        }
    }

    /// Record an attempt at `now`. On rejection returns how long until the
    /// oldest attempt leaves the window; rejected attempts are not recorded.
    pub fn check(&mut self, now: Instant) -> Result<(), Duration> {
        while let Some(&oldest) = self.attempts.front() {
            if now.duration_since(oldest) >= self.window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }

        if self.attempts.len() >= self.max_attempts {
            let oldest = self.attempts.front().copied().unwrap_or(now);
            return Err((oldest + self.window).saturating_duration_since(now));
        }
        self.attempts.push_back(now);
        Ok(())
    }
}
