//! Sliding-window rate limiter used for per-user console reconnects.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A rate limiter with configurable per-key limits and window duration.
#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum attempts allowed within the window.
    max_attempts: u32,
    window: Duration,
    /// Per-key attempt timestamps.
    entries: HashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    /// * `max_attempts` - Maximum allowed attempts within the window.
    /// * `window` - Length of the sliding window.
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            entries: HashMap::new(),
        }
    }

    /// Record an attempt for `key` if allowed.
    ///
    /// Returns `true` if allowed, `false` if rate-limited. Rejected attempts
    /// are not recorded.
    pub fn check_and_record(&mut self, key: &str) -> bool {
        let now = Instant::now();
        let attempts = self.entries.entry(key.to_string()).or_default();
        attempts.retain(|t| now.duration_since(*t) < self.window);

        if attempts.len() as u32 >= self.max_attempts {
            return false;
        }

        attempts.push(now);
        true
    }

    /// Drop expired entries to bound memory.
    pub fn gc(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.entries.retain(|_, attempts| {
            attempts.retain(|t| now.duration_since(*t) < window);
            !attempts.is_empty()
        });
    }

    pub fn tracked_keys(&self) -> usize {
        self.entries.len()
    }
}
