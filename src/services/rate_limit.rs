//! Per-key sliding-window rate limiter for the login endpoint.
//!
//! State is process-local; multi-instance deployments push the counters to
//! the persistence gateway instead. The window slides on the injected clock
//! so boundary behaviour is testable.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use crate::clock::Clock;

/// Attempts admitted per window.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_attempts: usize,
    pub window_seconds: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window_seconds: 300,
        }
    }
}

pub struct LoginRateLimiter {
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
    attempts: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl LoginRateLimiter {
    pub fn new(clock: Arc<dyn Clock>, config: RateLimitConfig) -> Self {
        Self {
            clock,
            config,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or reject an attempt for `key` (normally the client IP).
    ///
    /// Exactly `max_attempts` are admitted per window; the next attempt is
    /// rejected with the number of seconds until the window rolls.
    pub fn check_and_record(&self, key: &str) -> Result<(), i64> {
        let now = self.clock.now();
        let window = Duration::seconds(self.config.window_seconds);
        let mut attempts = self.attempts.lock().expect("rate limiter mutex poisoned");

        let entry = attempts.entry(key.to_string()).or_default();
        while let Some(front) = entry.front() {
            if *front + window <= now {
                entry.pop_front();
            } else {
                break;
            }
        }

        if entry.len() >= self.config.max_attempts {
            let oldest = *entry.front().expect("non-empty window");
            let retry_after = (oldest + window - now).num_seconds().max(1);
            return Err(retry_after);
        }

        entry.push_back(now);
        Ok(())
    }

    /// Drop windows that have fully rolled over; called opportunistically.
    pub fn prune(&self) {
        let now = self.clock.now();
        let window = Duration::seconds(self.config.window_seconds);
        let mut attempts = self.attempts.lock().expect("rate limiter mutex poisoned");
        attempts.retain(|_, entry| entry.back().map(|t| *t + window > now).unwrap_or(false));
    }
}
