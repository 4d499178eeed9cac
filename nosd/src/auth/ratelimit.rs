//! Login rate limiting
//!
//! Per-IP sliding window over authentication attempts. The window is
//! in-memory only; lockouts (per user) persist separately.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Attempts allowed per window.
pub const MAX_ATTEMPTS: usize = 10;
/// Window length in minutes.
pub const WINDOW_MINUTES: i64 = 15;

/// Sliding-window limiter keyed by client IP.
pub struct LoginRateLimiter {
    attempts: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl LoginRateLimiter {
    pub fn new() -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<DateTime<Utc>>>> {
        match self.attempts.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record an attempt; Err carries the seconds until the window frees.
    pub fn check(&self, ip: &str) -> Result<(), u64> {
        self.check_at(ip, Utc::now())
    }

    /// Testable form with an explicit clock.
    pub fn check_at(&self, ip: &str, now: DateTime<Utc>) -> Result<(), u64> {
        let window_start = now - Duration::minutes(WINDOW_MINUTES);
        let mut attempts = self.lock();
        let entry = attempts.entry(ip.to_string()).or_default();

        while entry.front().map(|t| *t < window_start).unwrap_or(false) {
            entry.pop_front();
        }

        if entry.len() >= MAX_ATTEMPTS {
            let oldest = *entry.front().unwrap_or(&now);
            let retry_after = (oldest + Duration::minutes(WINDOW_MINUTES) - now)
                .num_seconds()
                .max(1) as u64;
            return Err(retry_after);
        }

        entry.push_back(now);
        Ok(())
    }

    /// Successful authentication resets the window for that IP.
    pub fn clear(&self, ip: &str) {
        self.lock().remove(ip);
    }

    /// Drop attempt entries older than a day.
    pub fn sweep(&self) {
        let cutoff = Utc::now() - Duration::hours(24);
        let mut attempts = self.lock();
        attempts.retain(|_, entry| {
            while entry.front().map(|t| *t < cutoff).unwrap_or(false) {
                entry.pop_front();
            }
            !entry.is_empty()
        });
    }
}

impl Default for LoginRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
