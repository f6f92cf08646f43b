//! Sliding-window attempt limiting, keyed by request source.
//!
//! The limiter is an injectable interface: a mutexed map backs a single
//! instance, and a shared-cache implementation can replace it for
//! multi-instance deployments without touching callers. `record` appends
//! regardless of outcome, so a denied request still counts against the
//! window and the limiter self-reinforces under sustained abuse.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

/// Window length for counting attempts.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(300);
/// Attempts allowed per source inside one window.
pub const RATE_LIMIT_MAX_ATTEMPTS: usize = 10;

pub trait RateLimiter: Send + Sync {
    /// Whether the recorded attempts for the source are still below the
    /// allowance. Prunes stale entries.
    fn check(&self, source: &str) -> bool;
    /// Record an attempt for the source, regardless of its outcome.
    fn record(&self, source: &str);
}

/// Map-backed limiter for a single instance.
#[derive(Debug)]
pub struct MemoryRateLimiter {
    window: Duration,
    max_attempts: usize,
    attempts: Mutex<HashMap<String, Vec<Instant>>>,
}

impl Default for MemoryRateLimiter {
    fn default() -> Self {
        Self::new(RATE_LIMIT_WINDOW, RATE_LIMIT_MAX_ATTEMPTS)
    }
}

impl MemoryRateLimiter {
    #[must_use]
    pub fn new(window: Duration, max_attempts: usize) -> Self {
        Self {
            window,
            max_attempts,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    fn with_attempts<T>(&self, f: impl FnOnce(&mut HashMap<String, Vec<Instant>>) -> T) -> Option<T> {
        match self.attempts.lock() {
            Ok(mut attempts) => Some(f(&mut attempts)),
            Err(_) => {
                warn!("Rate limiter mutex poisoned");
                None
            }
        }
    }
}

impl RateLimiter for MemoryRateLimiter {
    fn check(&self, source: &str) -> bool {
        let now = Instant::now();
        let window = self.window;
        let max = self.max_attempts;
        self.with_attempts(|attempts| {
            let Some(entries) = attempts.get_mut(source) else {
                return true;
            };
            entries.retain(|at| now.duration_since(*at) < window);
            let remaining = entries.len();
            if remaining == 0 {
                attempts.remove(source);
                return true;
            }
            remaining < max
        })
        // Fail closed: a broken limiter must not disable brute-force protection.
        .unwrap_or(false)
    }

    fn record(&self, source: &str) {
        let now = Instant::now();
        self.with_attempts(|attempts| {
            attempts.entry(source.to_string()).or_default().push(now);
        });
    }
}

/// Limiter that allows everything; used in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRateLimiter;

impl RateLimiter for NoopRateLimiter {
    fn check(&self, _source: &str) -> bool {
        true
    }

    fn record(&self, _source: &str) {}
}
