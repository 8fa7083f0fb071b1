//! Dual-window admission limiter.
//!
//! Every key owns two fixed-window buckets (short and long). A request is
//! admitted only if both have a token left; admission consumes one from each.
//! A declined request consumes nothing.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

/// One refill window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Length of the window.
    pub period: Duration,
    /// Tokens available per window.
    pub capacity: u32,
}

impl Window {
    /// Window of `capacity` tokens per `period`. Capacity is at least 1.
    pub fn new(period: Duration, capacity: u32) -> Self {
        Self {
            period,
            capacity: capacity.max(1),
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Token consumed.
    Allowed,
    /// Declined; try again after `retry_after`.
    Limited {
        /// Time until the earliest exhausted window refills.
        retry_after: Duration,
    },
}

impl Admission {
    /// True for [`Admission::Allowed`].
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: u32,
    deadline: Instant,
}

impl Bucket {
    fn full(window: Window, now: Instant) -> Self {
        Self {
            tokens: window.capacity,
            deadline: now + window.period,
        }
    }

    fn refresh(&mut self, window: Window, now: Instant) {
        if now >= self.deadline {
            *self = Self::full(window, now);
        }
    }
}

/// Per-key short/long window limiter.
#[derive(Debug)]
pub struct AdmissionLimiter {
    windows: [Window; 2],
    buckets: Mutex<HashMap<String, [Bucket; 2]>>,
}

impl AdmissionLimiter {
    /// Limiter with explicit windows.
    pub fn new(short: Window, long: Window) -> Self {
        Self {
            windows: [short, long],
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Limiter from configuration.
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            Window::new(
                Duration::from_secs(config.short_window_secs),
                config.short_window_cap,
            ),
            Window::new(
                Duration::from_secs(config.long_window_secs),
                config.long_window_cap,
            ),
        )
    }

    /// Check and consume at the current instant.
    pub fn check(&self, key: &str) -> Admission {
        self.check_at(key, Instant::now())
    }

    /// Shorthand for `check(key).is_allowed()`.
    pub fn allow(&self, key: &str) -> bool {
        self.check(key).is_allowed()
    }

    /// Check and consume at `now`.
    pub fn check_at(&self, key: &str, now: Instant) -> Admission {
        let windows = self.windows;
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = buckets
            .entry(key.to_string())
            .or_insert_with(|| windows.map(|w| Bucket::full(w, now)));

        for (bucket, window) in entry.iter_mut().zip(windows) {
            bucket.refresh(window, now);
        }

        let retry_after = entry
            .iter()
            .filter(|b| b.tokens == 0)
            .map(|b| b.deadline.saturating_duration_since(now))
            .max();

        if let Some(retry_after) = retry_after {
            return Admission::Limited {
                retry_after: retry_after.max(Duration::from_millis(1)),
            };
        }

        for bucket in entry.iter_mut() {
            bucket.tokens -= 1;
        }
        Admission::Allowed
    }

    /// Drop keys with nothing to remember.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    /// Drop keys whose buckets are all full or expired at `now`.
    pub fn cleanup_at(&self, now: Instant) -> usize {
        let windows = self.windows;
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let before = buckets.len();
        buckets.retain(|_, entry| {
            !entry
                .iter()
                .zip(windows)
                .all(|(b, w)| now >= b.deadline || b.tokens >= w.capacity)
        });
        before - buckets.len()
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
