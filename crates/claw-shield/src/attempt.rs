//! Per-key attempt counters with a hard window reset.
//!
//! Once `now - window_start` exceeds the window, the record starts over at 1.
//! Nothing decays gradually, so a burst straddling the boundary can reach
//! twice the limit.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::clock::{secs_until, to_delta};
use crate::error::{ShieldError, ShieldResult};

/// Attempt history for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    /// Composite key, e.g. `"203.0.113.5:/api/auth/login"`.
    pub key: String,
    /// Attempts in the current window, at least 1.
    pub count: u32,
    /// Start of the current window.
    pub window_start: DateTime<Utc>,
    /// Time of the latest attempt.
    pub last_attempt: DateTime<Utc>,
}

/// Result of recording an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptOutcome {
    /// Count after this attempt.
    pub count: u32,
    /// Start of the window the attempt landed in.
    pub window_start: DateTime<Utc>,
    /// Whether the count is now over the limit.
    pub exceeded: bool,
}

/// Windowed attempt counter keyed by string.
#[derive(Debug)]
pub struct AttemptTracker {
    /// Label used in logs.
    name: &'static str,
    /// Maximum attempts per window.
    max_attempts: u32,
    /// Window length.
    window: Duration,
    /// Records by key.
    records: RwLock<HashMap<String, AttemptRecord>>,
}

impl AttemptTracker {
    /// Create a tracker.
    #[must_use]
    pub fn new(name: &'static str, max_attempts: u32, window: Duration) -> Self {
        Self {
            name,
            max_attempts,
            window,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Record an attempt for `key` at `now`.
    pub fn record_attempt(&self, key: &str, now: DateTime<Utc>) -> AttemptOutcome {
        let window = to_delta(self.window);
        let mut records = self.records.write();

        let record = records
            .entry(key.to_string())
            .or_insert_with(|| AttemptRecord {
                key: key.to_string(),
                count: 0,
                window_start: now,
                last_attempt: now,
            });

        if now - record.window_start > window {
            record.count = 0;
            record.window_start = now;
        }
        record.count = record.count.saturating_add(1);
        record.last_attempt = now;

        debug!(tracker = self.name, key = %key, count = record.count, "Attempt recorded");

        AttemptOutcome {
            count: record.count,
            window_start: record.window_start,
            exceeded: record.count > self.max_attempts,
        }
    }

    /// Record an attempt and fail if it goes over the limit.
    ///
    /// The retry hint is the time left in the current window.
    ///
    /// # Errors
    ///
    /// Returns `ShieldError::TooManyAttempts` when the limit is exceeded.
    pub fn check(&self, key: &str, now: DateTime<Utc>) -> ShieldResult<AttemptOutcome> {
        let outcome = self.record_attempt(key, now);
        if outcome.exceeded {
            return Err(ShieldError::TooManyAttempts {
                key: key.to_string(),
                limit: self.max_attempts,
                retry_after_secs: secs_until(now, outcome.window_start + to_delta(self.window)),
            });
        }
        Ok(outcome)
    }

    /// Current record for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<AttemptRecord> {
        self.records.read().get(key).cloned()
    }

    /// Forget `key`. Returns whether a record existed.
    pub fn reset(&self, key: &str) -> bool {
        self.records.write().remove(key).is_some()
    }

    /// Drop records whose last attempt is more than `max_age` before `now`.
    pub fn remove_stale(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let max_age = to_delta(max_age);
        let mut records = self.records.write();
        let initial = records.len();

        records.retain(|_, record| now - record.last_attempt <= max_age);

        let removed = initial.saturating_sub(records.len());
        if removed > 0 {
            debug!(tracker = self.name, removed = removed, "Evicted stale attempt records");
        }
        removed
    }

    /// Number of tracked keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether no keys are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Forget everything.
    pub fn clear(&self) {
        self.records.write().clear();
    }

    /// Maximum attempts per window.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Window length.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }
}
