//! Clock and scheduler abstractions.
//!
//! Block expiry is driven by deferred callbacks. Production code uses the
//! system clock and tokio timers; tests drive a [`ManualClock`] forward and
//! fire due callbacks synchronously.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::warn;

/// A deferred callback.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Runs callbacks after a delay. Scheduled tasks cannot be cancelled.
pub trait Scheduler: Send + Sync {
    /// Run `task` once `delay` has elapsed.
    fn schedule(&self, delay: Duration, task: Task);
}

/// Real wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Scheduler backed by tokio timers.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    task();
                });
            }
            Err(_) => {
                // Entries still expire lazily when read.
                warn!(
                    delay_secs = delay.as_secs(),
                    "No tokio runtime, scheduled task dropped"
                );
            }
        }
    }
}

/// Virtual clock that is also a scheduler.
///
/// Time only moves on [`ManualClock::advance`], which runs every pending task
/// whose due time has been reached, in due order.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    pending: Mutex<Vec<(DateTime<Utc>, Task)>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Create a clock frozen at the current wall time.
    #[must_use]
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move time forward and fire due tasks.
    pub fn advance(&self, by: Duration) {
        let now = {
            let mut now = self.now.lock();
            *now += to_delta(by);
            *now
        };

        let mut due = {
            let mut pending = self.pending.lock();
            let (due, rest): (Vec<_>, Vec<_>) =
                pending.drain(..).partition(|(at, _)| *at <= now);
            *pending = rest;
            due
        };
        due.sort_by_key(|(at, _)| *at);

        // Locks are released before running, tasks may schedule again.
        for (_, task) in due {
            task();
        }
    }

    /// Number of tasks not yet fired.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

impl Scheduler for ManualClock {
    fn schedule(&self, delay: Duration, task: Task) {
        let due = self.now() + to_delta(delay);
        self.pending.lock().push((due, task));
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock")
            .field("now", &self.now())
            .field("pending", &self.pending_tasks())
            .finish()
    }
}

/// Convert a std duration to a chrono delta, saturating at a century.
pub(crate) fn to_delta(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Whole seconds from `now` until `until`, rounded up, at least 1.
pub(crate) fn secs_until(now: DateTime<Utc>, until: DateTime<Utc>) -> u64 {
    let millis = (until - now).num_milliseconds().max(0) as u64;
    millis.div_ceil(1000).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::starting_now();
        let start = clock.now();

        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now() - start, chrono::Duration::seconds(90));
    }

    #[test]
    fn test_manual_clock_fires_due_tasks_only() {
        let clock = ManualClock::starting_now();
        let fired = Arc::new(AtomicU32::new(0));

        let f = Arc::clone(&fired);
        clock.schedule(Duration::from_secs(10), Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        let f = Arc::clone(&fired);
        clock.schedule(Duration::from_secs(60), Box::new(move || {
            f.fetch_add(10, Ordering::SeqCst);
        }));

        clock.advance(Duration::from_secs(9));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(clock.pending_tasks(), 2);

        clock.advance(Duration::from_secs(1));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(clock.pending_tasks(), 1);

        clock.advance(Duration::from_secs(100));
        assert_eq!(fired.load(Ordering::SeqCst), 11);
        assert_eq!(clock.pending_tasks(), 0);
    }

    #[test]
    fn test_secs_until_rounds_up() {
        let now = Utc::now();
        assert_eq!(secs_until(now, now + chrono::Duration::milliseconds(1500)), 2);
        assert_eq!(secs_until(now, now + chrono::Duration::seconds(3600)), 3600);
        assert_eq!(secs_until(now, now - chrono::Duration::seconds(5)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_runs_task() {
        let fired = Arc::new(AtomicU32::new(0));
        let f = Arc::clone(&fired);

        TokioScheduler.schedule(Duration::from_secs(5), Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_tokio_scheduler_without_runtime_does_not_panic() {
        TokioScheduler.schedule(Duration::from_secs(1), Box::new(|| {}));
    }
}
