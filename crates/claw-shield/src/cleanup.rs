//! Periodic eviction of stale protection state.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::protection::RequestShield;

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Attempt records idle past the max age.
    pub attempts_evicted: usize,
    /// Suspicion records idle past the max age.
    pub suspicion_evicted: usize,
    /// Blocks already past `unblock_at`.
    pub blocks_purged: usize,
}

impl SweepReport {
    /// Total entries removed.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.attempts_evicted + self.suspicion_evicted + self.blocks_purged
    }
}

/// Runs [`RequestShield::sweep`] on a fixed interval.
#[derive(Debug, Clone)]
pub struct CleanupScheduler {
    shield: Arc<RequestShield>,
    interval: Duration,
}

impl CleanupScheduler {
    /// Sweep `shield` at its configured cleanup interval.
    #[must_use]
    pub fn new(shield: Arc<RequestShield>) -> Self {
        let interval = shield.config().cleanup.interval;
        Self { shield, interval }
    }

    /// Override the interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run one sweep now.
    pub fn run_once(&self) -> SweepReport {
        let report = self.shield.sweep();
        if report.total() > 0 {
            info!(
                attempts = report.attempts_evicted,
                suspicion = report.suspicion_evicted,
                blocks = report.blocks_purged,
                "Cleanup sweep evicted stale entries"
            );
        } else {
            debug!("Cleanup sweep found nothing to evict");
        }
        report
    }

    /// Sweep forever on the current tokio runtime. The first sweep runs one
    /// interval after spawning. Abort the handle to stop.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                self.run_once();
            }
        })
    }
}
