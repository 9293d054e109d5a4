//! Block registry: the admission gate.
//!
//! Each block schedules its own unblock callback. Callbacks carry the id of
//! the entry they were scheduled for, so a stale timer never removes a newer
//! block for the same source. Entries found past their `unblock_at` on read
//! are removed on the spot, which covers schedulers that dropped the task.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::attempt::AttemptTracker;
use crate::clock::{Clock, Scheduler, secs_until, to_delta};
use crate::error::{ShieldError, ShieldResult};
use crate::events::{EventSink, SecurityEvent, UnblockCause};

/// Why a source was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    /// Too many attempts on a protected endpoint.
    BruteForce,
    /// Suspicion score reached the threshold.
    SuspiciousActivity,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BruteForce => f.write_str("brute_force"),
            Self::SuspiciousActivity => f.write_str("suspicious_activity"),
        }
    }
}

/// An active block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockEntry {
    /// Blocked source.
    pub source: IpAddr,
    /// When the block started.
    pub blocked_at: DateTime<Utc>,
    /// When the block lifts.
    pub unblock_at: DateTime<Utc>,
    /// Why.
    pub reason: BlockReason,
    #[serde(skip)]
    id: u64,
    /// Attempt record released when the block ends.
    #[serde(skip)]
    attempt_key: Option<String>,
}

impl BlockEntry {
    /// Whether the block has lifted at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.unblock_at
    }

    /// Seconds until the block lifts, rounded up.
    #[must_use]
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        secs_until(now, self.unblock_at)
    }
}

/// Result of a block request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// A new block was created.
    Blocked(BlockEntry),
    /// The source was already blocked; nothing changed.
    AlreadyBlocked(BlockEntry),
}

impl BlockOutcome {
    /// The entry now in force.
    #[must_use]
    pub const fn entry(&self) -> &BlockEntry {
        match self {
            Self::Blocked(entry) | Self::AlreadyBlocked(entry) => entry,
        }
    }
}

/// State reachable from unblock callbacks.
struct Shared {
    entries: RwLock<HashMap<IpAddr, BlockEntry>>,
    attempts: Option<Arc<AttemptTracker>>,
    sink: Arc<dyn EventSink>,
}

impl Shared {
    /// Remove the block for `ip`, only if it is entry `id` when one is given.
    fn remove(&self, ip: &IpAddr, id: Option<u64>, cause: UnblockCause) -> Option<BlockEntry> {
        let removed = {
            let mut entries = self.entries.write();
            let matches = entries
                .get(ip)
                .is_some_and(|entry| id.is_none_or(|id| entry.id == id));
            if matches { entries.remove(ip) } else { None }
        };

        if let Some(entry) = &removed {
            if let (Some(attempts), Some(key)) = (&self.attempts, &entry.attempt_key) {
                attempts.reset(key);
            }
            self.sink.record(&SecurityEvent::SourceUnblocked { source: *ip, cause });
        }
        removed
    }
}

/// Set of blocked sources with self-expiring entries.
pub struct BlockRegistry {
    shared: Arc<Shared>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    next_id: AtomicU64,
    total_blocks: AtomicU64,
    reblocks: AtomicU64,
}

impl BlockRegistry {
    /// Create a registry.
    ///
    /// When `attempts` is given, ending a block also resets the attempt
    /// record that triggered it.
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
        sink: Arc<dyn EventSink>,
        attempts: Option<Arc<AttemptTracker>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: RwLock::new(HashMap::new()),
                attempts,
                sink,
            }),
            clock,
            scheduler,
            next_id: AtomicU64::new(1),
            total_blocks: AtomicU64::new(0),
            reblocks: AtomicU64::new(0),
        }
    }

    /// Block `ip` for `duration`.
    ///
    /// Blocking a source that is already blocked leaves the existing entry
    /// and its timer untouched and only bumps the re-block counter.
    pub fn block(
        &self,
        ip: &IpAddr,
        reason: BlockReason,
        duration: Duration,
        endpoint: &str,
        attempt_key: Option<String>,
    ) -> BlockOutcome {
        let now = self.clock.now();
        self.expire_if_due(ip, now);

        // unblock_at must be after blocked_at
        let duration = duration.max(Duration::from_millis(1));

        let outcome = {
            let mut entries = self.shared.entries.write();
            if let Some(existing) = entries.get(ip) {
                BlockOutcome::AlreadyBlocked(existing.clone())
            } else {
                let entry = BlockEntry {
                    source: *ip,
                    blocked_at: now,
                    unblock_at: now + to_delta(duration),
                    reason,
                    id: self.next_id.fetch_add(1, Ordering::Relaxed),
                    attempt_key,
                };
                entries.insert(*ip, entry.clone());
                BlockOutcome::Blocked(entry)
            }
        };

        match &outcome {
            BlockOutcome::Blocked(entry) => {
                self.total_blocks.fetch_add(1, Ordering::Relaxed);
                self.schedule_unblock(entry, duration);
                self.shared.sink.record(&SecurityEvent::SourceBlocked {
                    source: *ip,
                    endpoint: endpoint.to_string(),
                    reason,
                    unblock_at: entry.unblock_at,
                });
            }
            BlockOutcome::AlreadyBlocked(_) => {
                self.reblocks.fetch_add(1, Ordering::Relaxed);
                self.shared
                    .sink
                    .record(&SecurityEvent::SourceReblocked { source: *ip, reason });
            }
        }
        outcome
    }

    fn schedule_unblock(&self, entry: &BlockEntry, delay: Duration) {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let ip = entry.source;
        let id = entry.id;
        self.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.remove(&ip, Some(id), UnblockCause::Expired);
                }
            }),
        );
        debug!(ip = %ip, block_id = id, delay_secs = delay.as_secs(), "Unblock scheduled");
    }

    /// Remove the entry for `ip` if it is past `unblock_at`.
    fn expire_if_due(&self, ip: &IpAddr, now: DateTime<Utc>) -> bool {
        let due = self
            .shared
            .entries
            .read()
            .get(ip)
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.id);

        due.is_some_and(|id| self.shared.remove(ip, Some(id), UnblockCause::Expired).is_some())
    }

    /// Gate check.
    ///
    /// # Errors
    ///
    /// Returns `ShieldError::Blocked` with a retry hint while `ip` is blocked.
    pub fn check(&self, ip: &IpAddr) -> ShieldResult<()> {
        let now = self.clock.now();
        if self.expire_if_due(ip, now) {
            return Ok(());
        }

        match self.shared.entries.read().get(ip) {
            Some(entry) => Err(ShieldError::Blocked {
                ip: *ip,
                retry_after_secs: entry.retry_after_secs(now),
            }),
            None => Ok(()),
        }
    }

    /// Whether `ip` is blocked right now.
    #[must_use]
    pub fn is_blocked(&self, ip: &IpAddr) -> bool {
        self.check(ip).is_err()
    }

    /// Active entry for `ip`.
    #[must_use]
    pub fn get(&self, ip: &IpAddr) -> Option<BlockEntry> {
        let now = self.clock.now();
        self.shared
            .entries
            .read()
            .get(ip)
            .filter(|entry| !entry.is_expired(now))
            .cloned()
    }

    /// Administrative clear. Returns whether `ip` was blocked.
    pub fn unblock(&self, ip: &IpAddr) -> bool {
        self.shared.remove(ip, None, UnblockCause::Cleared).is_some()
    }

    /// Remove every block. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let ips: Vec<IpAddr> = self.shared.entries.read().keys().copied().collect();
        ips.iter()
            .filter(|ip| self.shared.remove(ip, None, UnblockCause::Cleared).is_some())
            .count()
    }

    /// Remove entries already past `unblock_at`. Active blocks are never touched.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let due: Vec<(IpAddr, u64)> = self
            .shared
            .entries
            .read()
            .values()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| (entry.source, entry.id))
            .collect();

        due.iter()
            .filter(|(ip, id)| {
                self.shared
                    .remove(ip, Some(*id), UnblockCause::Expired)
                    .is_some()
            })
            .count()
    }

    /// Number of active blocks.
    #[must_use]
    pub fn active_count(&self) -> usize {
        let now = self.clock.now();
        self.shared
            .entries
            .read()
            .values()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    /// All active blocks.
    #[must_use]
    pub fn list(&self) -> Vec<BlockEntry> {
        let now = self.clock.now();
        self.shared
            .entries
            .read()
            .values()
            .filter(|entry| !entry.is_expired(now))
            .cloned()
            .collect()
    }

    /// Blocks created since start.
    #[must_use]
    pub fn total_blocks_issued(&self) -> u64 {
        self.total_blocks.load(Ordering::Relaxed)
    }

    /// Block requests that hit an already blocked source.
    #[must_use]
    pub fn reblock_attempts(&self) -> u64 {
        self.reblocks.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for BlockRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockRegistry")
            .field("blocked", &self.shared.entries.read().len())
            .field("total_blocks", &self.total_blocks_issued())
            .field("reblocks", &self.reblock_attempts())
            .finish_non_exhaustive()
    }
}
