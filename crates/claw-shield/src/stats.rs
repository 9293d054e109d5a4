//! Read-only snapshots of protection state.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::attempt::AttemptTracker;
use crate::blocklist::{BlockReason, BlockRegistry};
use crate::signature::AttackCategory;
use crate::suspicion::SuspicionLedger;

/// A source in the suspicion leaderboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspiciousSource {
    /// The source.
    pub source: IpAddr,
    /// Matches recorded.
    pub score: u32,
    /// Distinct categories matched.
    pub category_count: usize,
    /// The categories themselves.
    pub categories: Vec<AttackCategory>,
}

/// A currently blocked source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedSource {
    /// The source.
    pub source: IpAddr,
    /// Why.
    pub reason: BlockReason,
    /// When the block lifts.
    pub unblock_at: DateTime<Utc>,
    /// Seconds until then.
    pub retry_after_secs: u64,
}

/// Point-in-time view of all protection state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Sources with a suspicion record.
    pub suspicious_count: usize,
    /// Sources with an active block.
    pub blocked_count: usize,
    /// Attempt records across both trackers.
    pub attempt_entry_count: usize,
    /// Highest scoring sources, descending.
    pub top_suspicious: Vec<SuspiciousSource>,
    /// Active blocks, soonest to lift first.
    pub blocked_sources: Vec<BlockedSource>,
    /// Blocks created since start.
    pub total_blocks_issued: u64,
    /// Block requests against already blocked sources.
    pub reblock_attempts: u64,
    /// When the snapshot was taken.
    pub generated_at: DateTime<Utc>,
}

/// Builds [`StatsSnapshot`]s. Never mutates what it reads.
#[derive(Debug)]
pub struct StatsReporter<'a> {
    pub(crate) ledger: &'a SuspicionLedger,
    pub(crate) registry: &'a BlockRegistry,
    pub(crate) trackers: [&'a AttemptTracker; 2],
    pub(crate) top_n: usize,
}

impl StatsReporter<'_> {
    /// Take a snapshot at `now`.
    #[must_use]
    pub fn snapshot(&self, now: DateTime<Utc>) -> StatsSnapshot {
        let top_suspicious = self
            .ledger
            .top(self.top_n)
            .into_iter()
            .map(|record| SuspiciousSource {
                source: record.source,
                score: record.score,
                category_count: record.matched_categories.len(),
                categories: record.matched_categories.into_iter().collect(),
            })
            .collect();

        let mut blocked_sources: Vec<BlockedSource> = self
            .registry
            .list()
            .into_iter()
            .map(|entry| BlockedSource {
                source: entry.source,
                reason: entry.reason,
                unblock_at: entry.unblock_at,
                retry_after_secs: entry.retry_after_secs(now),
            })
            .collect();
        blocked_sources.sort_by_key(|b| b.unblock_at);

        StatsSnapshot {
            suspicious_count: self.ledger.len(),
            blocked_count: blocked_sources.len(),
            attempt_entry_count: self.trackers.iter().map(|t| t.len()).sum(),
            top_suspicious,
            blocked_sources,
            total_blocks_issued: self.registry.total_blocks_issued(),
            reblock_attempts: self.registry.reblock_attempts(),
            generated_at: now,
        }
    }
}
