//! Per-source suspicion scores.
//!
//! Every signature match adds one point, repeats of the same category
//! included. The category set only records which kinds of probe were seen.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::clock::to_delta;
use crate::signature::AttackCategory;

/// Suspicion state for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspicionRecord {
    /// The source.
    pub source: IpAddr,
    /// Number of matches recorded.
    pub score: u32,
    /// Distinct categories matched.
    pub matched_categories: BTreeSet<AttackCategory>,
    /// First match.
    pub first_seen: DateTime<Utc>,
    /// Latest match.
    pub last_seen: DateTime<Utc>,
}

impl SuspicionRecord {
    fn new(source: IpAddr, now: DateTime<Utc>) -> Self {
        Self {
            source,
            score: 0,
            matched_categories: BTreeSet::new(),
            first_seen: now,
            last_seen: now,
        }
    }
}

/// Result of recording a match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspicionUpdate {
    /// Record after the update.
    pub record: SuspicionRecord,
    /// Whether the score reached the block threshold. The record has been
    /// removed from the ledger in that case.
    pub escalate: bool,
}

/// Tracks suspicion scores by source.
#[derive(Debug)]
pub struct SuspicionLedger {
    /// Score at which a source is escalated.
    block_threshold: u32,
    /// Records by source.
    records: RwLock<HashMap<IpAddr, SuspicionRecord>>,
}

impl SuspicionLedger {
    /// Create a ledger.
    #[must_use]
    pub fn new(block_threshold: u32) -> Self {
        Self {
            block_threshold,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Record one match for `source`.
    ///
    /// When the score reaches the threshold the record is taken out of the
    /// ledger, since the source moves on to the block registry.
    pub fn record_match(
        &self,
        source: &IpAddr,
        category: AttackCategory,
        now: DateTime<Utc>,
    ) -> SuspicionUpdate {
        let mut records = self.records.write();
        let record = records
            .entry(*source)
            .or_insert_with(|| SuspicionRecord::new(*source, now));

        record.score = record.score.saturating_add(1);
        record.matched_categories.insert(category);
        record.last_seen = now;

        debug!(
            source = %source,
            category = %category,
            score = record.score,
            "Suspicion recorded"
        );

        if record.score >= self.block_threshold {
            let record = records
                .remove(source)
                .unwrap_or_else(|| SuspicionRecord::new(*source, now));
            SuspicionUpdate { record, escalate: true }
        } else {
            SuspicionUpdate {
                record: record.clone(),
                escalate: false,
            }
        }
    }

    /// Record for `source`.
    #[must_use]
    pub fn get(&self, source: &IpAddr) -> Option<SuspicionRecord> {
        self.records.read().get(source).cloned()
    }

    /// Forget `source`.
    pub fn reset(&self, source: &IpAddr) -> bool {
        self.records.write().remove(source).is_some()
    }

    /// Drop records not seen for more than `max_age`.
    pub fn remove_stale(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let max_age = to_delta(max_age);
        let mut records = self.records.write();
        let initial = records.len();

        records.retain(|_, record| now - record.last_seen <= max_age);

        initial.saturating_sub(records.len())
    }

    /// Highest scores first, at most `n` records.
    #[must_use]
    pub fn top(&self, n: usize) -> Vec<SuspicionRecord> {
        let mut records: Vec<SuspicionRecord> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| b.last_seen.cmp(&a.last_seen))
        });
        records.truncate(n);
        records
    }

    /// Number of tracked sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether no sources are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Forget everything.
    pub fn clear(&self) {
        self.records.write().clear();
    }

    /// Score at which sources escalate.
    #[must_use]
    pub const fn block_threshold(&self) -> u32 {
        self.block_threshold
    }
}
