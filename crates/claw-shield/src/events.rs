//! Security events and the sinks that receive them.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::blocklist::BlockReason;
use crate::signature::{AttackCategory, Severity};

/// Which attempt limit was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    /// Sensitive endpoint attempts.
    BruteForce,
    /// ID-lookup requests.
    Enumeration,
}

/// Why a block ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnblockCause {
    /// The scheduled unblock fired, or the entry was found past its expiry.
    Expired,
    /// Removed by an operator.
    Cleared,
}

/// A state transition or rejection worth recording.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SecurityEvent {
    /// A request matched an attack signature.
    SuspiciousMatch {
        /// Requesting source.
        source: IpAddr,
        /// Request path.
        endpoint: String,
        /// Matched category.
        category: AttackCategory,
        /// Severity of the signature.
        severity: Severity,
        /// Pattern that matched.
        pattern: String,
        /// Score after this match.
        count: u32,
    },
    /// A source was blocked.
    SourceBlocked {
        /// Blocked source.
        source: IpAddr,
        /// Endpoint of the request that triggered the block.
        endpoint: String,
        /// Why.
        reason: BlockReason,
        /// When the block lifts.
        unblock_at: DateTime<Utc>,
    },
    /// A block was requested for an already blocked source.
    SourceReblocked {
        /// Source.
        source: IpAddr,
        /// Reason of the ignored request.
        reason: BlockReason,
    },
    /// A block ended.
    SourceUnblocked {
        /// Source.
        source: IpAddr,
        /// Why it ended.
        cause: UnblockCause,
    },
    /// A request from a blocked source was turned away at the gate.
    BlockedRequestRejected {
        /// Source.
        source: IpAddr,
        /// Request path.
        endpoint: String,
        /// Seconds until the block lifts.
        retry_after_secs: u64,
    },
    /// An attempt counter went over its limit.
    ThresholdExceeded {
        /// Source.
        source: IpAddr,
        /// Request path.
        endpoint: String,
        /// Which limit.
        limit: LimitKind,
        /// Count that went over.
        count: u32,
    },
    /// Declared body size was over the cap.
    OversizedRequest {
        /// Source.
        source: IpAddr,
        /// Request path.
        endpoint: String,
        /// Declared size.
        size: u64,
    },
    /// The classifier failed on a request.
    ClassificationFailed {
        /// Source.
        source: IpAddr,
        /// Request path.
        endpoint: String,
        /// Failure detail.
        error: String,
        /// Whether the request was let through.
        allowed: bool,
    },
    /// A cleanup sweep ran.
    SweepCompleted {
        /// Attempt records evicted.
        attempts_evicted: usize,
        /// Suspicion records evicted.
        suspicion_evicted: usize,
        /// Expired blocks purged.
        blocks_purged: usize,
    },
}

/// Receives security events. Calls are fire-and-forget.
pub trait EventSink: Send + Sync {
    /// Record one event.
    fn record(&self, event: &SecurityEvent);
}

/// Sink that emits events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &SecurityEvent) {
        match event {
            SecurityEvent::SuspiciousMatch { source, endpoint, category, severity, pattern, count } => {
                warn!(
                    source = %source,
                    endpoint = %endpoint,
                    category = %category,
                    severity = ?severity,
                    pattern = %pattern,
                    count = count,
                    "Suspicious request detected"
                );
            }
            SecurityEvent::SourceBlocked { source, endpoint, reason, unblock_at } => {
                warn!(
                    source = %source,
                    endpoint = %endpoint,
                    reason = %reason,
                    unblock_at = %unblock_at,
                    "Source blocked"
                );
            }
            SecurityEvent::SourceReblocked { source, reason } => {
                debug!(source = %source, reason = %reason, "Source already blocked");
            }
            SecurityEvent::SourceUnblocked { source, cause } => {
                info!(source = %source, cause = ?cause, "Source unblocked");
            }
            SecurityEvent::BlockedRequestRejected { source, endpoint, retry_after_secs } => {
                debug!(
                    source = %source,
                    endpoint = %endpoint,
                    retry_after_secs = retry_after_secs,
                    "Rejected request from blocked source"
                );
            }
            SecurityEvent::ThresholdExceeded { source, endpoint, limit, count } => {
                warn!(
                    source = %source,
                    endpoint = %endpoint,
                    limit = ?limit,
                    count = count,
                    "Attempt threshold exceeded"
                );
            }
            SecurityEvent::OversizedRequest { source, endpoint, size } => {
                warn!(source = %source, endpoint = %endpoint, size = size, "Request entity too large");
            }
            SecurityEvent::ClassificationFailed { source, endpoint, error, allowed } => {
                warn!(
                    source = %source,
                    endpoint = %endpoint,
                    error = %error,
                    allowed = allowed,
                    "Request classification failed"
                );
            }
            SecurityEvent::SweepCompleted { attempts_evicted, suspicion_evicted, blocks_purged } => {
                info!(
                    attempts_evicted = attempts_evicted,
                    suspicion_evicted = suspicion_evicted,
                    blocks_purged = blocks_purged,
                    "Cleanup sweep completed"
                );
            }
        }
    }
}

/// Sink that keeps events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<SecurityEvent>>,
}

impl MemorySink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every event recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events.lock().clone()
    }

    /// Remove and return every event recorded so far.
    pub fn drain(&self) -> Vec<SecurityEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: &SecurityEvent) {
        self.events.lock().push(event.clone());
    }
}
