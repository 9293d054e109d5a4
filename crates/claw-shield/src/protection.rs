//! Unified request protection.
//!
//! [`RequestShield`] owns all protection state for one process. Each check
//! returns `Ok(())` to let the request continue or the [`ShieldError`] to
//! reject it with. The pipeline order is gate, size, brute force,
//! enumeration, classification.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::attempt::{AttemptRecord, AttemptTracker};
use crate::blocklist::{BlockOutcome, BlockReason, BlockRegistry};
use crate::classifier::RequestClassifier;
use crate::cleanup::SweepReport;
use crate::clock::{Clock, Scheduler, SystemClock, TokioScheduler};
use crate::config::{FailurePolicy, ShieldConfig};
use crate::error::{ShieldError, ShieldResult};
use crate::events::{EventSink, LimitKind, SecurityEvent, TracingSink};
use crate::stats::{StatsReporter, StatsSnapshot};
use crate::suspicion::{SuspicionLedger, SuspicionRecord};

/// What the shield needs to know about a request.
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo<'a> {
    /// Requesting source.
    pub source: IpAddr,
    /// Path without query.
    pub path: &'a str,
    /// Path and query.
    pub url: &'a str,
    /// Raw `User-Agent` header.
    pub user_agent: Option<&'a [u8]>,
    /// Declared `Content-Length`.
    pub content_length: Option<u64>,
}

/// Builder for [`RequestShield`] with injectable collaborators.
pub struct RequestShieldBuilder {
    config: ShieldConfig,
    clock: Option<Arc<dyn Clock>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    sink: Option<Arc<dyn EventSink>>,
}

impl RequestShieldBuilder {
    /// Use `clock` instead of the system clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use `scheduler` instead of tokio timers.
    #[must_use]
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Send events to `sink` instead of `tracing`.
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validate the configuration and build the shield.
    ///
    /// # Errors
    ///
    /// Returns `ShieldError::Config` if the configuration is invalid.
    pub fn build(self) -> ShieldResult<RequestShield> {
        let config = self.config;
        config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let scheduler = self.scheduler.unwrap_or_else(|| Arc::new(TokioScheduler));
        let sink = self.sink.unwrap_or_else(|| Arc::new(TracingSink));

        let brute_force = Arc::new(AttemptTracker::new(
            "brute_force",
            config.brute_force.max_attempts,
            config.brute_force.window,
        ));
        let enumeration = AttemptTracker::new(
            "enumeration",
            config.enumeration.max_attempts,
            config.enumeration.window,
        );
        let blocklist = BlockRegistry::new(
            Arc::clone(&clock),
            scheduler,
            Arc::clone(&sink),
            Some(Arc::clone(&brute_force)),
        );

        Ok(RequestShield {
            trusted: config.trusted_ips()?,
            classifier: RequestClassifier::from_config(&config)?,
            suspicion: SuspicionLedger::new(config.suspicion.block_threshold),
            config,
            clock,
            sink,
            brute_force,
            enumeration,
            blocklist,
        })
    }
}

/// Request protection state and checks.
pub struct RequestShield {
    config: ShieldConfig,
    trusted: HashSet<IpAddr>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    classifier: RequestClassifier,
    brute_force: Arc<AttemptTracker>,
    enumeration: AttemptTracker,
    suspicion: SuspicionLedger,
    blocklist: BlockRegistry,
}

impl RequestShield {
    /// Create a shield with the system clock, tokio timers and `tracing` events.
    ///
    /// # Errors
    ///
    /// Returns `ShieldError::Config` if the configuration is invalid.
    pub fn new(config: ShieldConfig) -> ShieldResult<Self> {
        Self::builder(config).build()
    }

    /// Start building a shield with custom collaborators.
    #[must_use]
    pub fn builder(config: ShieldConfig) -> RequestShieldBuilder {
        RequestShieldBuilder {
            config,
            clock: None,
            scheduler: None,
            sink: None,
        }
    }

    // ==================== Pipeline ====================

    /// Run every check in pipeline order.
    pub fn check(&self, request: &RequestInfo<'_>) -> ShieldResult<()> {
        let source = request.source;
        if self.is_trusted(&source) {
            debug!(source = %source, "Trusted source, skipping checks");
            return Ok(());
        }

        self.check_gate(&source, request.path)?;
        self.check_size(&source, request.path, request.content_length)?;
        self.check_brute_force(&source, request.path)?;
        self.check_enumeration(&source, request.path)?;
        self.inspect(&source, request.path, request.url, request.user_agent)
    }

    /// Admission gate. Blocked sources are rejected before anything else runs.
    pub fn check_gate(&self, source: &IpAddr, endpoint: &str) -> ShieldResult<()> {
        if self.is_trusted(source) {
            return Ok(());
        }

        self.blocklist.check(source).inspect_err(|err| {
            self.sink.record(&SecurityEvent::BlockedRequestRejected {
                source: *source,
                endpoint: endpoint.to_string(),
                retry_after_secs: err.retry_after_secs().unwrap_or_default(),
            });
        })
    }

    /// Reject declared bodies over the size cap.
    pub fn check_size(
        &self,
        source: &IpAddr,
        endpoint: &str,
        content_length: Option<u64>,
    ) -> ShieldResult<()> {
        let max = self.config.request_size.max_bytes;
        match content_length {
            Some(size) if size > max && !self.is_trusted(source) => {
                self.sink.record(&SecurityEvent::OversizedRequest {
                    source: *source,
                    endpoint: endpoint.to_string(),
                    size,
                });
                Err(ShieldError::PayloadTooLarge { size, max })
            }
            _ => Ok(()),
        }
    }

    /// Count an attempt on a protected endpoint, blocking the source when
    /// the limit is exceeded.
    pub fn check_brute_force(&self, source: &IpAddr, endpoint: &str) -> ShieldResult<()> {
        let config = &self.config.brute_force;
        if !config.enabled || !config.is_protected(endpoint) || self.is_trusted(source) {
            return Ok(());
        }

        let key = brute_force_key(source, endpoint);
        let now = self.clock.now();
        let outcome = self.brute_force.record_attempt(&key, now);
        if !outcome.exceeded {
            return Ok(());
        }

        self.sink.record(&SecurityEvent::ThresholdExceeded {
            source: *source,
            endpoint: endpoint.to_string(),
            limit: LimitKind::BruteForce,
            count: outcome.count,
        });

        let blocked = self.blocklist.block(
            source,
            BlockReason::BruteForce,
            config.block_duration,
            endpoint,
            Some(key.clone()),
        );
        Err(ShieldError::TooManyAttempts {
            key,
            limit: config.max_attempts,
            retry_after_secs: blocked.entry().retry_after_secs(now),
        })
    }

    /// Throttle ID-lookup requests per source.
    pub fn check_enumeration(&self, source: &IpAddr, endpoint: &str) -> ShieldResult<()> {
        let config = &self.config.enumeration;
        if !config.enabled || !config.is_id_lookup(endpoint) || self.is_trusted(source) {
            return Ok(());
        }

        let key = enumeration_key(source);
        self.enumeration
            .check(&key, self.clock.now())
            .map(|_| ())
            .inspect_err(|_| {
                let count = self.enumeration.get(&key).map_or(0, |r| r.count);
                self.sink.record(&SecurityEvent::ThresholdExceeded {
                    source: *source,
                    endpoint: endpoint.to_string(),
                    limit: LimitKind::Enumeration,
                    count,
                });
            })
    }

    /// Classify the request and update the source's suspicion score.
    ///
    /// A match below the threshold lets the request through. The match that
    /// reaches the threshold blocks the source and is itself rejected.
    pub fn inspect(
        &self,
        source: &IpAddr,
        endpoint: &str,
        url: &str,
        user_agent: Option<&[u8]>,
    ) -> ShieldResult<()> {
        if !self.config.suspicion.enabled || self.is_trusted(source) {
            return Ok(());
        }

        let classification = match self.classifier.classify(url, user_agent) {
            Ok(Some(classification)) => classification,
            Ok(None) => return Ok(()),
            Err(err) => {
                let allowed = self.config.suspicion.failure_policy == FailurePolicy::FailOpen;
                self.sink.record(&SecurityEvent::ClassificationFailed {
                    source: *source,
                    endpoint: endpoint.to_string(),
                    error: err.to_string(),
                    allowed,
                });
                return if allowed { Ok(()) } else { Err(err) };
            }
        };

        let update = self
            .suspicion
            .record_match(source, classification.category, self.clock.now());

        self.sink.record(&SecurityEvent::SuspiciousMatch {
            source: *source,
            endpoint: endpoint.to_string(),
            category: classification.category,
            severity: classification.severity,
            pattern: classification.pattern,
            count: update.record.score,
        });

        if !update.escalate {
            return Ok(());
        }

        self.blocklist.block(
            source,
            BlockReason::SuspiciousActivity,
            self.config.suspicion.block_duration,
            endpoint,
            None,
        );
        Err(ShieldError::SuspiciousActivity {
            ip: *source,
            category: classification.category,
        })
    }

    // ==================== Administration ====================

    /// Forget brute-force attempts after a successful login.
    pub fn record_success(&self, source: &IpAddr, endpoint: &str) -> bool {
        self.brute_force.reset(&brute_force_key(source, endpoint))
    }

    /// Block a source by hand.
    pub fn block(&self, source: &IpAddr, reason: BlockReason, duration: Duration) -> BlockOutcome {
        self.blocklist.block(source, reason, duration, "", None)
    }

    /// Lift a block early.
    pub fn unblock(&self, source: &IpAddr) -> bool {
        self.blocklist.unblock(source)
    }

    /// Whether `source` is blocked right now.
    #[must_use]
    pub fn is_blocked(&self, source: &IpAddr) -> bool {
        self.blocklist.is_blocked(source)
    }

    /// Suspicion record for `source`.
    #[must_use]
    pub fn suspicion(&self, source: &IpAddr) -> Option<SuspicionRecord> {
        self.suspicion.get(source)
    }

    /// Brute-force record for `source` on `endpoint`.
    #[must_use]
    pub fn brute_force_attempts(&self, source: &IpAddr, endpoint: &str) -> Option<AttemptRecord> {
        self.brute_force.get(&brute_force_key(source, endpoint))
    }

    /// Enumeration record for `source`.
    #[must_use]
    pub fn enumeration_attempts(&self, source: &IpAddr) -> Option<AttemptRecord> {
        self.enumeration.get(&enumeration_key(source))
    }

    /// Drop all protection state.
    pub fn clear_all(&self) {
        warn!("Clearing all request protection state");
        self.blocklist.clear();
        self.brute_force.clear();
        self.enumeration.clear();
        self.suspicion.clear();
    }

    // ==================== Maintenance ====================

    /// Evict idle attempt and suspicion records, and blocks whose timer was lost.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let max_age = self.config.cleanup.max_age;

        let report = SweepReport {
            attempts_evicted: self.brute_force.remove_stale(now, max_age)
                + self.enumeration.remove_stale(now, max_age),
            suspicion_evicted: self.suspicion.remove_stale(now, max_age),
            blocks_purged: self.blocklist.purge_expired(),
        };

        self.sink.record(&SecurityEvent::SweepCompleted {
            attempts_evicted: report.attempts_evicted,
            suspicion_evicted: report.suspicion_evicted,
            blocks_purged: report.blocks_purged,
        });
        report
    }

    /// Current state for observability.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsReporter {
            ledger: &self.suspicion,
            registry: &self.blocklist,
            trackers: [&self.brute_force, &self.enumeration],
            top_n: self.config.stats.top_n,
        }
        .snapshot(self.clock.now())
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &ShieldConfig {
        &self.config
    }

    fn is_trusted(&self, source: &IpAddr) -> bool {
        self.trusted.contains(source)
    }
}

impl fmt::Debug for RequestShield {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestShield")
            .field("config", &self.config)
            .field("blocklist", &self.blocklist)
            .field("suspicious", &self.suspicion.len())
            .finish_non_exhaustive()
    }
}

fn brute_force_key(source: &IpAddr, endpoint: &str) -> String {
    format!("{source}:{endpoint}")
}

fn enumeration_key(source: &IpAddr) -> String {
    format!("enum:{source}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{EnumerationConfig, SuspicionConfig};
    use crate::events::MemorySink;
    use crate::signature::AttackCategory;

    const LOGIN: &str = "/api/auth/login";

    struct Fixture {
        clock: Arc<ManualClock>,
        sink: Arc<MemorySink>,
        shield: RequestShield,
    }

    fn fixture_with(config: ShieldConfig) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let sink = Arc::new(MemorySink::new());
        let shield = RequestShield::builder(config)
            .clock(clock.clone())
            .scheduler(clock.clone())
            .event_sink(sink.clone())
            .build()
            .unwrap();
        Fixture { clock, sink, shield }
    }

    fn fixture() -> Fixture {
        fixture_with(ShieldConfig::default())
    }

    fn ip() -> IpAddr {
        "203.0.113.5".parse().unwrap()
    }

    fn request<'a>(path: &'a str, url: &'a str) -> RequestInfo<'a> {
        RequestInfo {
            source: ip(),
            path,
            url,
            user_agent: Some(b"Mozilla/5.0".as_slice()),
            content_length: None,
        }
    }

    // ==================== Construction ====================

    #[test]
    fn test_invalid_config_rejected() {
        let config = ShieldConfig::builder()
            .suspicion(SuspicionConfig {
                block_threshold: 0,
                ..SuspicionConfig::default()
            })
            .build();
        assert!(matches!(RequestShield::new(config), Err(ShieldError::Config(_))));
    }

    // ==================== Brute force ====================

    #[test]
    fn test_brute_force_blocks_on_sixth_attempt() {
        let f = fixture();
        for _ in 0..5 {
            assert!(f.shield.check(&request(LOGIN, LOGIN)).is_ok());
            f.clock.advance(Duration::from_secs(60));
        }

        let err = f.shield.check(&request(LOGIN, LOGIN)).unwrap_err();
        assert!(matches!(err, ShieldError::TooManyAttempts { limit: 5, .. }));
        assert_eq!(err.retry_after_secs(), Some(3600));
        assert!(f.shield.is_blocked(&ip()));

        // Every other endpoint is now refused at the gate.
        let err = f.shield.check(&request("/api/bookings", "/api/bookings")).unwrap_err();
        assert!(matches!(err, ShieldError::Blocked { .. }));
    }

    #[test]
    fn test_brute_force_unblock_resets_counter() {
        let f = fixture();
        for _ in 0..6 {
            let _ = f.shield.check(&request(LOGIN, LOGIN));
        }
        assert!(f.shield.is_blocked(&ip()));

        f.clock.advance(Duration::from_secs(3600));
        assert!(!f.shield.is_blocked(&ip()));
        assert!(f.shield.brute_force_attempts(&ip(), LOGIN).is_none());
        assert!(f.shield.check(&request(LOGIN, LOGIN)).is_ok());
    }

    #[test]
    fn test_unprotected_endpoint_not_counted() {
        let f = fixture();
        for _ in 0..10 {
            assert!(f.shield.check(&request("/api/services", "/api/services")).is_ok());
        }
        assert_eq!(f.shield.snapshot().attempt_entry_count, 0);
    }

    #[test]
    fn test_record_success_clears_attempts() {
        let f = fixture();
        for _ in 0..4 {
            f.shield.check(&request(LOGIN, LOGIN)).unwrap();
        }
        assert!(f.shield.record_success(&ip(), LOGIN));
        assert!(f.shield.brute_force_attempts(&ip(), LOGIN).is_none());

        for _ in 0..5 {
            assert!(f.shield.check(&request(LOGIN, LOGIN)).is_ok());
        }
    }

    // ==================== Enumeration ====================

    #[test]
    fn test_enumeration_throttled_without_block() {
        let f = fixture_with(
            ShieldConfig::builder()
                .enumeration(EnumerationConfig {
                    max_attempts: 3,
                    ..EnumerationConfig::default()
                })
                .build(),
        );
        for id in 1..=3 {
            let path = format!("/api/bookings/{id}");
            assert!(f.shield.check(&request(&path, &path)).is_ok());
        }

        let err = f.shield.check(&request("/api/bookings/4", "/api/bookings/4")).unwrap_err();
        assert!(matches!(err, ShieldError::TooManyAttempts { limit: 3, .. }));
        assert_eq!(err.retry_after_secs(), Some(3600));
        assert!(!f.shield.is_blocked(&ip()));
        assert_eq!(f.shield.enumeration_attempts(&ip()).unwrap().count, 4);

        f.clock.advance(Duration::from_secs(3601));
        assert!(f.shield.check(&request("/api/bookings/5", "/api/bookings/5")).is_ok());
    }

    // ==================== Classification ====================

    #[test]
    fn test_single_match_scores_and_passes() {
        let f = fixture();
        let url = "/../../etc/passwd";
        assert!(f.shield.check(&request(url, url)).is_ok());

        let record = f.shield.suspicion(&ip()).unwrap();
        assert_eq!(record.score, 1);
        assert!(record.matched_categories.contains(&AttackCategory::PathTraversal));
    }

    #[test]
    fn test_third_match_blocks_with_forbidden() {
        let f = fixture();
        assert!(f.shield.check(&request("/.env", "/.env")).is_ok());
        assert!(f.shield.check(&request("/wp-admin/", "/wp-admin/")).is_ok());

        let err = f
            .shield
            .check(&request("/search", "/search?q=1%20union%20select%201"))
            .unwrap_err();
        assert!(matches!(
            err,
            ShieldError::SuspiciousActivity { category: AttackCategory::SqlInjection, .. }
        ));
        assert!(f.shield.is_blocked(&ip()));
        assert_eq!(f.shield.snapshot().blocked_count, 1);

        let err = f.shield.check(&request("/", "/")).unwrap_err();
        assert!(matches!(err, ShieldError::Blocked { .. }));
    }

    #[test]
    fn test_classification_failure_fail_open() {
        let f = fixture();
        let req = RequestInfo {
            user_agent: Some([0xff_u8, 0x00].as_slice()),
            ..request("/", "/")
        };
        assert!(f.shield.check(&req).is_ok());

        let events = f.sink.events();
        assert!(events.iter().any(|e| matches!(
            e,
            SecurityEvent::ClassificationFailed { allowed: true, .. }
        )));
    }

    #[test]
    fn test_classification_failure_fail_closed() {
        let f = fixture_with(
            ShieldConfig::builder()
                .suspicion(SuspicionConfig {
                    failure_policy: FailurePolicy::FailClosed,
                    ..SuspicionConfig::default()
                })
                .build(),
        );
        let req = RequestInfo {
            user_agent: Some([0xff_u8, 0x00].as_slice()),
            ..request("/", "/")
        };
        let err = f.shield.check(&req).unwrap_err();
        assert!(matches!(err, ShieldError::Classification(_)));
        assert!(f.shield.suspicion(&ip()).is_none());
    }

    // ==================== Size and trust ====================

    #[test]
    fn test_oversized_request() {
        let f = fixture();
        let req = RequestInfo {
            content_length: Some(10 * 1024 * 1024 + 1),
            ..request("/api/upload", "/api/upload")
        };
        let err = f.shield.check(&req).unwrap_err();
        assert!(matches!(err, ShieldError::PayloadTooLarge { .. }));

        let exact = RequestInfo {
            content_length: Some(10 * 1024 * 1024),
            ..request("/api/upload", "/api/upload")
        };
        assert!(f.shield.check(&exact).is_ok());
    }

    #[test]
    fn test_trusted_source_bypasses_everything() {
        let f = fixture_with(ShieldConfig::builder().trust_source("203.0.113.5").build());
        for _ in 0..10 {
            assert!(f.shield.check(&request(LOGIN, "/../../etc/passwd")).is_ok());
        }
        assert!(f.shield.suspicion(&ip()).is_none());
        assert!(!f.shield.is_blocked(&ip()));
    }

    #[test]
    fn test_trusted_ipv6_matches_any_spelling() {
        let f = fixture_with(
            ShieldConfig::builder()
                .trust_source("2001:0db8:0000:0000:0000:0000:0000:0001")
                .build(),
        );
        let source: IpAddr = "2001:db8::1".parse().unwrap();
        for _ in 0..5 {
            assert!(f.shield.inspect(&source, "/.env", "/.env", None).is_ok());
        }
        assert!(f.shield.suspicion(&source).is_none());
    }

    #[test]
    fn test_unparsable_trusted_source_rejected() {
        let config = ShieldConfig::builder().trust_source("not-an-ip").build();
        assert!(matches!(RequestShield::new(config), Err(ShieldError::Config(_))));
    }

    // ==================== Gate ====================

    #[test]
    fn test_gate_skips_classifier() {
        let f = fixture();
        f.shield.block(&ip(), BlockReason::SuspiciousActivity, Duration::from_secs(60));
        f.sink.drain();

        let err = f.shield.check(&request("/.env", "/.env")).unwrap_err();
        assert!(matches!(err, ShieldError::Blocked { .. }));
        assert!(f.shield.suspicion(&ip()).is_none());

        let events = f.sink.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SecurityEvent::BlockedRequestRejected { .. }));
    }

    #[test]
    fn test_admin_unblock() {
        let f = fixture();
        f.shield.block(&ip(), BlockReason::BruteForce, Duration::from_secs(600));
        assert!(f.shield.unblock(&ip()));
        assert!(f.shield.check(&request("/", "/")).is_ok());
    }

    // ==================== Maintenance ====================

    #[test]
    fn test_sweep_evicts_only_stale() {
        let f = fixture();
        let stale: IpAddr = "198.51.100.1".parse().unwrap();
        f.shield.inspect(&stale, "/.env", "/.env", None).unwrap();
        f.shield.check_brute_force(&stale, LOGIN).unwrap();

        f.clock.advance(Duration::from_secs(20 * 3600));
        f.shield.check(&request("/.env", "/.env")).unwrap();
        f.shield.check(&request(LOGIN, LOGIN)).unwrap();

        f.clock.advance(Duration::from_secs(5 * 3600));
        let report = f.shield.sweep();

        assert_eq!(report.attempts_evicted, 1);
        assert_eq!(report.suspicion_evicted, 1);
        assert!(f.shield.suspicion(&stale).is_none());
        assert_eq!(f.shield.suspicion(&ip()).unwrap().score, 1);
        assert!(f.shield.brute_force_attempts(&ip(), LOGIN).is_some());
    }

    #[test]
    fn test_clear_all() {
        let f = fixture();
        f.shield.check(&request("/.env", "/.env")).unwrap();
        f.shield.check(&request(LOGIN, LOGIN)).unwrap();
        f.shield.block(&ip(), BlockReason::BruteForce, Duration::from_secs(60));

        f.shield.clear_all();
        let snapshot = f.shield.snapshot();
        assert_eq!(snapshot.suspicious_count, 0);
        assert_eq!(snapshot.blocked_count, 0);
        assert_eq!(snapshot.attempt_entry_count, 0);
    }
}
