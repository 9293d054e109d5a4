//! # claw-shield
//!
//! In-process request protection for HTTP services.
//!
//! ## Guards
//!
//! - [`BlockRegistry`] - Admission gate with self-expiring blocks
//! - [`AttemptTracker`] - Windowed counters for brute-force and enumeration limits
//! - [`RequestClassifier`] - Matches URLs and user agents against a [`SignatureTable`]
//! - [`SuspicionLedger`] - Per-source scores that escalate into blocks
//!
//! ## Operations
//!
//! - [`RequestShield`] - Owns all state and runs the checks in order
//! - [`CleanupScheduler`] - Periodic eviction of idle state
//! - [`StatsSnapshot`] - Read-only view for dashboards
//! - [`middleware`] - axum guards and [`protect`]
//!
//! # Example
//!
//! ```rust
//! use claw_shield::{RequestInfo, RequestShield, ShieldConfig};
//! use std::net::IpAddr;
//!
//! let shield = RequestShield::new(ShieldConfig::default()).unwrap();
//!
//! let source: IpAddr = "192.168.1.1".parse().unwrap();
//! let request = RequestInfo {
//!     source,
//!     path: "/api/bookings",
//!     url: "/api/bookings?date=2026-01-01",
//!     user_agent: Some(b"Mozilla/5.0".as_slice()),
//!     content_length: None,
//! };
//!
//! match shield.check(&request) {
//!     Ok(()) => println!("Request allowed"),
//!     Err(err) => println!("Rejected with {}: {err}", err.status()),
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod attempt;
pub mod blocklist;
pub mod classifier;
pub mod cleanup;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod middleware;
pub mod protection;
pub mod signature;
pub mod stats;
pub mod suspicion;

// Re-export main types
pub use attempt::{AttemptOutcome, AttemptRecord, AttemptTracker};
pub use blocklist::{BlockEntry, BlockOutcome, BlockReason, BlockRegistry};
pub use classifier::{Classification, RequestClassifier};
pub use cleanup::{CleanupScheduler, SweepReport};
pub use clock::{Clock, ManualClock, Scheduler, SystemClock, TokioScheduler};
pub use config::{
    BruteForceConfig, CleanupConfig, EnumerationConfig, FailurePolicy, RequestSizeConfig,
    ShieldConfig, StatsConfig, SuspicionConfig,
};
pub use error::{ShieldError, ShieldResult};
pub use events::{EventSink, MemorySink, SecurityEvent, TracingSink};
pub use middleware::{protect, stats_handler};
pub use protection::{RequestInfo, RequestShield, RequestShieldBuilder};
pub use signature::{AttackCategory, Severity, SignatureSpec, SignatureTable};
pub use stats::StatsSnapshot;
pub use suspicion::{SuspicionLedger, SuspicionRecord};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::cleanup::CleanupScheduler;
    pub use crate::config::ShieldConfig;
    pub use crate::error::{ShieldError, ShieldResult};
    pub use crate::middleware::{protect, stats_handler};
    pub use crate::protection::{RequestInfo, RequestShield};
    pub use crate::signature::{AttackCategory, SignatureSpec};
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::sync::Arc;
    use std::time::Duration;

    fn shield(config: ShieldConfig) -> (Arc<ManualClock>, RequestShield) {
        let clock = Arc::new(ManualClock::starting_now());
        let shield = RequestShield::builder(config)
            .clock(clock.clone())
            .scheduler(clock.clone())
            .event_sink(Arc::new(MemorySink::new()))
            .build()
            .unwrap();
        (clock, shield)
    }

    #[test]
    fn test_basic_protection_flow() {
        let (_, shield) = shield(ShieldConfig::default());
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        let request = RequestInfo {
            source: ip,
            path: "/api/bookings",
            url: "/api/bookings",
            user_agent: None,
            content_length: Some(512),
        };
        assert!(shield.check(&request).is_ok());
        assert!(!shield.is_blocked(&ip));
    }

    #[test]
    fn test_custom_signature_integration() {
        let config = ShieldConfig::builder()
            .signature(SignatureSpec::url(
                r"/debug/vars",
                AttackCategory::ConfigProbe,
                Severity::High,
            ))
            .suspicion(SuspicionConfig {
                block_threshold: 1,
                ..SuspicionConfig::default()
            })
            .build();
        let (clock, shield) = shield(config);
        let ip: IpAddr = "10.0.0.2".parse().unwrap();

        let err = shield
            .inspect(&ip, "/debug/vars", "/debug/vars", None)
            .unwrap_err();
        assert!(matches!(
            err,
            ShieldError::SuspiciousActivity { category: AttackCategory::ConfigProbe, .. }
        ));
        assert!(shield.is_blocked(&ip));

        clock.advance(Duration::from_secs(3600));
        assert!(!shield.is_blocked(&ip));
        assert!(shield.suspicion(&ip).is_none());
    }

    #[test]
    fn test_disabled_guards() {
        let config = ShieldConfig::builder()
            .brute_force(BruteForceConfig {
                enabled: false,
                ..BruteForceConfig::default()
            })
            .suspicion(SuspicionConfig {
                enabled: false,
                ..SuspicionConfig::default()
            })
            .build();
        let (_, shield) = shield(config);
        let ip: IpAddr = "10.0.0.3".parse().unwrap();

        for _ in 0..10 {
            assert!(shield.check_brute_force(&ip, "/api/auth/login").is_ok());
            assert!(shield.inspect(&ip, "/.env", "/.env", None).is_ok());
        }
        assert_eq!(shield.snapshot().attempt_entry_count, 0);
        assert_eq!(shield.snapshot().suspicious_count, 0);
    }
}
