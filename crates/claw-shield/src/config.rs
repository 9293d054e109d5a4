//! Request protection configuration.

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ShieldError, ShieldResult};
use crate::signature::SignatureSpec;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

/// Brute-force protection on sensitive endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BruteForceConfig {
    /// Attempts allowed per source and endpoint in one window.
    pub max_attempts: u32,
    /// Counting window.
    pub window: Duration,
    /// How long an offending source stays blocked.
    pub block_duration: Duration,
    /// Path prefixes that count as protected.
    pub protected_endpoint_prefixes: Vec<String>,
    /// Whether to enable brute-force protection.
    pub enabled: bool,
}

impl Default for BruteForceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window: Duration::from_secs(15 * MINUTE),
            block_duration: Duration::from_secs(HOUR),
            protected_endpoint_prefixes: vec![
                "/api/auth/login".into(),
                "/api/auth/register".into(),
                "/api/auth/reset-password".into(),
                "/api/admin".into(),
            ],
            enabled: true,
        }
    }
}

impl BruteForceConfig {
    /// Whether `path` is under a protected prefix.
    #[must_use]
    pub fn is_protected(&self, path: &str) -> bool {
        self.protected_endpoint_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// Enumeration throttling on ID-lookup paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnumerationConfig {
    /// Lookups allowed per source in one window.
    pub max_attempts: u32,
    /// Counting window.
    pub window: Duration,
    /// Collection prefixes whose next segment is a record id.
    pub id_lookup_prefixes: Vec<String>,
    /// Whether to enable enumeration throttling.
    pub enabled: bool,
}

impl Default for EnumerationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            window: Duration::from_secs(HOUR),
            id_lookup_prefixes: vec![
                "/api/bookings/".into(),
                "/api/users/".into(),
                "/api/appointments/".into(),
            ],
            enabled: true,
        }
    }
}

impl EnumerationConfig {
    /// Whether `path` looks like a lookup of a single record by id.
    #[must_use]
    pub fn is_id_lookup(&self, path: &str) -> bool {
        self.id_lookup_prefixes.iter().any(|prefix| {
            path.strip_prefix(prefix.as_str())
                .and_then(|rest| rest.split('/').next())
                .is_some_and(is_id_segment)
        })
    }
}

/// Numeric ids, or hex/UUID tokens of at least 8 characters.
fn is_id_segment(segment: &str) -> bool {
    if segment.is_empty() {
        return false;
    }
    if segment.bytes().all(|b| b.is_ascii_digit()) {
        return true;
    }
    segment.len() >= 8
        && segment.bytes().all(|b| b.is_ascii_hexdigit() || b == b'-')
        && segment.bytes().any(|b| b.is_ascii_digit())
}

/// What to do when the classifier fails on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log and let the request through.
    #[default]
    FailOpen,
    /// Log and reject the request.
    FailClosed,
}

/// Signature-based suspicion scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspicionConfig {
    /// Score at which a source is blocked.
    pub block_threshold: u32,
    /// How long an escalated source stays blocked.
    pub block_duration: Duration,
    /// Handling of classifier failures.
    pub failure_policy: FailurePolicy,
    /// Whether to enable classification.
    pub enabled: bool,
}

impl Default for SuspicionConfig {
    fn default() -> Self {
        Self {
            block_threshold: 3,
            block_duration: Duration::from_secs(HOUR),
            failure_policy: FailurePolicy::FailOpen,
            enabled: true,
        }
    }
}

/// Periodic eviction of stale tracking state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Entries idle for longer than this are evicted.
    pub max_age: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(HOUR),
            max_age: Duration::from_secs(24 * HOUR),
        }
    }
}

/// Request size guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSizeConfig {
    /// Largest accepted `Content-Length`.
    pub max_bytes: u64,
}

impl Default for RequestSizeConfig {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024, // 10 MB
        }
    }
}

/// Stats snapshot settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Number of sources listed in `top_suspicious`.
    pub top_n: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self { top_n: 10 }
    }
}

/// Main request protection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShieldConfig {
    /// Brute-force settings.
    pub brute_force: BruteForceConfig,
    /// Enumeration settings.
    pub enumeration: EnumerationConfig,
    /// Suspicion settings.
    pub suspicion: SuspicionConfig,
    /// Cleanup settings.
    pub cleanup: CleanupConfig,
    /// Size guard settings.
    pub request_size: RequestSizeConfig,
    /// Stats settings.
    pub stats: StatsConfig,
    /// Sources that bypass every check.
    pub trusted_sources: HashSet<String>,
    /// Take the source from the first `X-Forwarded-For` hop.
    pub trust_forwarded_for: bool,
    /// Signatures added to the built-in table.
    pub extra_signatures: Vec<SignatureSpec>,
}

impl ShieldConfig {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> ShieldConfigBuilder {
        ShieldConfigBuilder::default()
    }

    /// Parse the trusted sources into addresses.
    ///
    /// # Errors
    ///
    /// Returns `ShieldError::Config` for an entry that is not an IP address.
    pub fn trusted_ips(&self) -> ShieldResult<HashSet<IpAddr>> {
        self.trusted_sources
            .iter()
            .map(|source| {
                source.trim().parse::<IpAddr>().map_err(|_| {
                    ShieldError::Config(format!("trusted source {source:?} is not an IP address"))
                })
            })
            .collect()
    }

    /// Reject settings that would disable a guard by accident.
    ///
    /// # Errors
    ///
    /// Returns `ShieldError::Config` describing the first invalid setting.
    pub fn validate(&self) -> ShieldResult<()> {
        let checks = [
            (self.brute_force.max_attempts == 0, "brute_force.max_attempts must be at least 1"),
            (self.brute_force.window.is_zero(), "brute_force.window must be non-zero"),
            (self.brute_force.block_duration.is_zero(), "brute_force.block_duration must be non-zero"),
            (self.enumeration.max_attempts == 0, "enumeration.max_attempts must be at least 1"),
            (self.enumeration.window.is_zero(), "enumeration.window must be non-zero"),
            (self.suspicion.block_threshold == 0, "suspicion.block_threshold must be at least 1"),
            (self.suspicion.block_duration.is_zero(), "suspicion.block_duration must be non-zero"),
            (self.cleanup.interval.is_zero(), "cleanup.interval must be non-zero"),
            (self.cleanup.max_age.is_zero(), "cleanup.max_age must be non-zero"),
            (self.request_size.max_bytes == 0, "request_size.max_bytes must be non-zero"),
            (self.stats.top_n == 0, "stats.top_n must be at least 1"),
        ];
        if let Some((_, message)) = checks.iter().find(|(invalid, _)| *invalid) {
            return Err(ShieldError::Config((*message).to_string()));
        }

        self.trusted_ips()?;
        for spec in &self.extra_signatures {
            spec.compile()?;
        }
        Ok(())
    }
}

/// Builder for `ShieldConfig`.
#[derive(Debug, Clone, Default)]
pub struct ShieldConfigBuilder {
    config: ShieldConfig,
}

impl ShieldConfigBuilder {
    /// Set brute-force configuration.
    #[must_use]
    pub fn brute_force(mut self, config: BruteForceConfig) -> Self {
        self.config.brute_force = config;
        self
    }

    /// Set enumeration configuration.
    #[must_use]
    pub fn enumeration(mut self, config: EnumerationConfig) -> Self {
        self.config.enumeration = config;
        self
    }

    /// Set suspicion configuration.
    #[must_use]
    pub fn suspicion(mut self, config: SuspicionConfig) -> Self {
        self.config.suspicion = config;
        self
    }

    /// Set cleanup configuration.
    #[must_use]
    pub fn cleanup(mut self, config: CleanupConfig) -> Self {
        self.config.cleanup = config;
        self
    }

    /// Set size guard configuration.
    #[must_use]
    pub fn request_size(mut self, config: RequestSizeConfig) -> Self {
        self.config.request_size = config;
        self
    }

    /// Set stats configuration.
    #[must_use]
    pub fn stats(mut self, config: StatsConfig) -> Self {
        self.config.stats = config;
        self
    }

    /// Add a trusted source.
    #[must_use]
    pub fn trust_source(mut self, source: impl Into<String>) -> Self {
        self.config.trusted_sources.insert(source.into());
        self
    }

    /// Trust `X-Forwarded-For`.
    #[must_use]
    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.config.trust_forwarded_for = trust;
        self
    }

    /// Add a signature.
    #[must_use]
    pub fn signature(mut self, spec: SignatureSpec) -> Self {
        self.config.extra_signatures.push(spec);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> ShieldConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::{AttackCategory, Severity};

    #[test]
    fn test_default_config() {
        let config = ShieldConfig::default();

        assert_eq!(config.brute_force.max_attempts, 5);
        assert_eq!(config.brute_force.window, Duration::from_secs(900));
        assert_eq!(config.enumeration.max_attempts, 20);
        assert_eq!(config.enumeration.window, Duration::from_secs(3600));
        assert_eq!(config.suspicion.block_threshold, 3);
        assert_eq!(config.suspicion.failure_policy, FailurePolicy::FailOpen);
        assert_eq!(config.cleanup.max_age, Duration::from_secs(86400));
        assert_eq!(config.request_size.max_bytes, 10 * 1024 * 1024);
        assert_eq!(config.stats.top_n, 10);
        assert!(!config.trust_forwarded_for);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = ShieldConfig::builder()
            .brute_force(BruteForceConfig {
                max_attempts: 3,
                ..BruteForceConfig::default()
            })
            .trust_source("127.0.0.1")
            .trust_forwarded_for(true)
            .build();

        assert_eq!(config.brute_force.max_attempts, 3);
        let trusted = config.trusted_ips().unwrap();
        assert!(trusted.contains(&"127.0.0.1".parse::<IpAddr>().unwrap()));
        assert!(!trusted.contains(&"10.0.0.1".parse::<IpAddr>().unwrap()));
        assert!(config.trust_forwarded_for);
    }

    #[test]
    fn test_protected_prefixes() {
        let config = BruteForceConfig::default();
        assert!(config.is_protected("/api/auth/login"));
        assert!(config.is_protected("/api/admin/users"));
        assert!(!config.is_protected("/api/bookings"));
    }

    #[test]
    fn test_id_lookup_paths() {
        let config = EnumerationConfig::default();
        assert!(config.is_id_lookup("/api/bookings/42"));
        assert!(config.is_id_lookup("/api/bookings/42/confirm"));
        assert!(config.is_id_lookup("/api/users/3f2a9c1e-7b4d-4e8a-9f00-1c2d3e4f5a6b"));
        assert!(!config.is_id_lookup("/api/bookings/"));
        assert!(!config.is_id_lookup("/api/bookings/search"));
        assert!(!config.is_id_lookup("/api/users/deadbeef"));
        assert!(!config.is_id_lookup("/api/products/42"));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = ShieldConfig::builder()
            .suspicion(SuspicionConfig {
                block_threshold: 0,
                ..SuspicionConfig::default()
            })
            .build();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("block_threshold"));

        let config = ShieldConfig::builder()
            .brute_force(BruteForceConfig {
                window: Duration::ZERO,
                ..BruteForceConfig::default()
            })
            .build();
        assert!(matches!(config.validate(), Err(ShieldError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_signature() {
        let config = ShieldConfig::builder()
            .signature(SignatureSpec::url("[", AttackCategory::AdminProbe, Severity::Low))
            .build();
        assert!(matches!(config.validate(), Err(ShieldError::Config(_))));
    }

    #[test]
    fn test_trusted_ips_normalized() {
        let config = ShieldConfig::builder()
            .trust_source("2001:db8:0:0:0:0:0:1")
            .trust_source(" 10.0.0.1 ")
            .build();
        let trusted = config.trusted_ips().unwrap();

        assert!(trusted.contains(&"2001:db8::1".parse::<IpAddr>().unwrap()));
        assert!(trusted.contains(&"10.0.0.1".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn test_validate_rejects_bad_trusted_source() {
        let config = ShieldConfig::builder().trust_source("gateway.local").build();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("gateway.local"));
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = ShieldConfig::builder().trust_source("10.0.0.1").build();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ShieldConfig = serde_json::from_str(&json).unwrap();

        assert!(parsed.trusted_sources.contains("10.0.0.1"));
        assert_eq!(parsed.brute_force.max_attempts, config.brute_force.max_attempts);
    }
}
