//! Request classification against the signature table.

use serde::Serialize;

use crate::config::ShieldConfig;
use crate::error::{ShieldError, ShieldResult};
use crate::signature::{AttackCategory, Severity, SignatureTable};

/// A signature match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    /// Matched category.
    pub category: AttackCategory,
    /// Severity of the signature.
    pub severity: Severity,
    /// Pattern that matched.
    pub pattern: String,
}

/// Scans request URLs and user agents for attack signatures.
#[derive(Debug, Clone, Default)]
pub struct RequestClassifier {
    table: SignatureTable,
}

impl RequestClassifier {
    /// Create a classifier over `table`.
    #[must_use]
    pub const fn new(table: SignatureTable) -> Self {
        Self { table }
    }

    /// Built-in signatures plus any configured extras.
    ///
    /// # Errors
    ///
    /// Returns `ShieldError::Config` if an extra signature fails to compile.
    pub fn from_config(config: &ShieldConfig) -> ShieldResult<Self> {
        Ok(Self::new(SignatureTable::with_extra(&config.extra_signatures)?))
    }

    /// Classify a request by URL (path and query) and raw `User-Agent` bytes.
    ///
    /// # Errors
    ///
    /// Returns `ShieldError::Classification` when the user agent cannot be
    /// decoded. Callers apply the configured failure policy.
    pub fn classify(
        &self,
        url: &str,
        user_agent: Option<&[u8]>,
    ) -> ShieldResult<Option<Classification>> {
        let user_agent = user_agent
            .map(std::str::from_utf8)
            .transpose()
            .map_err(|e| ShieldError::Classification(format!("undecodable user agent: {e}")))?;

        Ok(self.table.classify(url, user_agent).map(|signature| Classification {
            category: signature.category,
            severity: signature.severity,
            pattern: signature.pattern().to_string(),
        }))
    }

    /// The signature table in use.
    #[must_use]
    pub const fn table(&self) -> &SignatureTable {
        &self.table
    }
}
