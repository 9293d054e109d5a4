//! Attack signatures.
//!
//! A small, deduplicated table of patterns matched against the request URL
//! and `User-Agent`. Lookup is a linear scan in table order, first match wins.

use std::fmt;

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{ShieldError, ShieldResult};

/// What a signature detects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackCategory {
    /// `../` and its encoded forms.
    PathTraversal,
    /// Probes for well-known OS files.
    SystemFileProbe,
    /// Encoded NUL bytes used to truncate paths.
    NullByteInjection,
    /// SQL injection markers.
    SqlInjection,
    /// Shell metacharacters followed by a command.
    CommandInjection,
    /// Script tags and `javascript:` URLs.
    ScriptInjection,
    /// Admin panel enumeration.
    AdminProbe,
    /// Dotfile and config file enumeration.
    ConfigProbe,
    /// User agents of known attack tools.
    ScannerUserAgent,
}

impl AttackCategory {
    /// Stable name used in logs and stats.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PathTraversal => "path_traversal",
            Self::SystemFileProbe => "system_file_probe",
            Self::NullByteInjection => "null_byte_injection",
            Self::SqlInjection => "sql_injection",
            Self::CommandInjection => "command_injection",
            Self::ScriptInjection => "script_injection",
            Self::AdminProbe => "admin_probe",
            Self::ConfigProbe => "config_probe",
            Self::ScannerUserAgent => "scanner_user_agent",
        }
    }
}

impl fmt::Display for AttackCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How serious a match is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Noise, usually automated.
    Low,
    /// Probing.
    Medium,
    /// Active exploitation attempt.
    High,
}

/// Which part of the request a signature inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTarget {
    /// Path and query string.
    #[default]
    Url,
    /// `User-Agent` header.
    UserAgent,
}

/// Serializable signature definition, used for operator-supplied rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureSpec {
    /// Case-insensitive regular expression.
    pub pattern: String,
    /// Category reported on match.
    pub category: AttackCategory,
    /// Severity reported on match.
    pub severity: Severity,
    /// Part of the request to inspect.
    #[serde(default)]
    pub target: MatchTarget,
}

impl SignatureSpec {
    /// Create a URL signature.
    #[must_use]
    pub fn url(pattern: impl Into<String>, category: AttackCategory, severity: Severity) -> Self {
        Self {
            pattern: pattern.into(),
            category,
            severity,
            target: MatchTarget::Url,
        }
    }

    /// Create a `User-Agent` signature.
    #[must_use]
    pub fn user_agent(pattern: impl Into<String>, severity: Severity) -> Self {
        Self {
            pattern: pattern.into(),
            category: AttackCategory::ScannerUserAgent,
            severity,
            target: MatchTarget::UserAgent,
        }
    }

    /// Compile into a matcher.
    ///
    /// # Errors
    ///
    /// Returns `ShieldError::Config` if the pattern is not a valid regex.
    pub fn compile(&self) -> ShieldResult<Signature> {
        let pattern = RegexBuilder::new(&self.pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| ShieldError::Config(format!("invalid signature {:?}: {e}", self.pattern)))?;

        Ok(Signature {
            pattern,
            category: self.category,
            severity: self.severity,
            target: self.target,
        })
    }
}

/// A compiled signature.
#[derive(Debug, Clone)]
pub struct Signature {
    pattern: Regex,
    /// Category reported on match.
    pub category: AttackCategory,
    /// Severity reported on match.
    pub severity: Severity,
    /// Part of the request inspected.
    pub target: MatchTarget,
}

impl Signature {
    /// Source text of the pattern.
    #[must_use]
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    fn is_match(&self, url: &str, user_agent: Option<&str>) -> bool {
        match self.target {
            MatchTarget::Url => self.pattern.is_match(url),
            MatchTarget::UserAgent => user_agent.is_some_and(|ua| self.pattern.is_match(ua)),
        }
    }
}

const PATH_TRAVERSAL: &str = r"\.\./|\.\.\\|\.\.%2f|\.\.%5c|%2e%2e(/|\\|%2f|%5c)|%252e%252e";

const SYSTEM_FILES: &str =
    r"/etc/(passwd|shadow|hosts|group)|/proc/self/|win\.ini|boot\.ini|/windows/system32";

const SQL_INJECTION: &str = concat!(
    r"union(\s|%20|\+)+(all(\s|%20|\+)+)?select",
    r"|('|%27)(\s|%20|\+)*or(\s|%20|\+)+\d+=\d+",
    r"|;(\s|%20)*drop(\s|%20)+table",
    r"|sleep\(\d+\)|benchmark\(|information_schema",
);

const COMMAND_INJECTION: &str = concat!(
    r"(;|%3b|\||%7c|`|%60|\$\(|%24%28)(\s|%20|\+)*",
    r"(cat|ls|wget|curl|bash|sh|nc|id|whoami|uname)\b",
);

const SCRIPT_INJECTION: &str = r"<script|%3cscript|javascript:|onerror(\s|%20)*=";

const ADMIN_PATHS: &str = concat!(
    r"/(wp-admin|wp-login\.php|phpmyadmin|pma|administrator|admin\.php|manager/html|cgi-bin)",
    r"(/|\?|$)",
);

const CONFIG_PATHS: &str = concat!(
    r"/(\.env|\.git|\.svn|\.htaccess|\.htpasswd|\.aws|\.ds_store|web\.config",
    r"|config\.(php|json|ya?ml)|xmlrpc\.php)(/|\?|$)",
);

const SCANNER_AGENTS: &str = concat!(
    r"sqlmap|nikto|nmap|masscan|nessus|acunetix|dirbuster|gobuster|wpscan|nuclei",
    r"|havij|w3af|openvas",
);

const SCRIPTED_AGENTS: &str = r"zgrab|python-requests/[0-9.]+\s*$|go-http-client|libwww-perl";

fn builtin_specs() -> Vec<SignatureSpec> {
    use AttackCategory::{
        AdminProbe, CommandInjection, ConfigProbe, NullByteInjection, PathTraversal,
        ScriptInjection, SqlInjection, SystemFileProbe,
    };
    use Severity::{High, Low, Medium};

    vec![
        SignatureSpec::url(PATH_TRAVERSAL, PathTraversal, High),
        SignatureSpec::url(SYSTEM_FILES, SystemFileProbe, High),
        SignatureSpec::url(r"%00", NullByteInjection, Medium),
        SignatureSpec::url(SQL_INJECTION, SqlInjection, High),
        SignatureSpec::url(COMMAND_INJECTION, CommandInjection, High),
        SignatureSpec::url(SCRIPT_INJECTION, ScriptInjection, Medium),
        SignatureSpec::url(ADMIN_PATHS, AdminProbe, Medium),
        SignatureSpec::url(CONFIG_PATHS, ConfigProbe, High),
        SignatureSpec::user_agent(SCANNER_AGENTS, Medium),
        SignatureSpec::user_agent(SCRIPTED_AGENTS, Low),
    ]
}

/// Built-in table. The patterns are literals, so compilation cannot fail.
static BUILTIN: Lazy<SignatureTable> = Lazy::new(|| {
    SignatureTable::from_specs(&builtin_specs()).unwrap_or_else(|_| unreachable!())
});

/// Ordered, deduplicated set of signatures.
#[derive(Debug, Clone)]
pub struct SignatureTable {
    signatures: Vec<Signature>,
}

impl SignatureTable {
    /// Table with no signatures.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            signatures: Vec::new(),
        }
    }

    /// The built-in table.
    #[must_use]
    pub fn builtin() -> Self {
        BUILTIN.clone()
    }

    /// Built-in table followed by `extra` signatures.
    ///
    /// # Errors
    ///
    /// Returns `ShieldError::Config` if any extra pattern fails to compile.
    pub fn with_extra(extra: &[SignatureSpec]) -> ShieldResult<Self> {
        let mut table = Self::builtin();
        for spec in extra {
            table.push(spec.compile()?);
        }
        Ok(table)
    }

    /// Compile a table from specs, dropping duplicates.
    ///
    /// # Errors
    ///
    /// Returns `ShieldError::Config` if a pattern fails to compile.
    pub fn from_specs(specs: &[SignatureSpec]) -> ShieldResult<Self> {
        let mut table = Self::empty();
        for spec in specs {
            table.push(spec.compile()?);
        }
        Ok(table)
    }

    /// Add a signature unless one with the same pattern, category and target exists.
    pub fn push(&mut self, signature: Signature) -> bool {
        let duplicate = self.signatures.iter().any(|s| {
            s.category == signature.category
                && s.target == signature.target
                && s.pattern() == signature.pattern()
        });
        if !duplicate {
            self.signatures.push(signature);
        }
        !duplicate
    }

    /// First signature matching the URL or user agent.
    #[must_use]
    pub fn classify(&self, url: &str, user_agent: Option<&str>) -> Option<&Signature> {
        self.signatures.iter().find(|s| s.is_match(url, user_agent))
    }

    /// Number of signatures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

impl Default for SignatureTable {
    fn default() -> Self {
        Self::builtin()
    }
}
