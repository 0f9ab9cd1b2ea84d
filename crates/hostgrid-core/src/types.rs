//! Shared types used across hostgrid crates.
//!
//! Keys are slash-separated on the wire (`project/service/version` and
//! `project/service/version/revision`). On disk and inside supervisor watch
//! names a revision is flattened to `project_service_version_revision`; the
//! identifier alphabet excludes `_` so that form is unambiguous.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Separator used by the textual form of version and revision keys.
pub const VERSION_PATH_SEPARATOR: char = '/';

/// Separator used when a revision key is flattened into a single path or
/// watch-name component.
pub const REVISION_DIR_SEPARATOR: char = '_';

/// Errors produced while parsing or validating identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("invalid {kind} identifier: {value:?}")]
    InvalidIdentifier { kind: &'static str, value: String },

    #[error("malformed version key: {0:?}")]
    MalformedVersionKey(String),

    #[error("malformed revision key: {0:?}")]
    MalformedRevisionKey(String),
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9-]{0,99}$").expect("valid identifier regex")
    })
}

/// Check a single key component (project, service or version id).
pub fn validate_identifier(kind: &'static str, value: &str) -> Result<(), KeyError> {
    if identifier_pattern().is_match(value) {
        Ok(())
    } else {
        Err(KeyError::InvalidIdentifier {
            kind,
            value: value.to_string(),
        })
    }
}

/// Validate a tenant project id.
pub fn validate_project_id(project_id: &str) -> Result<(), KeyError> {
    validate_identifier("project", project_id)
}

// ── Version / revision keys ───────────────────────────────────────

/// Identifies a deployable unit: `project/service/version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionKey {
    project_id: String,
    service_id: String,
    version_id: String,
}

impl VersionKey {
    pub fn new(project_id: &str, service_id: &str, version_id: &str) -> Result<Self, KeyError> {
        validate_identifier("project", project_id)?;
        validate_identifier("service", service_id)?;
        validate_identifier("version", version_id)?;
        Ok(Self {
            project_id: project_id.to_string(),
            service_id: service_id.to_string(),
            version_id: version_id.to_string(),
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn version_id(&self) -> &str {
        &self.version_id
    }

    /// The revision key for a specific deployed revision of this version.
    pub fn revision(&self, revision: u64) -> RevisionKey {
        RevisionKey {
            version: self.clone(),
            revision,
        }
    }

    /// Short stable tag for this version's log lines, safe to use as a
    /// syslog identifier regardless of key length.
    pub fn log_tag(&self) -> String {
        let digest = Sha256::digest(self.to_string().as_bytes());
        format!("app-{}", &hex::encode(digest)[..12])
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}",
            self.project_id,
            self.service_id,
            self.version_id,
            sep = VERSION_PATH_SEPARATOR
        )
    }
}

impl FromStr for VersionKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(VERSION_PATH_SEPARATOR).collect();
        match parts.as_slice() {
            [project, service, version] => Self::new(project, service, version),
            _ => Err(KeyError::MalformedVersionKey(s.to_string())),
        }
    }
}

impl TryFrom<String> for VersionKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VersionKey> for String {
    fn from(key: VersionKey) -> Self {
        key.to_string()
    }
}

/// One immutable deployed artifact of a version: `project/service/version/revision`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RevisionKey {
    version: VersionKey,
    revision: u64,
}

impl RevisionKey {
    pub fn version_key(&self) -> &VersionKey {
        &self.version
    }

    pub fn project_id(&self) -> &str {
        self.version.project_id()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Flattened form used for source directories and watch names.
    pub fn dir_name(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}{sep}{}",
            self.version.project_id,
            self.version.service_id,
            self.version.version_id,
            self.revision,
            sep = REVISION_DIR_SEPARATOR
        )
    }

    /// Inverse of [`RevisionKey::dir_name`].
    pub fn from_dir_name(name: &str) -> Result<Self, KeyError> {
        let parts: Vec<&str> = name.split(REVISION_DIR_SEPARATOR).collect();
        match parts.as_slice() {
            [project, service, version, revision] => {
                let revision = revision
                    .parse::<u64>()
                    .map_err(|_| KeyError::MalformedRevisionKey(name.to_string()))?;
                Ok(VersionKey::new(project, service, version)?.revision(revision))
            }
            _ => Err(KeyError::MalformedRevisionKey(name.to_string())),
        }
    }
}

impl fmt::Display for RevisionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.version, VERSION_PATH_SEPARATOR, self.revision)
    }
}

impl FromStr for RevisionKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (version, revision) = s
            .rsplit_once(VERSION_PATH_SEPARATOR)
            .ok_or_else(|| KeyError::MalformedRevisionKey(s.to_string()))?;
        let revision = revision
            .parse::<u64>()
            .map_err(|_| KeyError::MalformedRevisionKey(s.to_string()))?;
        Ok(version.parse::<VersionKey>()?.revision(revision))
    }
}

impl TryFrom<String> for RevisionKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RevisionKey> for String {
    fn from(key: RevisionKey) -> Self {
        key.to_string()
    }
}

// ── Instance ──────────────────────────────────────────────────────

/// One running application-server process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Instance {
    pub revision_key: RevisionKey,
    pub port: u16,
}

impl Instance {
    pub fn new(revision_key: RevisionKey, port: u16) -> Self {
        Self { revision_key, port }
    }

    pub fn version_key(&self) -> &VersionKey {
        self.revision_key.version_key()
    }

    pub fn project_id(&self) -> &str {
        self.revision_key.project_id()
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.revision_key, self.port)
    }
}

// ── Desired state ─────────────────────────────────────────────────

/// Desired-state record pushed by the scheduler.
///
/// A `None` port asks for one instance on any free port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub version_key: VersionKey,
    pub ports: Vec<Option<u16>>,
}

/// Externally supplied descriptor of a version, owned by the version registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionConfig {
    /// Runtime name, e.g. "python27", "go", "php", "java".
    pub runtime: String,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    /// Memory limit in MB. Falls back to the instance class, then the agent default.
    #[serde(default)]
    pub max_memory: Option<u64>,
    #[serde(default)]
    pub instance_class: Option<String>,
    pub revision: u64,
    pub source_archive_url: String,
    #[serde(default)]
    pub login_server: Option<String>,
}

/// Memory in MB granted to a named instance class.
pub fn instance_class_memory(class: &str) -> Option<u64> {
    match class {
        "F1" => Some(128),
        "F2" => Some(256),
        "F4" => Some(512),
        "F4_1G" => Some(1024),
        _ => None,
    }
}

impl VersionConfig {
    /// Resolve the memory limit for this version in MB.
    pub fn resolved_max_memory(&self, default_mb: u64) -> u64 {
        self.max_memory
            .or_else(|| self.instance_class.as_deref().and_then(instance_class_memory))
            .unwrap_or(default_mb)
    }
}

/// Result of an idempotent command against an external collaborator.
///
/// `AlreadyAbsent` means the target did not exist, which callers treat as
/// the desired state already holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    AlreadyAbsent,
}

impl Outcome {
    pub fn is_applied(self) -> bool {
        self == Outcome::Applied
    }
}
