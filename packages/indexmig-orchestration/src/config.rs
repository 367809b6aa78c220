//! Manager configuration
//!
//! Loaded from a versioned YAML file, then overridden by `INDEXMIG_*`
//! environment variables:
//!
//! ```yaml
//! version: 1
//! environment_prefix: "qa_"
//! codebase_id: "v2.3.1"
//! batch_size: 500
//! workers: all        # or a number
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::OrchestratorError;

pub const ENV_ENVIRONMENT_PREFIX: &str = "INDEXMIG_ENVIRONMENT_PREFIX";
pub const ENV_CODEBASE_ID: &str = "INDEXMIG_CODEBASE_ID";
pub const ENV_BATCH_SIZE: &str = "INDEXMIG_BATCH_SIZE";
pub const ENV_WORKERS: &str = "INDEXMIG_WORKERS";

const SUPPORTED_VERSIONS: &[u32] = &[1];

/// Characters the search engine refuses in index names
const FORBIDDEN_NAME_CHARS: &[char] = &['\\', '/', '*', '?', '"', '<', '>', '|', ',', '#'];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing 'version' field in configuration file. Add 'version: 1' to the top of your YAML file.")]
    MissingVersion,

    #[error("Unsupported configuration version {found}. Supported versions: {}", supported.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
    UnsupportedVersion { found: u64, supported: Vec<u32> },

    #[error("Invalid value for '{field}': {value}. {hint}")]
    Invalid {
        field: String,
        value: String,
        hint: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

impl From<ConfigError> for OrchestratorError {
    fn from(err: ConfigError) -> Self {
        OrchestratorError::config(err)
    }
}

fn invalid(field: &str, value: impl fmt::Display, hint: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        value: value.to_string(),
        hint: hint.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// WorkerCount
// ═══════════════════════════════════════════════════════════════════════════

/// Size of the reindexing worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WorkerSpec", into = "WorkerSpec")]
pub enum WorkerCount {
    Fixed(usize),
    /// One worker per CPU, minus one for the coordinator
    AllCpus,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WorkerSpec {
    Count(usize),
    Keyword(String),
}

impl TryFrom<WorkerSpec> for WorkerCount {
    type Error = String;

    fn try_from(spec: WorkerSpec) -> Result<Self, Self::Error> {
        match spec {
            WorkerSpec::Count(n) => Ok(WorkerCount::Fixed(n)),
            WorkerSpec::Keyword(keyword) => keyword.parse(),
        }
    }
}

impl From<WorkerCount> for WorkerSpec {
    fn from(count: WorkerCount) -> Self {
        match count {
            WorkerCount::Fixed(n) => WorkerSpec::Count(n),
            WorkerCount::AllCpus => WorkerSpec::Keyword("all".to_string()),
        }
    }
}

impl FromStr for WorkerCount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("all") {
            return Ok(WorkerCount::AllCpus);
        }
        trimmed
            .parse::<usize>()
            .map(WorkerCount::Fixed)
            .map_err(|_| format!("expected 'all' or a worker count, got '{}'", s))
    }
}

impl Default for WorkerCount {
    fn default() -> Self {
        WorkerCount::Fixed(1)
    }
}

impl WorkerCount {
    /// Concrete pool size
    pub fn resolve(&self) -> usize {
        match self {
            WorkerCount::Fixed(n) => *n,
            WorkerCount::AllCpus => num_cpus::get().saturating_sub(1).max(1),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ManagerConfig
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ManagerConfig {
    /// Prepended to every remote index name (e.g. `qa_`)
    pub environment_prefix: String,
    /// Identifier of the deployed code, stored on every created version
    pub codebase_id: String,
    pub batch_size: usize,
    pub workers: WorkerCount,
    /// Bulk write attempts after the first one, for transient errors
    pub max_retries: u32,
    /// First retry delay; doubled on every retry
    pub retry_backoff_ms: u64,
    /// Failure reasons kept per update run
    pub failure_sample_limit: usize,
    /// Heartbeat age after which an in-progress action counts as stalled
    pub stall_after_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            environment_prefix: String::new(),
            codebase_id: String::new(),
            batch_size: 1000,
            workers: WorkerCount::default(),
            max_retries: 5,
            retry_backoff_ms: 2000,
            failure_sample_limit: 20,
            stall_after_secs: 600,
        }
    }
}

impl ManagerConfig {
    /// Load a v1 YAML file, apply environment overrides, validate
    pub fn from_yaml(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a v1 YAML document (no overrides, no validation)
    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let mut document: serde_yaml::Mapping = serde_yaml::from_str(content)?;

        let version = document
            .remove("version")
            .ok_or(ConfigError::MissingVersion)?;
        let found = version
            .as_u64()
            .ok_or_else(|| invalid("version", format!("{:?}", version), "Use 'version: 1'."))?;
        if !SUPPORTED_VERSIONS.iter().any(|v| u64::from(*v) == found) {
            return Err(ConfigError::UnsupportedVersion {
                found,
                supported: SUPPORTED_VERSIONS.to_vec(),
            });
        }

        Ok(serde_yaml::from_value(serde_yaml::Value::Mapping(document))?)
    }

    /// Serialize as a v1 YAML document
    pub fn to_yaml(&self) -> ConfigResult<String> {
        let document = match serde_yaml::to_value(self)? {
            serde_yaml::Value::Mapping(map) => map,
            _ => serde_yaml::Mapping::new(),
        };
        let mut versioned = serde_yaml::Mapping::new();
        versioned.insert("version".into(), 1u64.into());
        versioned.extend(document);
        Ok(serde_yaml::to_string(&versioned)?)
    }

    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        self.apply_overrides_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup (the environment in production)
    pub fn apply_overrides_with<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(prefix) = lookup(ENV_ENVIRONMENT_PREFIX) {
            self.environment_prefix = prefix;
        }
        if let Some(codebase_id) = lookup(ENV_CODEBASE_ID) {
            self.codebase_id = codebase_id;
        }
        if let Some(raw) = lookup(ENV_BATCH_SIZE) {
            self.batch_size = raw
                .trim()
                .parse()
                .map_err(|_| invalid(ENV_BATCH_SIZE, &raw, "Expected a positive integer."))?;
        }
        if let Some(raw) = lookup(ENV_WORKERS) {
            self.workers = raw
                .parse()
                .map_err(|e: String| invalid(ENV_WORKERS, &raw, &e))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.batch_size == 0 {
            return Err(invalid("batch_size", 0, "Batch size must be at least 1."));
        }
        if self.workers == WorkerCount::Fixed(0) {
            return Err(invalid(
                "workers",
                0,
                "Use at least 1 worker, or 'all' for one per CPU.",
            ));
        }
        if let Some(bad) = self.environment_prefix.chars().find(|c| {
            c.is_uppercase() || c.is_whitespace() || FORBIDDEN_NAME_CHARS.contains(c)
        }) {
            return Err(invalid(
                "environment_prefix",
                &self.environment_prefix,
                &format!("Index names cannot contain {:?}.", bad),
            ));
        }
        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn stall_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stall_after_secs as i64)
    }
}
