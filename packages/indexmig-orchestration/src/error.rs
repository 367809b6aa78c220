use indexmig_storage::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Unknown or ambiguous index name: {0}")]
    NameResolution(String),

    #[error("Index {0} has no active version")]
    NoActiveVersion(String),

    #[error("Index {0} has no created version")]
    NoCreatedVersion(String),

    #[error("Index version {0} is not built")]
    VersionNotBuilt(String),

    #[error("Failed to create remote index {name}: {reason}")]
    RemoteIndexCreate { name: String, reason: String },

    #[error("Failed to drop remote index {name}: {reason}")]
    RemoteIndexDrop { name: String, reason: String },

    #[error("Bulk write to {name} failed: {reason}")]
    RemoteBulkWrite { name: String, reason: String },

    #[error("Update of {version} finished with {failed} of {attempted} documents failed")]
    PartialUpdateFailure {
        version: String,
        attempted: u64,
        failed: u64,
    },

    #[error("Concurrent modification of {0}")]
    ConcurrentModification(String),

    #[error("Dropping {0} requires an exact version name")]
    IndexVersionRequired(String),

    #[error("Reset was not confirmed")]
    ResetNotConfirmed,

    #[error("No document producer registered for index {0}")]
    ProducerNotRegistered(String),

    #[error("Document source error: {0}")]
    DocumentSource(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn document_source<E: std::fmt::Display>(e: E) -> Self {
        Self::DocumentSource(e.to_string())
    }

    /// Retry class of this error, for callers that schedule retries
    pub fn category(&self) -> ErrorCategory {
        match self {
            OrchestratorError::RemoteBulkWrite { .. }
            | OrchestratorError::ConcurrentModification(_) => ErrorCategory::Transient,
            OrchestratorError::RemoteIndexCreate { .. }
            | OrchestratorError::RemoteIndexDrop { .. }
            | OrchestratorError::DocumentSource(_)
            | OrchestratorError::Storage(_)
            | OrchestratorError::Io(_) => ErrorCategory::Infrastructure,
            _ => ErrorCategory::Permanent,
        }
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Transient error - retry automatically (e.g., timeout, throttling)
    Transient,
    /// Permanent error - don't retry (e.g., rejected mapping, bad document)
    Permanent,
    /// Infrastructure error - abort the run (e.g., cluster unreachable)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(ErrorCategory::Transient),
            "permanent" => Ok(ErrorCategory::Permanent),
            "infrastructure" => Ok(ErrorCategory::Infrastructure),
            _ => Err(OrchestratorError::config(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
