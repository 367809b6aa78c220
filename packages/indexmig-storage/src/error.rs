//! Error types for indexmig-storage

use std::fmt;
use thiserror::Error;

/// Storage error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Database errors (SQLite)
    Database,
    /// Serialization/deserialization errors
    Serialization,
    /// Index not found
    IndexNotFound,
    /// Index version not found
    VersionNotFound,
    /// Action not found
    ActionNotFound,
    /// Attempt to modify an action that already reached a terminal status
    ActionFinalized,
    /// Version state change not allowed by the lifecycle
    InvalidTransition,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Database => "database",
            ErrorKind::Serialization => "serialization",
            ErrorKind::IndexNotFound => "index_not_found",
            ErrorKind::VersionNotFound => "version_not_found",
            ErrorKind::ActionNotFound => "action_not_found",
            ErrorKind::ActionFinalized => "action_finalized",
            ErrorKind::InvalidTransition => "invalid_transition",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Storage error type
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StorageError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    // Convenience constructors
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn index_not_found(name: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::IndexNotFound,
            format!("Index not found: {}", name.into()),
        )
    }

    pub fn version_not_found(version: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::VersionNotFound,
            format!("Index version not found: {}", version),
        )
    }

    pub fn action_not_found(action_id: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::ActionNotFound,
            format!("Index action not found: {}", action_id),
        )
    }

    pub fn action_finalized(action_id: impl fmt::Display, status: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::ActionFinalized,
            format!("Index action {} is already {} and cannot change", action_id, status),
        )
    }

    pub fn invalid_transition(
        version: impl fmt::Display,
        from: impl fmt::Display,
        to: impl fmt::Display,
    ) -> Self {
        Self::new(
            ErrorKind::InvalidTransition,
            format!("Index version {} cannot move from {} to {}", version, from, to),
        )
    }
}

// SQLite error conversions
#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::database(format!("SQLite error: {}", err)).with_source(err)
    }
}

// JSON error conversions
impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::serialization(format!("JSON error: {}", err)).with_source(err)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    // ═══════════════════════════════════════════════════════════════════════
    // Error Construction Tests
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn test_database_error() {
        let err = StorageError::database("Connection failed");
        assert_eq!(err.kind, ErrorKind::Database);
        assert_eq!(err.message, "Connection failed");
        assert!(err.source.is_none());
        assert_eq!(format!("{}", err), "[database] Connection failed");
    }

    #[test]
    fn test_index_not_found() {
        let err = StorageError::index_not_found("movies");
        assert_eq!(err.kind, ErrorKind::IndexNotFound);

        let msg = format!("{}", err);
        assert!(msg.contains("[index_not_found]"));
        assert!(msg.contains("movies"));
    }

    #[test]
    fn test_version_not_found() {
        let err = StorageError::version_not_found("movies-3");
        assert_eq!(err.kind, ErrorKind::VersionNotFound);
        assert!(format!("{}", err).contains("movies-3"));
    }

    #[test]
    fn test_action_finalized() {
        let err = StorageError::action_finalized("abc", "success");
        assert_eq!(err.kind, ErrorKind::ActionFinalized);
        assert!(err.message.contains("already success"));
    }

    #[test]
    fn test_invalid_transition() {
        let err = StorageError::invalid_transition("movies-2", "dropped", "built");
        assert_eq!(err.kind, ErrorKind::InvalidTransition);
        assert_eq!(
            err.to_string(),
            "[invalid_transition] Index version movies-2 cannot move from dropped to built"
        );
    }

    #[test]
    fn test_with_source() {
        use std::io;

        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = StorageError::database("DB file missing").with_source(io_err);

        assert!(err.source.is_some());
        let source = err.source().unwrap();
        assert!(source.to_string().contains("file not found"));
    }

    #[test]
    fn test_error_kind_as_str() {
        assert_eq!(ErrorKind::Database.as_str(), "database");
        assert_eq!(ErrorKind::Serialization.as_str(), "serialization");
        assert_eq!(ErrorKind::IndexNotFound.as_str(), "index_not_found");
        assert_eq!(ErrorKind::VersionNotFound.as_str(), "version_not_found");
        assert_eq!(ErrorKind::ActionNotFound.as_str(), "action_not_found");
        assert_eq!(ErrorKind::ActionFinalized.as_str(), "action_finalized");
        assert_eq!(ErrorKind::InvalidTransition.as_str(), "invalid_transition");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Conversion Tests
    // ═══════════════════════════════════════════════════════════════════════

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_from_rusqlite_error() {
        let err: StorageError = rusqlite::Error::QueryReturnedNoRows.into();

        assert_eq!(err.kind, ErrorKind::Database);
        assert!(err.message.contains("SQLite error"));
        assert!(err.source.is_some());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json")
            .err()
            .unwrap();
        let err: StorageError = json_err.into();

        assert_eq!(err.kind, ErrorKind::Serialization);
        assert!(err.message.contains("JSON error"));
    }

    #[test]
    fn test_result_propagation() {
        fn inner() -> Result<()> {
            Err(StorageError::version_not_found("movies-1"))
        }

        fn outer() -> Result<()> {
            inner()?;
            Ok(())
        }

        let err = outer().unwrap_err();
        assert_eq!(err.kind, ErrorKind::VersionNotFound);
    }
}
