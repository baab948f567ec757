//! Error types for storage operations

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// No record exists for the key, in either backend
    #[error("Resource not found: {key}")]
    NotFound { key: String },

    /// The key has a shape the requested operation does not accept
    #[error("Invalid key {key}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// A migration step raised; recorded and skipped, never propagated
    #[error("Migration {index} ({name}) failed: {reason}")]
    MigrationStepFailed {
        index: usize,
        name: String,
        reason: String,
    },

    /// Store initialization (migrations or bulk import) failed
    #[error("Storage initialization failed: {0}")]
    Init(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl StorageError {
    pub fn not_found(key: impl Into<String>) -> Self {
        StorageError::NotFound { key: key.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// Convenience type alias for Result with StorageError
pub type StorageResult<T> = Result<T, StorageError>;

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
