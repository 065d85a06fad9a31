//! Error types for the migration runner
//!
//! Every variant is fatal at the runner level: nothing is retried and nothing
//! is downgraded to a warning.

use std::path::PathBuf;
use thiserror::Error;

/// ORM result type alias
pub type OrmResult<T> = Result<T, OrmError>;

/// Error types for database and migration operations
#[derive(Debug, Error)]
pub enum OrmError {
    /// File or directory could not be read
    #[error("IO error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Driver-level SQL failure
    #[error("Query error: {0}")]
    Query(String),

    /// A write affected a different number of rows than asserted
    #[error("Expected {expected} affected row(s), got {actual}")]
    RowCountMismatch { expected: u64, actual: u64 },

    /// A lookup expected at most one row
    #[error("Non-unique result: {count} rows returned")]
    NonUniqueResult { count: usize },

    /// A lookup expected exactly one row and got none
    #[error("No rows returned")]
    EmptyResult,

    /// BEGIN / COMMIT / ROLLBACK failed
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Pool or connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Requested column is not part of the row
    #[error("Column '{0}' not found")]
    ColumnNotFound(String),

    /// Column value could not be converted
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Migration script could not be loaded or is invalid
    #[error("Migration error: {0}")]
    Migration(String),

    /// Invalid runner configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl OrmError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        OrmError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<sqlx::Error> for OrmError {
    fn from(err: sqlx::Error) -> Self {
        OrmError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for OrmError {
    fn from(err: serde_json::Error) -> Self {
        OrmError::Serialization(err.to_string())
    }
}
