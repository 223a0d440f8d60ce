//! Error types for the library

use thiserror::Error;

use crate::query::error::QueryError;

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    /// Query error (validation, planning, execution, merge)
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    /// Backing-store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Backing-store errors
///
/// The store boundary reports "collection absent" as a structured
/// variant. Some document stores only surface the condition as error
/// text; [`StoreError::is_not_found`] recognizes both.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Target table/collection does not exist
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Table name failed the safe-charset check
    #[error("Invalid table name: {0}")]
    InvalidTable(String),

    /// Connection to the store failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Pipeline execution failed inside the store
    #[error("Execution error: {0}")]
    Execution(String),

    /// Serialization failed at the store boundary
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether this error means the target collection is absent.
    ///
    /// Matches the structured variant, and falls back to scanning the
    /// message for `"does not exist"` for stores that only report the
    /// condition textually.
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::TableNotFound(_) => true,
            other => other.to_string().contains("does not exist"),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_not_found() {
        let err = StoreError::TableNotFound("events".into());
        assert!(err.is_not_found());
    }

    #[test]
    fn test_textual_not_found() {
        // Interop path: stores that only report the condition as text
        let err = StoreError::Execution("Table `analytics.events` does not exist.".into());
        assert!(err.is_not_found());
    }

    #[test]
    fn test_other_errors_are_not_not_found() {
        let err = StoreError::Connection("refused".into());
        assert!(!err.is_not_found());
        let err = StoreError::Execution("index missing".into());
        assert!(!err.is_not_found());
    }
}
