//! Core trait definition for pluggable document stores

use async_trait::async_trait;

use crate::error::StoreError;
use crate::pipeline::Stage;
use crate::types::Document;

/// Core trait for document-store backends.
///
/// The engine must support concurrent issuance of independent requests:
/// one query fans its sub-queries out in parallel over a single shared
/// store handle, and no pipeline run may observe another's state.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Unique identifier for this store backend
    fn store_id(&self) -> &str;

    /// Create a table if it does not exist; creating an existing table
    /// is not an error
    async fn ensure_table(&self, table: &str) -> Result<(), StoreError>;

    /// Create a secondary index on a field of a table; idempotent
    async fn ensure_index(&self, table: &str, field: &str) -> Result<(), StoreError>;

    /// Insert documents into a table, returning how many were written
    async fn insert(&self, table: &str, documents: Vec<Document>) -> Result<usize, StoreError>;

    /// Run a compiled aggregation pipeline over a table and return the
    /// finalized rows
    async fn run_pipeline(&self, table: &str, stages: &[Stage]) -> Result<Vec<Document>, StoreError>;

    /// Number of rows in a table
    async fn count(&self, table: &str) -> Result<u64, StoreError>;

    /// Drop a table
    async fn drop_table(&self, table: &str) -> Result<(), StoreError>;

    /// Remove every table in the database
    async fn purge(&self) -> Result<(), StoreError>;

    /// Release the connection; the default implementation does nothing
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Map a collection key to a safe physical table name.
///
/// Hyphens and dots map to underscores. The result must be non-empty,
/// at most 256 characters, start with an alphanumeric or underscore, and
/// contain only `[A-Za-z0-9_]`.
pub fn sanitize_table_name(name: &str) -> Result<String, StoreError> {
    let mapped: String = name
        .chars()
        .map(|c| if c == '-' || c == '.' { '_' } else { c })
        .collect();

    if mapped.is_empty() {
        return Err(StoreError::InvalidTable("empty collection name".into()));
    }
    if mapped.len() > 256 {
        return Err(StoreError::InvalidTable(format!(
            "collection name exceeds 256 characters: {name}"
        )));
    }
    let first = mapped.chars().next().unwrap_or('_');
    if !first.is_ascii_alphanumeric() && first != '_' {
        return Err(StoreError::InvalidTable(format!(
            "collection name must start with an alphanumeric character or underscore: {name}"
        )));
    }
    for c in mapped.chars() {
        if !c.is_ascii_alphanumeric() && c != '_' {
            return Err(StoreError::InvalidTable(format!(
                "collection name contains invalid character '{c}': {name}"
            )));
        }
    }
    Ok(mapped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_maps_hyphens_and_dots() {
        assert_eq!(sanitize_table_name("web-events").unwrap(), "web_events");
        assert_eq!(sanitize_table_name("app.events").unwrap(), "app_events");
        assert_eq!(sanitize_table_name("events_v2").unwrap(), "events_v2");
    }

    #[test]
    fn test_sanitize_rejects_bad_names() {
        assert!(sanitize_table_name("").is_err());
        assert!(sanitize_table_name("evil; drop").is_err());
        assert!(sanitize_table_name("!bang").is_err());
        assert!(sanitize_table_name(&"x".repeat(300)).is_err());
    }
}
