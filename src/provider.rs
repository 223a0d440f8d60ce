//! Provider facade
//!
//! The surface consumed by an analytics host: lifecycle, ingestion,
//! query, and administrative operations over one backing store. Each
//! query runs the full normalize / plan / execute / merge path; the
//! generic `find`/`update`/`delete` passthroughs are deliberately
//! unimplemented and return success.

use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::query::executor::{ExecutorConfig, SubQueryExecutor};
use crate::query::plan::build_plan;
use crate::query::result::QueryOutput;
use crate::query::Query;
use crate::store::{sanitize_table_name, DocumentStore, MemoryStore};
use crate::types::{Document, TIME_FIELD};

/// Row count of one collection, as reported by [`Provider::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CollectionStats {
    /// Number of rows in the collection
    pub count: u64,
}

/// Analytics provider over one document store.
pub struct Provider {
    store: Arc<dyn DocumentStore>,
    executor: SubQueryExecutor,
    config: Config,
}

impl Provider {
    /// Initialize a provider over a store.
    pub fn new(store: Arc<dyn DocumentStore>, config: Config) -> Self {
        info!(store = store.store_id(), "initializing provider");
        let executor_config = ExecutorConfig::new()
            .with_max_parallel(config.executor.max_parallel)
            .with_timeout(config.executor.timeout());
        let executor = SubQueryExecutor::new(Arc::clone(&store), executor_config);
        Self {
            store,
            executor,
            config,
        }
    }

    /// Initialize a provider over a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), Config::default())
    }

    /// The active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Release the store connection.
    pub async fn destroy(&self) -> Result<()> {
        info!(store = self.store.store_id(), "destroying provider");
        self.store.close().await?;
        Ok(())
    }

    /// Insert documents into a collection.
    ///
    /// Table creation is idempotent, and a secondary index on the time
    /// field is maintained before rows are written.
    pub async fn insert(&self, collection: &str, documents: Vec<Document>) -> Result<usize> {
        let table = sanitize_table_name(collection)?;
        self.store.ensure_table(&table).await?;
        self.store.ensure_index(&table, TIME_FIELD).await?;
        let written = self.store.insert(&table, documents).await?;
        Ok(written)
    }

    /// Execute an analytical query and return the merged output.
    ///
    /// A validation failure (unknown dimension datatype, malformed
    /// timeframe) surfaces before any sub-query is issued; a store
    /// failure aborts the whole query with no partial documents.
    pub async fn query(&self, query: &Query) -> Result<QueryOutput> {
        let plan = build_plan(query)?;
        let partials = self.executor.execute(&plan).await?;
        Ok(QueryOutput::assemble(plan, partials))
    }

    /// Row count for a collection.
    pub async fn stats(&self, collection: &str) -> Result<CollectionStats> {
        let table = sanitize_table_name(collection)?;
        let count = self.store.count(&table).await?;
        Ok(CollectionStats { count })
    }

    /// Drop a collection.
    pub async fn drop_collection(&self, collection: &str) -> Result<()> {
        let table = sanitize_table_name(collection)?;
        self.store.drop_table(&table).await?;
        Ok(())
    }

    /// Remove every collection in the database.
    pub async fn purge(&self) -> Result<()> {
        self.store.purge().await?;
        Ok(())
    }

    /// Generic find passthrough; unimplemented, returns success.
    pub async fn find(&self, _collection: &str) -> Result<()> {
        Ok(())
    }

    /// Generic update passthrough; unimplemented, returns success.
    pub async fn update(&self, _collection: &str) -> Result<()> {
        Ok(())
    }

    /// Generic delete passthrough; unimplemented, returns success.
    pub async fn delete(&self, _collection: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_insert_creates_table_and_counts() {
        let provider = Provider::in_memory();
        let written = provider
            .insert(
                "web-events",
                vec![
                    doc(json!({(TIME_FIELD): "2023-05-01T10:00:00Z", "clicks": 1})),
                    doc(json!({(TIME_FIELD): "2023-05-01T11:00:00Z", "clicks": 2})),
                ],
            )
            .await
            .unwrap();
        assert_eq!(written, 2);

        let stats = provider.stats("web-events").await.unwrap();
        assert_eq!(stats.count, 2);
    }

    #[tokio::test]
    async fn test_insert_is_idempotent_on_table_creation() {
        let provider = Provider::in_memory();
        provider.insert("events", vec![doc(json!({"v": 1}))]).await.unwrap();
        provider.insert("events", vec![doc(json!({"v": 2}))]).await.unwrap();
        assert_eq!(provider.stats("events").await.unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_drop_and_purge() {
        let provider = Provider::in_memory();
        provider.insert("a", vec![doc(json!({"v": 1}))]).await.unwrap();
        provider.insert("b", vec![doc(json!({"v": 1}))]).await.unwrap();

        provider.drop_collection("a").await.unwrap();
        assert!(provider.stats("a").await.is_err());

        provider.purge().await.unwrap();
        assert!(provider.stats("b").await.is_err());
    }

    #[tokio::test]
    async fn test_passthroughs_return_success() {
        let provider = Provider::in_memory();
        provider.find("events").await.unwrap();
        provider.update("events").await.unwrap();
        provider.delete("events").await.unwrap();
        provider.destroy().await.unwrap();
    }
}
