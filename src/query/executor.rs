//! Sub-query execution
//!
//! Fans a plan's sub-queries out concurrently against the backing store.
//! A missing collection degrades to an empty partial result for that
//! sub-query only; any other store error, or a timeout, fails the whole
//! query with no partial results and cancels the in-flight siblings.

use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::query::error::{QueryError, QueryResult};
use crate::query::plan::QueryPlan;
use crate::store::DocumentStore;
use crate::types::Document;

// ============================================================================
// Executor configuration
// ============================================================================

/// Configuration for sub-query execution.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum sub-queries in flight at once (default: num_cpus, capped
    /// at 8)
    pub max_parallel: usize,

    /// Per-sub-query time budget (default: 30 seconds)
    pub timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel: num_cpus::get().min(8),
            timeout: Duration::from_secs(30),
        }
    }
}

impl ExecutorConfig {
    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the in-flight sub-query cap.
    pub fn with_max_parallel(mut self, n: usize) -> Self {
        self.max_parallel = n.max(1);
        self
    }

    /// Set the per-sub-query time budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

// ============================================================================
// Executor
// ============================================================================

/// The rows one sub-query contributed.
#[derive(Debug, Clone)]
pub struct PartialResult {
    /// Dedup key of the sub-query that produced these rows
    pub sub_query: String,

    /// Finalized rows, one document each
    pub rows: Vec<Document>,
}

/// Executes a plan's sub-queries concurrently over a shared store.
pub struct SubQueryExecutor {
    store: Arc<dyn DocumentStore>,
    config: ExecutorConfig,
}

impl SubQueryExecutor {
    /// Create an executor over a store.
    pub fn new(store: Arc<dyn DocumentStore>, config: ExecutorConfig) -> Self {
        Self { store, config }
    }

    /// Run every sub-query in the plan and collect the partial results
    /// in plan order.
    ///
    /// The plan is immutable here; each sub-query compiles its own stage
    /// sequence and nothing shares pipeline state. The first failure
    /// aborts the batch - later futures are dropped, which cancels them.
    pub async fn execute(&self, plan: &QueryPlan) -> QueryResult<Vec<PartialResult>> {
        let budget = self.config.timeout;
        let tasks = plan.sub_queries.iter().map(|(key, sub_query)| {
            let store = Arc::clone(&self.store);
            let key = key.clone();
            let table = sub_query.table.clone();
            let stages = sub_query.compile_stages();
            async move {
                debug!(sub_query = %key, table = %table, stages = stages.len(), "executing sub-query");
                let outcome = timeout(budget, store.run_pipeline(&table, &stages))
                    .await
                    .map_err(|_| {
                        QueryError::timeout(format!(
                            "sub-query against [{table}] exceeded {budget:?}"
                        ))
                    })?;
                match outcome {
                    Ok(rows) => Ok(PartialResult {
                        sub_query: key,
                        rows,
                    }),
                    // An absent collection contributes zero rows; it is
                    // not a query failure
                    Err(e) if e.is_not_found() => {
                        warn!(table = %table, "collection not found, contributing empty result");
                        Ok(PartialResult {
                            sub_query: key,
                            rows: Vec::new(),
                        })
                    }
                    Err(e) => Err(QueryError::execution(format!(
                        "sub-query against [{table}] failed"
                    ))
                    .with_source(e)),
                }
            }
        });

        stream::iter(tasks)
            .buffered(self.config.max_parallel)
            .try_collect()
            .await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::{Metric, Query};
    use crate::query::plan::build_plan;
    use crate::store::MemoryStore;
    use crate::types::TIME_FIELD;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_missing_collection_degrades_to_empty_partial() {
        let store = Arc::new(MemoryStore::new());
        let executor = SubQueryExecutor::new(store, ExecutorConfig::default());

        let query = Query::builder()
            .metric(Metric::sum("clicks", "never_created"))
            .build();
        let plan = build_plan(&query).unwrap();

        let partials = executor.execute(&plan).await.unwrap();
        assert_eq!(partials.len(), 1);
        assert!(partials[0].rows.is_empty());
    }

    #[tokio::test]
    async fn test_partials_follow_plan_order() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_blocking(
                "events",
                vec![doc(json!({(TIME_FIELD): "2023-05-01T10:00:00Z", "clicks": 2}))],
            )
            .unwrap();

        let executor = SubQueryExecutor::new(store, ExecutorConfig::default());
        let query = Query::builder()
            .metric(Metric::sum("clicks", "events"))
            .metric(Metric::ucount("uniques", "events").depends_on("clicks"))
            .build();
        let plan = build_plan(&query).unwrap();
        let keys: Vec<String> = plan.sub_queries.keys().cloned().collect();

        let partials = executor.execute(&plan).await.unwrap();
        let got: Vec<String> = partials.iter().map(|p| p.sub_query.clone()).collect();
        assert_eq!(got, keys);
    }

    #[tokio::test]
    async fn test_executor_config_builder() {
        let config = ExecutorConfig::new()
            .with_max_parallel(0)
            .with_timeout(Duration::from_secs(5));
        assert_eq!(config.max_parallel, 1);
        assert_eq!(config.timeout, Duration::from_secs(5));
    }
}
