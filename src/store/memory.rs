//! In-memory document store
//!
//! The reference engine behind [`DocumentStore`]: tables are plain row
//! vectors, and the aggregation pipeline is interpreted stage by stage.
//! Intended for tests and embedded deployments; it loses all data on
//! restart.
//!
//! Grouped-stream semantics follow the stage contract in
//! [`crate::pipeline`]: `group` partitions rows by plucked key values,
//! `reduce` folds each partition field-wise, and `ungroup` re-emits one
//! `{group, reduction}` row per partition. A `group` immediately
//! followed by `ungroup` (the distinct-count collapse) leaves the raw
//! partition rows as the reduction payload.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::error::StoreError;
use crate::pipeline::{sort_documents, Combine, Stage};
use crate::store::traits::DocumentStore;
use crate::types::Document;

use std::collections::BTreeMap;

/// In-memory store engine.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Table>>,
}

#[derive(Debug, Default)]
struct Table {
    rows: Vec<Document>,
    indexes: HashSet<String>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous insert that also creates the table when absent.
    /// Convenience for tests and fixtures.
    pub fn insert_blocking(
        &self,
        table: &str,
        documents: Vec<Document>,
    ) -> Result<usize, StoreError> {
        let mut tables = self.tables.write();
        let entry = tables.entry(table.to_owned()).or_default();
        let written = documents.len();
        entry.rows.extend(documents);
        Ok(written)
    }

    fn snapshot(&self, table: &str) -> Result<Vec<Document>, StoreError> {
        let tables = self.tables.read();
        tables
            .get(table)
            .map(|t| t.rows.clone())
            .ok_or_else(|| StoreError::TableNotFound(table.to_owned()))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn store_id(&self) -> &str {
        "memory"
    }

    async fn ensure_table(&self, table: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        tables.entry(table.to_owned()).or_default();
        Ok(())
    }

    async fn ensure_index(&self, table: &str, field: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_owned()))?;
        entry.indexes.insert(field.to_owned());
        Ok(())
    }

    async fn insert(&self, table: &str, documents: Vec<Document>) -> Result<usize, StoreError> {
        let mut tables = self.tables.write();
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_owned()))?;
        let written = documents.len();
        entry.rows.extend(documents);
        Ok(written)
    }

    async fn run_pipeline(
        &self,
        table: &str,
        stages: &[Stage],
    ) -> Result<Vec<Document>, StoreError> {
        let rows = self.snapshot(table)?;
        let mut state = PipelineState::Rows(rows);
        for stage in stages {
            state = state.apply(stage)?;
        }
        state.into_rows()
    }

    async fn count(&self, table: &str) -> Result<u64, StoreError> {
        let tables = self.tables.read();
        tables
            .get(table)
            .map(|t| t.rows.len() as u64)
            .ok_or_else(|| StoreError::TableNotFound(table.to_owned()))
    }

    async fn drop_table(&self, table: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        tables
            .remove(table)
            .map(|_| ())
            .ok_or_else(|| StoreError::TableNotFound(table.to_owned()))
    }

    async fn purge(&self) -> Result<(), StoreError> {
        self.tables.write().clear();
        Ok(())
    }
}

// ============================================================================
// Pipeline interpreter
// ============================================================================

/// Rows flowing between stages: flat documents, or partitions awaiting
/// reduce/ungroup.
enum PipelineState {
    Rows(Vec<Document>),
    Groups(Vec<Partition>),
}

struct Partition {
    key: Vec<Value>,
    rows: Vec<Document>,
    reduced: Option<Document>,
}

impl PipelineState {
    fn apply(self, stage: &Stage) -> Result<PipelineState, StoreError> {
        match (self, stage) {
            (PipelineState::Rows(rows), Stage::Filter(matcher)) => Ok(PipelineState::Rows(
                rows.into_iter().filter(|doc| matcher.matches(doc)).collect(),
            )),
            (PipelineState::Rows(rows), Stage::Map(projections)) => Ok(PipelineState::Rows(
                rows.into_iter()
                    .map(|doc| {
                        projections
                            .iter()
                            .map(|(field, expr)| (field.clone(), expr.eval(&doc)))
                            .collect()
                    })
                    .collect(),
            )),
            (PipelineState::Rows(rows), Stage::Group(keys)) => {
                Ok(PipelineState::Groups(partition(rows, keys)))
            }
            (PipelineState::Groups(groups), Stage::Reduce(combiners)) => Ok(PipelineState::Groups(
                groups
                    .into_iter()
                    .map(|mut partition| {
                        partition.reduced = Some(reduce_rows(&partition.rows, combiners));
                        partition
                    })
                    .collect(),
            )),
            (PipelineState::Groups(groups), Stage::Ungroup) => Ok(PipelineState::Rows(
                groups
                    .into_iter()
                    .map(|partition| {
                        let mut doc = Document::new();
                        doc.insert("group".to_owned(), Value::Array(partition.key));
                        let reduction = match partition.reduced {
                            Some(reduced) => Value::Object(reduced),
                            None => Value::Array(
                                partition.rows.into_iter().map(Value::Object).collect(),
                            ),
                        };
                        doc.insert("reduction".to_owned(), reduction);
                        doc
                    })
                    .collect(),
            )),
            (PipelineState::Rows(mut rows), Stage::Sort(clauses)) => {
                sort_documents(&mut rows, clauses);
                Ok(PipelineState::Rows(rows))
            }
            (PipelineState::Rows(mut rows), Stage::Limit(n)) => {
                rows.truncate(*n);
                Ok(PipelineState::Rows(rows))
            }
            (state, stage) => Err(StoreError::Execution(format!(
                "stage {} cannot follow a {} state",
                stage_name(stage),
                match state {
                    PipelineState::Rows(_) => "row",
                    PipelineState::Groups(_) => "grouped",
                },
            ))),
        }
    }

    fn into_rows(self) -> Result<Vec<Document>, StoreError> {
        match self {
            PipelineState::Rows(rows) => Ok(rows),
            PipelineState::Groups(_) => Err(StoreError::Execution(
                "pipeline ended in a grouped state".into(),
            )),
        }
    }
}

fn stage_name(stage: &Stage) -> &'static str {
    match stage {
        Stage::Filter(_) => "filter",
        Stage::Map(_) => "map",
        Stage::Group(_) => "group",
        Stage::Reduce(_) => "reduce",
        Stage::Ungroup => "ungroup",
        Stage::Sort(_) => "sort",
        Stage::Limit(_) => "limit",
    }
}

/// Partition rows by the plucked values of `keys`, preserving
/// first-seen order. An empty key list forms a single partition.
fn partition(rows: Vec<Document>, keys: &[String]) -> Vec<Partition> {
    let mut order: Vec<Partition> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for doc in rows {
        let key: Vec<Value> = keys
            .iter()
            .map(|k| doc.get(k).cloned().unwrap_or(Value::Null))
            .collect();
        let lookup = serde_json::to_string(&key).unwrap_or_default();

        match index.get(&lookup) {
            Some(&i) => order[i].rows.push(doc),
            None => {
                index.insert(lookup, order.len());
                order.push(Partition {
                    key,
                    rows: vec![doc],
                    reduced: None,
                });
            }
        }
    }
    order
}

/// Fold a partition's rows field-wise. The fold is associative and
/// commutative per combinator, so reduction order is immaterial.
fn reduce_rows(rows: &[Document], combiners: &BTreeMap<String, Combine>) -> Document {
    let mut reduced: Document = combiners
        .iter()
        .map(|(field, _)| {
            let initial = rows
                .first()
                .and_then(|doc| doc.get(field))
                .cloned()
                .unwrap_or(Value::Null);
            (field.clone(), initial)
        })
        .collect();

    for doc in rows.iter().skip(1) {
        for (field, combine) in combiners {
            let left = reduced.get(field).cloned().unwrap_or(Value::Null);
            let right = doc.get(field).cloned().unwrap_or(Value::Null);
            reduced.insert(field.clone(), combine.apply(left, right));
        }
    }
    reduced
}

// ============================================================================
// Tests
// ============================================================================
