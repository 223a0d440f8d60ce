//! Query compilation and execution
//!
//! This module turns a declarative analytical query into executed rows:
//!
//! - [`ast`] - the query input contract (dimensions, metrics, timeframe,
//!   filters, sort, interval)
//! - [`normalize`] - canonicalization of the query's scoping fields
//! - [`aggregation`] - per-kind map/reduce/finalize fragment compilation
//! - [`plan`] - deduplicated physical sub-query construction
//! - [`executor`] - concurrent sub-query fan-out over the store
//! - [`result`] - partial-result merging into the unified output
//!
//! # Flow
//!
//! ```text
//! Query ──normalize──▶ NormalizedQuery ──build_plan──▶ QueryPlan
//!                                                         │
//!                                     SubQueryExecutor::execute
//!                                                         │
//!                         Vec<PartialResult> ──assemble──▶ QueryOutput
//! ```

pub mod aggregation;
pub mod ast;
pub mod error;
pub mod executor;
pub mod normalize;
pub mod plan;
pub mod result;

// Re-export main types
pub use ast::{AggregationKind, Datatype, Dimension, Metric, Query, Timeframe};
pub use error::{QueryError, QueryErrorKind};
pub use executor::{ExecutorConfig, PartialResult, SubQueryExecutor};
pub use normalize::{normalize, NormalizedQuery};
pub use plan::{build_plan, GroupFieldState, PipelineKind, QueryPlan, SubQuery};
pub use result::QueryOutput;
