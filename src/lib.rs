//! docfold - Analytics over document stores
//!
//! This library compiles declarative analytical queries (dimensions,
//! metrics, filters, a timeframe, an interval, sort, and limit) into one
//! or more map/reduce aggregation pipelines, executes them concurrently
//! against a document-oriented backing store, and merges the partial
//! aggregates into a single result set keyed by dimension-tuple identity.
//!
//! # Architecture
//!
//! ```text
//! Query (JSON)
//!      │
//!      ▼
//! ┌─────────────┐
//! │  Normalize  │  Timeframe, filters, sort, interval bucketing
//! └─────────────┘
//!      │
//!      ▼
//! ┌─────────────┐
//! │    Plan     │  One deduplicated sub-query per (kind, table, filter)
//! └─────────────┘
//!      │
//!      ▼
//! ┌─────────────┐
//! │   Execute   │  Concurrent fan-out over the DocumentStore trait
//! └─────────────┘
//!      │
//!      ▼
//! ┌─────────────┐
//! │    Merge    │  Fold partials into rows keyed by dimension tuple
//! └─────────────┘
//! ```
//!
//! Each sub-query is a typed pipeline of stages (filter, map, group,
//! reduce, ungroup, sort, limit) - never synthesized query text - and the
//! backing store is reached through the [`store::DocumentStore`] trait.
//! An in-memory reference engine ([`store::MemoryStore`]) implements the
//! full stage vocabulary for tests and embedded use.
//!
//! # Example
//!
//! ```rust,ignore
//! use docfold::{Provider, Query, Dimension, Metric, Datatype};
//!
//! let provider = Provider::in_memory();
//! provider.insert("events", rows).await?;
//!
//! let query = Query::builder()
//!     .dimension(Dimension::new("country", Datatype::String))
//!     .metric(Metric::sum("clicks", "events"))
//!     .build();
//! let output = provider.query(&query).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod pipeline;
pub mod provider;
pub mod query;
pub mod store;
pub mod types;

// Re-export main types
pub use config::Config;
pub use error::{Error, Result, StoreError};
pub use provider::{CollectionStats, Provider};
pub use query::ast::{
    AggregationKind, Collection, CollectionRef, Datatype, Dimension, FilterClause, Metric, Query,
    Timeframe,
};
pub use query::plan::QueryPlan;
pub use query::result::QueryOutput;
pub use store::{DocumentStore, MemoryStore};
pub use types::Document;
