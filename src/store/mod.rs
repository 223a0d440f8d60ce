//! Document-store boundary
//!
//! The backing store is an external collaborator reached through the
//! [`DocumentStore`] trait: idempotent table creation, secondary
//! indexing on the time field, row insertion, and a composable
//! aggregation pipeline (filter, map, group, reduce, ungroup, sort,
//! limit). [`MemoryStore`] is the in-process reference engine.

pub mod memory;
pub mod traits;

pub use memory::MemoryStore;
pub use traits::{sanitize_table_name, DocumentStore};
