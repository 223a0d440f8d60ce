//! Query normalization
//!
//! Canonicalizes the timeframe, filter, sort, and interval fields of an
//! incoming query into an explicit [`NormalizedQuery`]. The query itself
//! is never mutated; bucketing travels as its own field instead of being
//! rewritten into the query's interval.

use crate::pipeline::{Direction, FilterOp, Interval, Matcher, SortClause};
use crate::query::ast::{Query, Timeframe};
use crate::query::error::QueryResult;
use crate::types::TIME_FIELD;
use serde_json::Value;

/// Canonical form of a query's scoping fields, consumed by the plan
/// builder.
#[derive(Debug, Clone)]
pub struct NormalizedQuery {
    /// Compiled match document (timeframe window plus filter clauses)
    pub matcher: Matcher,

    /// Bucketing granularity for the date dimension, when one applies
    pub bucketing: Option<Interval>,

    /// Result ordering; defaults to descending time
    pub sort: Vec<SortClause>,

    /// Row limit from a trailing-items timeframe
    pub limit: Option<usize>,
}

/// Normalize a query's timeframe, filters, sort, and interval.
///
/// A `{start, end}` timeframe becomes an exclusive `$gt/$lt` pair on the
/// time field; `{last_n_items}` becomes a limit with a default
/// descending-time sort unless the query supplies its own. Filter
/// clauses overwrite per field (later clauses on the same field replace
/// earlier ones). Unrecognized interval spellings produce no bucketing.
pub fn normalize(query: &Query) -> QueryResult<NormalizedQuery> {
    let mut matcher = Matcher::new();
    let mut limit = None;

    match &query.timeframe {
        Some(Timeframe::Range { start, end }) => {
            matcher.set_range(
                TIME_FIELD,
                Value::String(start.to_rfc3339()?),
                Value::String(end.to_rfc3339()?),
            );
        }
        Some(Timeframe::LastN { last_n_items }) => {
            limit = Some(*last_n_items);
        }
        None => {}
    }

    if let Some(clauses) = &query.filter {
        for clause in clauses {
            matcher.set_clause(clause.field(), clause.op(), clause.value().clone());
        }
    }

    let sort = query
        .sort
        .clone()
        .unwrap_or_else(|| vec![SortClause(TIME_FIELD.to_owned(), Direction::Desc)]);

    let bucketing = query
        .interval
        .filter(|interval| *interval != Interval::Unknown);

    Ok(NormalizedQuery {
        matcher,
        bucketing,
        sort,
        limit,
    })
}

/// Overlay metric-level filter clauses on a matcher copy. Clauses
/// replace the query-level clause for the same field; they are not
/// merged (metric overrides).
pub fn apply_metric_filter(
    matcher: &Matcher,
    clauses: Option<&Vec<crate::query::ast::FilterClause>>,
) -> Matcher {
    let mut scoped = matcher.clone();
    if let Some(clauses) = clauses {
        for clause in clauses {
            scoped.set_clause(clause.field(), clause.op(), clause.value().clone());
        }
    }
    scoped
}
