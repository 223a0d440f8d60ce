//! Typed aggregation-pipeline vocabulary
//!
//! A sub-query compiles to a sequence of [`Stage`] values over a named
//! collection: filter, map, group, reduce, ungroup, sort, limit. Stages
//! carry typed expressions ([`Expr`]) and reduce combinators
//! ([`Combine`]) instead of synthesized query text, so there is nothing
//! to escape and nothing to eval - any engine implementing
//! [`crate::store::DocumentStore`] interprets the same structures.
//!
//! Row shape conventions follow grouped-stream semantics: `group(keys)`
//! partitions rows, `reduce` folds each partition field-wise, and
//! `ungroup` re-emits one row per partition shaped as
//! `{group: [key values...], reduction: {...}}`. Finalize passes are
//! ordinary map stages reading `Expr::Reduction` / `Expr::GroupIndex`.

use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::types::{compare_values, lookup_path, parse_time_value, Document};

// ============================================================================
// Filters
// ============================================================================

/// Comparison operators accepted in filter clauses.
///
/// Serialized with the `$`-prefixed spelling used in compiled match
/// documents; the bare spelling is accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FilterOp {
    /// Equal
    #[serde(rename = "$eq", alias = "eq")]
    Eq,
    /// Not equal
    #[serde(rename = "$ne", alias = "ne")]
    Ne,
    /// Greater than
    #[serde(rename = "$gt", alias = "gt")]
    Gt,
    /// Greater than or equal
    #[serde(rename = "$gte", alias = "gte")]
    Gte,
    /// Less than
    #[serde(rename = "$lt", alias = "lt")]
    Lt,
    /// Less than or equal
    #[serde(rename = "$lte", alias = "lte")]
    Lte,
    /// Member of a value set
    #[serde(rename = "$in", alias = "in")]
    In,
}

/// Compiled match document: field -> {op -> operand}.
///
/// Setting a field replaces any previous clause for that field (per-field
/// last write wins). Query-level and metric-level filters on the same
/// field are therefore not merged - the metric's clause overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Matcher(pub BTreeMap<String, BTreeMap<FilterOp, Value>>);

impl Matcher {
    /// Create an empty matcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the matcher has no clauses.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Replace the clause for `field` with a single `{op: value}` pair.
    pub fn set_clause(&mut self, field: impl Into<String>, op: FilterOp, value: Value) {
        let mut clause = BTreeMap::new();
        clause.insert(op, value);
        self.0.insert(field.into(), clause);
    }

    /// Replace the clause for `field` with an exclusive range
    /// `{$gt: start, $lt: end}`.
    pub fn set_range(&mut self, field: impl Into<String>, start: Value, end: Value) {
        let mut clause = BTreeMap::new();
        clause.insert(FilterOp::Gt, start);
        clause.insert(FilterOp::Lt, end);
        self.0.insert(field.into(), clause);
    }

    /// Evaluate the matcher against a document. Every clause must hold.
    pub fn matches(&self, doc: &Document) -> bool {
        self.0.iter().all(|(field, ops)| {
            let actual = lookup_path(doc, field).cloned().unwrap_or(Value::Null);
            ops.iter().all(|(op, expected)| {
                let ord = compare_values(&actual, expected);
                match op {
                    FilterOp::Eq => ord == Some(std::cmp::Ordering::Equal),
                    FilterOp::Ne => ord != Some(std::cmp::Ordering::Equal),
                    FilterOp::Gt => ord == Some(std::cmp::Ordering::Greater),
                    FilterOp::Gte => matches!(
                        ord,
                        Some(std::cmp::Ordering::Greater) | Some(std::cmp::Ordering::Equal)
                    ),
                    FilterOp::Lt => ord == Some(std::cmp::Ordering::Less),
                    FilterOp::Lte => matches!(
                        ord,
                        Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal)
                    ),
                    FilterOp::In => expected.as_array().is_some_and(|set| {
                        set.iter().any(|candidate| {
                            compare_values(&actual, candidate)
                                == Some(std::cmp::Ordering::Equal)
                        })
                    }),
                }
            })
        })
    }

    /// Stable serialization of the matcher, used as hash input for plan
    /// dedup keys. Field and operator order is deterministic (BTreeMap).
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ============================================================================
// Intervals
// ============================================================================

/// Time-bucketing granularity for the date dimension.
///
/// Accepts both the plain spelling and the `timebucket.*` aliases found
/// in older query payloads. Unrecognized spellings parse to `Unknown`,
/// which simply produces no bucketing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    /// Truncate to whole seconds
    #[serde(alias = "timebucket.second")]
    Second,
    /// Truncate to whole minutes
    #[serde(alias = "timebucket.minute")]
    Minute,
    /// Truncate to whole hours
    #[serde(alias = "timebucket.hour")]
    Hour,
    /// Truncate to midnight UTC
    #[serde(alias = "timebucket.day", alias = "timebucket.ddate")]
    Day,
    /// Truncate to the first of the month
    #[serde(alias = "timebucket.month")]
    Month,
    /// Truncate to January 1st
    #[serde(alias = "timebucket.year")]
    Year,
    /// Unrecognized interval spelling; passes through with no bucketing
    #[serde(other)]
    Unknown,
}

impl Interval {
    /// Truncate an instant to this interval's boundary.
    pub fn truncate(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        use chrono::Datelike;

        let truncated = t.with_nanosecond(0).and_then(|t| match self {
            Interval::Second | Interval::Unknown => Some(t),
            Interval::Minute => t.with_second(0),
            Interval::Hour => t.with_second(0).and_then(|t| t.with_minute(0)),
            Interval::Day => t
                .with_second(0)
                .and_then(|t| t.with_minute(0))
                .and_then(|t| t.with_hour(0)),
            Interval::Month => t
                .with_second(0)
                .and_then(|t| t.with_minute(0))
                .and_then(|t| t.with_hour(0))
                .and_then(|t| t.with_day(1)),
            Interval::Year => t
                .with_second(0)
                .and_then(|t| t.with_minute(0))
                .and_then(|t| t.with_hour(0))
                .and_then(|t| t.with_day(1))
                .and_then(|t| t.with_month(1)),
        });
        truncated.unwrap_or(t)
    }
}

// ============================================================================
// Sorting
// ============================================================================

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Ascending order
    Asc,
    /// Descending order
    Desc,
}

/// One `(field, direction)` sort clause, serialized as a two-element
/// array to match the query wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortClause(pub String, pub Direction);

impl SortClause {
    /// Field this clause sorts on.
    pub fn field(&self) -> &str {
        &self.0
    }

    /// Direction of this clause.
    pub fn direction(&self) -> Direction {
        self.1
    }
}

/// Sort documents in place by a list of clauses. Incomparable pairs keep
/// their relative order (the sort is stable).
pub fn sort_documents(docs: &mut [Document], clauses: &[SortClause]) {
    docs.sort_by(|a, b| {
        for clause in clauses {
            let left = a.get(clause.field()).cloned().unwrap_or(Value::Null);
            let right = b.get(clause.field()).cloned().unwrap_or(Value::Null);
            let ord = compare_values(&left, &right)
                .unwrap_or_else(|| rank_null(&left).cmp(&rank_null(&right)));
            let ord = match clause.direction() {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            };
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    });
}

fn rank_null(v: &Value) -> u8 {
    u8::from(!v.is_null())
}

// ============================================================================
// Expressions
// ============================================================================

/// A value-producing expression evaluated against one pipeline row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Expr {
    /// Read a top-level field
    Field(String),
    /// Read a nested field by path segments (flattened dotted attribute)
    Path(Vec<String>),
    /// A literal value
    Const(Value),
    /// Literal null (synthetic contribution for absent grouping fields)
    Null,
    /// Read a field of the reduced accumulator on an ungrouped row
    Reduction(String),
    /// Read the i-th grouping-key value on an ungrouped row
    GroupIndex(usize),
    /// Divide two sub-expressions; a zero or non-numeric denominator
    /// yields null rather than an error or NaN
    Div(Box<Expr>, Box<Expr>),
    /// Truncate a timestamp expression to an interval boundary,
    /// preserving the UTC `Z` offset in the rendered value
    TimeBucket(Interval, Box<Expr>),
}

impl Expr {
    /// Build a field-read expression, flattening dotted attribute paths
    /// to nested access.
    pub fn attribute(name: &str) -> Expr {
        if name.contains('.') {
            Expr::Path(name.split('.').map(str::to_owned).collect())
        } else {
            Expr::Field(name.to_owned())
        }
    }

    /// Evaluate against a row.
    pub fn eval(&self, doc: &Document) -> Value {
        match self {
            Expr::Field(name) => doc.get(name).cloned().unwrap_or(Value::Null),
            Expr::Path(parts) => {
                let mut current = match doc.get(parts.first().map(String::as_str).unwrap_or("")) {
                    Some(v) => v,
                    None => return Value::Null,
                };
                for part in &parts[1..] {
                    match current.as_object().and_then(|o| o.get(part)) {
                        Some(v) => current = v,
                        None => return Value::Null,
                    }
                }
                current.clone()
            }
            Expr::Const(value) => value.clone(),
            Expr::Null => Value::Null,
            Expr::Reduction(name) => doc
                .get("reduction")
                .and_then(Value::as_object)
                .and_then(|r| r.get(name))
                .cloned()
                .unwrap_or(Value::Null),
            Expr::GroupIndex(index) => doc
                .get("group")
                .and_then(Value::as_array)
                .and_then(|g| g.get(*index))
                .cloned()
                .unwrap_or(Value::Null),
            Expr::Div(numerator, denominator) => {
                let n = numerator.eval(doc);
                let d = denominator.eval(doc);
                match (n.as_f64(), d.as_f64()) {
                    (Some(n), Some(d)) if d != 0.0 => {
                        serde_json::Number::from_f64(n / d).map_or(Value::Null, Value::Number)
                    }
                    _ => Value::Null,
                }
            }
            Expr::TimeBucket(interval, inner) => {
                let value = inner.eval(doc);
                match parse_time_value(&value) {
                    Some(t) => Value::String(
                        interval
                            .truncate(t)
                            .to_rfc3339_opts(SecondsFormat::Secs, true),
                    ),
                    None => value,
                }
            }
        }
    }
}

// ============================================================================
// Reduce combinators
// ============================================================================

/// Field-wise combinator applied when folding two rows of a group.
///
/// All combinators are associative and commutative over the values they
/// see, so partial reductions combine in any order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Combine {
    /// Numeric addition; a null operand yields the other operand
    Add,
    /// Keep the lesser operand; ties keep either
    Min,
    /// Keep the greater operand; ties keep either
    Max,
    /// Keep the left operand (grouping fields, identical within a group)
    Left,
    /// Literal null (synthetic contribution for absent grouping fields)
    Null,
}

impl Combine {
    /// Fold two field values.
    pub fn apply(&self, left: Value, right: Value) -> Value {
        match self {
            Combine::Add => match (left.as_f64(), right.as_f64()) {
                (Some(l), Some(r)) => {
                    // Keep integer sums integral when both operands are
                    if let (Some(li), Some(ri)) = (left.as_i64(), right.as_i64()) {
                        Value::from(li + ri)
                    } else {
                        serde_json::Number::from_f64(l + r).map_or(Value::Null, Value::Number)
                    }
                }
                (Some(_), None) => left,
                (None, Some(_)) => right,
                (None, None) => Value::Null,
            },
            Combine::Min => pick(left, right, std::cmp::Ordering::Less),
            Combine::Max => pick(left, right, std::cmp::Ordering::Greater),
            Combine::Left => left,
            Combine::Null => Value::Null,
        }
    }
}

fn pick(left: Value, right: Value, keep_left_when: std::cmp::Ordering) -> Value {
    if left.is_null() {
        return right;
    }
    if right.is_null() {
        return left;
    }
    match compare_values(&left, &right) {
        Some(ord) if ord == keep_left_when.reverse() => right,
        // Equal, keep-left ordering, or incomparable all keep left
        _ => left,
    }
}

// ============================================================================
// Stages
// ============================================================================

/// One stage of a compiled aggregation pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Stage {
    /// Drop rows not matching the predicate document
    Filter(Matcher),
    /// Project each row through named expressions
    Map(BTreeMap<String, Expr>),
    /// Partition rows by the values of the listed fields; an empty key
    /// list forms a single all-rows partition
    Group(Vec<String>),
    /// Fold each partition field-wise with the given combinators
    Reduce(BTreeMap<String, Combine>),
    /// Re-emit one `{group, reduction}` row per partition
    Ungroup,
    /// Order rows by the given clauses
    Sort(Vec<SortClause>),
    /// Keep at most `n` rows
    Limit(usize),
}

// ============================================================================
// Tests
// ============================================================================
