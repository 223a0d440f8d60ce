//! Query planning
//!
//! Builds the physical plan for a query: one deduplicated sub-query per
//! `(pipeline kind, collection, match document)`, each carrying the
//! unioned map/reduce/finalize fragments of every metric that shares it.
//! N metrics over the same collection and filter cost one collection
//! scan, not N.

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

use crate::pipeline::{Combine, Expr, Matcher, SortClause, Stage};
use crate::query::aggregation::{self, merge_preferring_existing};
use crate::query::ast::{
    CollectionRef, Datatype, Dimension, Metric, Query, PLACEHOLDER_METRIC,
};
use crate::query::error::{QueryError, QueryResult};
use crate::query::normalize;
use crate::store::sanitize_table_name;
use crate::types::{content_hash, TIME_FIELD};
use tracing::debug;

// ============================================================================
// Plan types
// ============================================================================

/// Which pipeline shape a sub-query compiles to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineKind {
    /// Single map/group/reduce/finalize pass
    Plain,
    /// Two-phase pipeline collapsing duplicates before counting
    #[serde(rename = "ucount")]
    DistinctCount,
}

/// Per-collection classification of a requested grouping field.
///
/// Serialized as the `0 / 1 / 2` marker used in plan dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupFieldState {
    /// Requested field absent from this collection's schema; contributes
    /// a constant null so the row shape stays uniform
    Absent,
    /// Real field on this collection, mapped and reduced directly
    Present,
    /// Field participates in distinct-count bookkeeping
    Distinct,
}

impl GroupFieldState {
    /// Whether this field is a distinct-count attribute.
    pub fn is_distinct(&self) -> bool {
        matches!(self, GroupFieldState::Distinct)
    }
}

impl Serialize for GroupFieldState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let marker: u8 = match self {
            GroupFieldState::Absent => 0,
            GroupFieldState::Present => 1,
            GroupFieldState::Distinct => 2,
        };
        serializer.serialize_u8(marker)
    }
}

/// One physical aggregation pipeline against one collection.
#[derive(Debug, Clone, Serialize)]
pub struct SubQuery {
    /// Sanitized physical table name
    pub table: String,

    /// Pipeline shape
    pub kind: PipelineKind,

    /// Compiled match document
    #[serde(rename = "match")]
    pub matcher: Matcher,

    /// Map-stage projections: field -> expression
    pub map: BTreeMap<String, Expr>,

    /// Grouping fields and their per-collection classification
    pub group: BTreeMap<String, GroupFieldState>,

    /// Reduce-stage combinators
    pub reduce: BTreeMap<String, Combine>,

    /// Finalize projections: output field -> expression
    pub finalize: BTreeMap<String, Expr>,

    /// Result ordering
    pub sort: Vec<SortClause>,

    /// Row limit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl SubQuery {
    /// Compile this sub-query into its pipeline stage sequence.
    ///
    /// The plain shape is filter, map, group, reduce, ungroup, finalize.
    /// The distinct-count shape groups on the full tuple (grouping
    /// fields plus distinct attributes) to collapse duplicates, re-maps
    /// each collapsed group to per-group ones, then groups on the real
    /// fields only and sums.
    pub fn compile_stages(&self) -> Vec<Stage> {
        let mut stages = Vec::new();
        stages.push(Stage::Filter(self.matcher.clone()));
        stages.push(Stage::Map(self.map.clone()));

        let all_keys: Vec<String> = self.group.keys().cloned().collect();
        match self.kind {
            PipelineKind::Plain => {
                stages.push(Stage::Group(all_keys));
                stages.push(Stage::Reduce(self.reduce.clone()));
                stages.push(Stage::Ungroup);
                stages.push(Stage::Map(self.finalize.clone()));
            }
            PipelineKind::DistinctCount => {
                stages.push(Stage::Group(all_keys.clone()));
                stages.push(Stage::Ungroup);

                // Phase 2: real grouping fields come back out of the
                // phase-1 key tuple; each distinct attribute becomes a
                // per-group one to be summed.
                let mut remap = BTreeMap::new();
                let mut real_keys = Vec::new();
                for (index, key) in all_keys.iter().enumerate() {
                    if self.group[key].is_distinct() {
                        remap.insert(format!("count_{key}"), Expr::Const(1.into()));
                    } else {
                        remap.insert(key.clone(), Expr::GroupIndex(index));
                        real_keys.push(key.clone());
                    }
                }
                stages.push(Stage::Map(remap));
                stages.push(Stage::Group(real_keys));
                stages.push(Stage::Reduce(self.reduce.clone()));
                stages.push(Stage::Ungroup);
                stages.push(Stage::Map(self.finalize.clone()));
            }
        }

        stages.push(Stage::Sort(self.sort.clone()));
        if let Some(limit) = self.limit {
            stages.push(Stage::Limit(limit));
        }
        stages
    }
}

/// The physical plan for one query invocation. Immutable once built;
/// serialized into the query output as `queryplan`.
#[derive(Debug, Clone, Serialize)]
pub struct QueryPlan {
    /// Plan identity, a content hash of the query
    pub id: String,

    /// Deduplicated sub-queries keyed by content hash
    #[serde(rename = "colQueries")]
    pub sub_queries: BTreeMap<String, SubQuery>,

    /// Dimensions the plan groups by
    pub dimensions: Vec<Dimension>,

    /// Metrics the plan computes (including the synthetic placeholder
    /// when the query declared none)
    pub metrics: Vec<Metric>,
}

impl QueryPlan {
    /// Number of physical sub-queries.
    pub fn len(&self) -> usize {
        self.sub_queries.len()
    }

    /// Whether the plan has no sub-queries.
    pub fn is_empty(&self) -> bool {
        self.sub_queries.is_empty()
    }
}

// ============================================================================
// Plan builder
// ============================================================================

/// Requested grouping field derived from a query dimension.
struct GroupingField {
    key: String,
    is_time: bool,
}

/// Build the physical plan for a query.
///
/// Fails with a validation error - before any sub-query exists - when a
/// dimension carries an unsupported datatype. Formula metrics and
/// metrics without a resolvable collection are skipped.
pub fn build_plan(query: &Query) -> QueryResult<QueryPlan> {
    let normalized = normalize::normalize(query)?;
    let grouping = grouping_fields(&query.dimensions)?;
    let metrics = effective_metrics(query);

    let mut sub_queries: BTreeMap<String, SubQuery> = BTreeMap::new();

    for metric in &metrics {
        if metric.formula.is_some() {
            continue;
        }
        let Some(collection) = &metric.collection else {
            continue;
        };

        let matcher = normalize::apply_metric_filter(&normalized.matcher, metric.filter.as_ref());
        let table = sanitize_table_name(collection.store_key())
            .map_err(|e| QueryError::validation(e.to_string()))?;

        let kind = match metric.kind() {
            crate::query::ast::AggregationKind::DistinctCount => PipelineKind::DistinctCount,
            _ => PipelineKind::Plain,
        };
        let dedup_key = content_hash(
            format!(
                "{}_{}_{}",
                kind_tag(kind),
                collection.key(),
                matcher.canonical_json()
            )
            .as_bytes(),
        );

        let fragments = aggregation::compile(metric, !grouping.is_empty());

        let entry = sub_queries.entry(dedup_key).or_insert_with(|| SubQuery {
            table,
            kind,
            matcher,
            map: BTreeMap::new(),
            group: BTreeMap::new(),
            reduce: BTreeMap::new(),
            finalize: BTreeMap::new(),
            sort: normalized.sort.clone(),
            limit: normalized.limit,
        });

        // Re-validate every requested grouping field against this
        // collection's declared dimension set; absent fields still
        // appear in every stage as literal nulls.
        for field in &grouping {
            let state = classify(field, collection);
            entry.group.entry(field.key.clone()).or_insert(state);

            let (map_expr, reduce_op) = match state {
                GroupFieldState::Present if field.is_time => (
                    match normalized.bucketing {
                        Some(interval) => Expr::TimeBucket(
                            interval,
                            Box::new(Expr::Field(TIME_FIELD.to_owned())),
                        ),
                        None => Expr::Field(TIME_FIELD.to_owned()),
                    },
                    Combine::Left,
                ),
                GroupFieldState::Present => (Expr::Field(field.key.clone()), Combine::Left),
                _ => (Expr::Null, Combine::Null),
            };
            entry.map.entry(field.key.clone()).or_insert(map_expr);
            entry.reduce.entry(field.key.clone()).or_insert(reduce_op);
            entry
                .finalize
                .entry(field.key.clone())
                .or_insert_with(|| Expr::Reduction(field.key.clone()));
        }

        // Union this metric's fragments in; existing entries win
        if let Some(attribute) = &fragments.distinct_attribute {
            entry
                .group
                .entry(attribute.clone())
                .or_insert(GroupFieldState::Distinct);
        }
        merge_preferring_existing(&mut entry.map, fragments.map);
        merge_preferring_existing(&mut entry.reduce, fragments.reduce);
        merge_preferring_existing(&mut entry.finalize, fragments.finalize);
    }

    let plan = QueryPlan {
        id: content_hash(&serde_json::to_vec(query).unwrap_or_default()),
        sub_queries,
        dimensions: query.dimensions.clone(),
        metrics,
    };
    debug!(
        plan_id = %plan.id,
        sub_queries = plan.len(),
        "built query plan"
    );
    Ok(plan)
}

fn kind_tag(kind: PipelineKind) -> &'static str {
    match kind {
        PipelineKind::Plain => "plain",
        PipelineKind::DistinctCount => "ucount",
    }
}

/// Derive the requested grouping fields, validating dimension datatypes.
fn grouping_fields(dimensions: &[Dimension]) -> QueryResult<Vec<GroupingField>> {
    let mut fields = Vec::new();
    for dimension in dimensions {
        match dimension.datatype {
            Datatype::Date => fields.push(GroupingField {
                key: TIME_FIELD.to_owned(),
                is_time: true,
            }),
            Datatype::Ip | Datatype::Number | Datatype::String => fields.push(GroupingField {
                key: dimension.key.clone(),
                is_time: false,
            }),
            // Accepted, contributes no grouping
            Datatype::Geo => {}
            Datatype::Unknown => {
                return Err(QueryError::validation(format!(
                    "dimension [{}] has an unsupported datatype",
                    dimension.key
                )))
            }
        }
    }
    Ok(fields)
}

/// The metrics to compile: the declared ones, or the synthetic
/// placeholder so pure-dimension queries still produce grouped rows.
fn effective_metrics(query: &Query) -> Vec<Metric> {
    if !query.metrics.is_empty() {
        return query.metrics.clone();
    }

    let collection = query
        .collection
        .clone()
        .or_else(|| query.dimensions.first().and_then(|d| d.collection.clone()));
    match collection {
        Some(collection) => vec![Metric {
            key: PLACEHOLDER_METRIC.to_owned(),
            collection: Some(collection),
            aggregation: None,
            depends_on: Some(PLACEHOLDER_METRIC.to_owned()),
            attribute: None,
            formula: None,
            filter: None,
        }],
        None => Vec::new(),
    }
}

/// Classify one grouping field against a metric's collection.
fn classify(field: &GroupingField, collection: &CollectionRef) -> GroupFieldState {
    // The time field is maintained on every collection
    if field.is_time {
        return GroupFieldState::Present;
    }
    let declared = collection
        .declared_dimensions()
        .iter()
        .any(|d| d.key == field.key);
    if declared {
        GroupFieldState::Present
    } else {
        GroupFieldState::Absent
    }
}

// ============================================================================
// Tests
// ============================================================================
