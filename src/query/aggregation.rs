//! Aggregation fragment compiler
//!
//! For one metric, emits the map contributions, reduce combinators, and
//! finalize expressions that implement its aggregation kind. Fragments
//! from metrics sharing a sub-query are unioned with earlier-wins
//! precedence; an existing entry is never clobbered by a later metric.

use std::collections::BTreeMap;

use crate::pipeline::{Combine, Expr};
use crate::query::ast::{AggregationKind, Metric};

/// Map/reduce/finalize contributions of one metric.
#[derive(Debug, Clone, Default)]
pub struct Fragments {
    /// Map-stage contributions: accumulator name -> expression
    pub map: BTreeMap<String, Expr>,

    /// Reduce-stage combinators: accumulator name -> combinator
    pub reduce: BTreeMap<String, Combine>,

    /// Finalize contributions: output field -> expression
    pub finalize: BTreeMap<String, Expr>,

    /// Attribute to add to the grouping tuple for distinct counting
    pub distinct_attribute: Option<String>,
}

/// Compile the fragments for one metric.
///
/// `grouping_active` reflects whether any grouping fields are in play;
/// a plain sum with no grouping accumulates under the bare attribute
/// name instead of the `sum_` prefixed one. Either way the finalize
/// expression lands on the metric's externally visible key.
pub fn compile(metric: &Metric, grouping_active: bool) -> Fragments {
    let mut fragments = Fragments::default();
    if metric.is_placeholder() {
        // The placeholder metric contributes grouping only
        return fragments;
    }

    let source = metric.source_attribute().to_owned();
    let finalize_attr = metric.finalize_attribute().to_owned();
    let kind = metric.kind();

    match kind {
        AggregationKind::Sum => {
            let acc = accumulator(kind, &source, grouping_active);
            let out = accumulator(kind, &finalize_attr, grouping_active);
            fragments.map.insert(acc.clone(), Expr::attribute(&source));
            fragments.reduce.insert(acc, Combine::Add);
            fragments
                .finalize
                .insert(metric.key.clone(), Expr::Reduction(out));
        }
        AggregationKind::Avg => {
            let sum_acc = format!("sum_{source}");
            let count_acc = format!("count_{source}");
            fragments
                .map
                .insert(sum_acc.clone(), Expr::attribute(&source));
            fragments
                .map
                .insert(count_acc.clone(), Expr::Const(1.into()));
            fragments.reduce.insert(sum_acc, Combine::Add);
            fragments.reduce.insert(count_acc, Combine::Add);
            fragments.finalize.insert(
                metric.key.clone(),
                Expr::Div(
                    Box::new(Expr::Reduction(format!("sum_{finalize_attr}"))),
                    Box::new(Expr::Reduction(format!("count_{finalize_attr}"))),
                ),
            );
        }
        AggregationKind::Min | AggregationKind::Max => {
            let acc = format!("{}_{}", kind.prefix(), source);
            let out = format!("{}_{}", kind.prefix(), finalize_attr);
            let combine = if kind == AggregationKind::Min {
                Combine::Min
            } else {
                Combine::Max
            };
            fragments.map.insert(acc.clone(), Expr::attribute(&source));
            fragments.reduce.insert(acc, combine);
            fragments
                .finalize
                .insert(metric.key.clone(), Expr::Reduction(out));
        }
        AggregationKind::DistinctCount => {
            // Phase 1 maps the raw attribute into the grouping tuple to
            // collapse duplicates; phase 2 sums per-group ones.
            let count_acc = format!("count_{source}");
            fragments
                .map
                .insert(source.clone(), Expr::attribute(&source));
            fragments.reduce.insert(count_acc.clone(), Combine::Add);
            fragments
                .finalize
                .insert(metric.key.clone(), Expr::Reduction(count_acc));
            fragments.distinct_attribute = Some(source);
        }
    }

    fragments
}

fn accumulator(kind: AggregationKind, attribute: &str, grouping_active: bool) -> String {
    if grouping_active {
        format!("{}_{}", kind.prefix(), attribute)
    } else {
        attribute.to_owned()
    }
}

/// Union `incoming` into `existing`, keeping existing entries on key
/// collision (earlier wins).
pub fn merge_preferring_existing<V>(existing: &mut BTreeMap<String, V>, incoming: BTreeMap<String, V>) {
    for (key, value) in incoming {
        existing.entry(key).or_insert(value);
    }
}
