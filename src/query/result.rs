//! Result merging and output types
//!
//! Folds the partial result sets of all sub-queries into one row set.
//! Rows are keyed by a hash of their dimension-tuple values, so partials
//! from different collections land on the same output row; metrics a row
//! never received are filled with explicit nulls so callers can tell
//! "no data" from "not requested".

use chrono::{SecondsFormat, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::query::executor::PartialResult;
use crate::query::plan::QueryPlan;
use crate::types::{content_hash, Document, TIME_FIELD};

// ============================================================================
// Output types
// ============================================================================

/// The unified result of one query invocation.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutput {
    /// Dimensions the query grouped by
    pub dimensions: Vec<crate::query::ast::Dimension>,

    /// Metrics the query computed (including the synthetic placeholder
    /// for pure-dimension queries)
    pub metrics: Vec<crate::query::ast::Metric>,

    /// Merged output rows: dimension fields, metric fields (value or
    /// null), and a `key` identity hash each
    pub documents: Vec<Document>,

    /// The executed physical plan
    pub queryplan: QueryPlan,
}

impl QueryOutput {
    /// Assemble the output from a plan and its partial results.
    pub fn assemble(plan: QueryPlan, partials: Vec<PartialResult>) -> Self {
        let documents = merge_partials(&plan, partials);
        Self {
            dimensions: plan.dimensions.clone(),
            metrics: plan.metrics.clone(),
            documents,
            queryplan: plan,
        }
    }
}

// ============================================================================
// Merge
// ============================================================================

/// Fold all partial result sets into output rows, in partial-result-set
/// order then row order within each set.
///
/// Feeding the same partial twice cannot duplicate rows: an identical
/// dimension tuple always hashes to the same key, and the key map always
/// resolves to the row it created, so the second pass only rewrites the
/// same field values.
pub fn merge_partials(plan: &QueryPlan, partials: Vec<PartialResult>) -> Vec<Document> {
    // Dimension keys the row identity is built from; dotted field names
    // compare with dots normalized to underscores. The time dimension
    // contributes the canonical time field.
    let dimension_keys: HashSet<String> = plan
        .dimensions
        .iter()
        .map(|d| match d.datatype {
            crate::query::ast::Datatype::Date => TIME_FIELD.to_owned(),
            _ => d.key.clone(),
        })
        .collect();

    let mut key_index: HashMap<String, usize> = HashMap::new();
    let mut rows: Vec<Document> = Vec::new();

    for partial in partials {
        for mut doc in partial.rows {
            coerce_timestamp(&mut doc);

            let id: Document = doc
                .iter()
                .filter(|(field, _)| dimension_keys.contains(&field.replace('.', "_")))
                .map(|(field, value)| (field.clone(), value.clone()))
                .collect();
            let key = content_hash(
                serde_json::to_string(&id).unwrap_or_default().as_bytes(),
            );

            let index = *key_index.entry(key.clone()).or_insert_with(|| {
                let mut row = Document::new();
                for (field, value) in &id {
                    row.insert(field.clone(), value.clone());
                }
                row.insert("key".to_owned(), Value::String(key.clone()));
                rows.push(row);
                rows.len() - 1
            });

            let row = &mut rows[index];
            for (attribute, value) in doc {
                if attribute.contains('.') {
                    // Flatten dotted attribute names, dropping the
                    // original dotted key
                    row.remove(&attribute);
                    row.insert(attribute.replace('.', "_"), value);
                } else {
                    row.insert(attribute, value);
                }
            }
        }
    }

    // Explicit nulls for metrics a row never received
    for row in &mut rows {
        for metric in &plan.metrics {
            row.entry(metric.key.clone()).or_insert(Value::Null);
        }
    }

    rows
}

/// Coerce a string-typed numeric timestamp to an epoch, then to a date
/// value when positive. RFC 3339 strings pass through untouched.
fn coerce_timestamp(doc: &mut Document) {
    let Some(value) = doc.get(TIME_FIELD) else {
        return;
    };

    let epoch = match value {
        Value::String(s) => s.parse::<i64>().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    };
    if let Some(ms) = epoch {
        if ms > 0 {
            if let Some(t) = Utc.timestamp_millis_opt(ms).single() {
                doc.insert(
                    TIME_FIELD.to_owned(),
                    Value::String(t.to_rfc3339_opts(SecondsFormat::Secs, true)),
                );
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::{Datatype, Dimension, Metric, Query};
    use crate::query::plan::build_plan;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        serde_json::from_value(value).unwrap()
    }

    fn plan_for(query: &Query) -> QueryPlan {
        build_plan(query).unwrap()
    }

    fn partial(rows: Vec<Document>) -> PartialResult {
        PartialResult {
            sub_query: "test".into(),
            rows,
        }
    }

    #[test]
    fn test_rows_merge_on_dimension_tuple() {
        let query = Query::builder()
            .dimension(Dimension::new("country", Datatype::String))
            .metric(Metric::sum("clicks", "events"))
            .metric(Metric::sum("visits", "pageviews"))
            .build();
        let plan = plan_for(&query);

        let partials = vec![
            partial(vec![doc(json!({"country": "de", "clicks": 7}))]),
            partial(vec![doc(json!({"country": "de", "visits": 3}))]),
        ];
        let rows = merge_partials(&plan, partials);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["country"], json!("de"));
        assert_eq!(rows[0]["clicks"], json!(7));
        assert_eq!(rows[0]["visits"], json!(3));
        assert!(rows[0].contains_key("key"));
    }

    #[test]
    fn test_absent_metric_is_filled_with_null() {
        let query = Query::builder()
            .dimension(Dimension::new("country", Datatype::String))
            .metric(Metric::sum("clicks", "events"))
            .metric(Metric::sum("visits", "missing_collection"))
            .build();
        let plan = plan_for(&query);

        // Only the surviving sub-query contributed rows
        let partials = vec![partial(vec![doc(json!({"country": "de", "clicks": 7}))])];
        let rows = merge_partials(&plan, partials);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["clicks"], json!(7));
        // Explicit null, not omitted
        assert_eq!(rows[0]["visits"], Value::Null);
        assert!(rows[0].contains_key("visits"));
    }

    #[test]
    fn test_merge_is_idempotent_for_duplicate_partials() {
        let query = Query::builder()
            .dimension(Dimension::new("country", Datatype::String))
            .metric(Metric::sum("clicks", "events"))
            .build();
        let plan = plan_for(&query);

        let rows_once = merge_partials(
            &plan,
            vec![partial(vec![doc(json!({"country": "de", "clicks": 7}))])],
        );
        let rows_twice = merge_partials(
            &plan,
            vec![
                partial(vec![doc(json!({"country": "de", "clicks": 7}))]),
                partial(vec![doc(json!({"country": "de", "clicks": 7}))]),
            ],
        );

        assert_eq!(rows_once, rows_twice);
        assert_eq!(rows_twice.len(), 1);
    }

    #[test]
    fn test_same_tuple_always_maps_to_same_key() {
        let query = Query::builder()
            .dimension(Dimension::new("country", Datatype::String))
            .metric(Metric::sum("clicks", "events"))
            .build();
        let plan = plan_for(&query);

        let first = merge_partials(
            &plan,
            vec![partial(vec![doc(json!({"country": "de", "clicks": 1}))])],
        );
        let second = merge_partials(
            &plan,
            vec![partial(vec![doc(json!({"country": "de", "clicks": 99}))])],
        );
        assert_eq!(first[0]["key"], second[0]["key"]);
    }

    #[test]
    fn test_dotted_attributes_flatten() {
        let query = Query::builder()
            .dimension(Dimension::new("device_os", Datatype::String))
            .metric(Metric::sum("clicks", "events"))
            .build();
        let plan = plan_for(&query);

        let rows = merge_partials(
            &plan,
            vec![partial(vec![doc(
                json!({"device.os": "linux", "clicks": 2}),
            )])],
        );
        assert_eq!(rows[0]["device_os"], json!("linux"));
        assert!(!rows[0].contains_key("device.os"));
    }

    #[test]
    fn test_numeric_string_timestamp_coerces_to_date() {
        let query = Query::builder()
            .dimension(Dimension::new("timestamp", Datatype::Date))
            .metric(Metric::sum("clicks", "events"))
            .build();
        let plan = plan_for(&query);

        let rows = merge_partials(
            &plan,
            vec![partial(vec![doc(
                json!({"timestamp": "1682938020000", "clicks": 1}),
            )])],
        );
        assert_eq!(rows[0][TIME_FIELD], json!("2023-05-01T10:47:00Z"));

        // RFC 3339 values pass through untouched
        let rows = merge_partials(
            &plan,
            vec![partial(vec![doc(
                json!({"timestamp": "2023-05-01T10:00:00Z", "clicks": 1}),
            )])],
        );
        assert_eq!(rows[0][TIME_FIELD], json!("2023-05-01T10:00:00Z"));
    }

    #[test]
    fn test_global_aggregation_merges_to_single_row() {
        let query = Query::builder()
            .metric(Metric::sum("clicks", "events"))
            .metric(Metric::sum("visits", "pageviews"))
            .build();
        let plan = plan_for(&query);

        let partials = vec![
            partial(vec![doc(json!({"clicks": 10}))]),
            partial(vec![doc(json!({"visits": 4}))]),
        ];
        let rows = merge_partials(&plan, partials);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["clicks"], json!(10));
        assert_eq!(rows[0]["visits"], json!(4));
    }
}
