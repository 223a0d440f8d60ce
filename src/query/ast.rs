//! Query input contract
//!
//! The analytical query as submitted by callers: grouping dimensions, a
//! set of metrics, an optional timeframe, filters, sort, interval, and a
//! default collection. Deserialization accepts the wire spellings used
//! by existing payloads (`dependsOn`, tuple-shaped filter and sort
//! clauses, `timebucket.*` interval aliases).

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::pipeline::{FilterOp, Interval, SortClause};
use crate::query::error::{QueryError, QueryResult};

/// Synthetic metric key substituted when a query declares no metrics, so
/// pure-dimension queries still produce grouped rows with no aggregate.
pub const PLACEHOLDER_METRIC: &str = "fake";

// ============================================================================
// Query
// ============================================================================

/// A declarative analytical query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Query {
    /// Grouping dimensions
    #[serde(default)]
    pub dimensions: Vec<Dimension>,

    /// Requested aggregate metrics
    #[serde(default)]
    pub metrics: Vec<Metric>,

    /// Time window or trailing-item count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<Timeframe>,

    /// Row filters, `(field, op, value)` triples
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Vec<FilterClause>>,

    /// Result ordering, `(field, direction)` pairs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<SortClause>>,

    /// Bucketing granularity for the date dimension
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<Interval>,

    /// Default collection for the placeholder metric
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<CollectionRef>,
}

impl Query {
    /// Start building a query programmatically.
    pub fn builder() -> QueryBuilder {
        QueryBuilder::default()
    }
}

/// Fluent builder for [`Query`].
#[derive(Debug, Default)]
pub struct QueryBuilder {
    query: Query,
}

impl QueryBuilder {
    /// Add a grouping dimension.
    pub fn dimension(mut self, dimension: Dimension) -> Self {
        self.query.dimensions.push(dimension);
        self
    }

    /// Add a metric.
    pub fn metric(mut self, metric: Metric) -> Self {
        self.query.metrics.push(metric);
        self
    }

    /// Query a `[start, end)` time window (RFC 3339 bounds).
    pub fn timeframe(mut self, start: impl Into<String>, end: impl Into<String>) -> Self {
        self.query.timeframe = Some(Timeframe::Range {
            start: TimeSpec::Text(start.into()),
            end: TimeSpec::Text(end.into()),
        });
        self
    }

    /// Query the trailing `n` items instead of a time window.
    pub fn last_n_items(mut self, n: usize) -> Self {
        self.query.timeframe = Some(Timeframe::LastN { last_n_items: n });
        self
    }

    /// Add a filter clause.
    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        self.query
            .filter
            .get_or_insert_with(Vec::new)
            .push(FilterClause(field.into(), op, value));
        self
    }

    /// Add a sort clause.
    pub fn sort(mut self, field: impl Into<String>, direction: crate::pipeline::Direction) -> Self {
        self.query
            .sort
            .get_or_insert_with(Vec::new)
            .push(SortClause(field.into(), direction));
        self
    }

    /// Set the interval for the date dimension.
    pub fn interval(mut self, interval: Interval) -> Self {
        self.query.interval = Some(interval);
        self
    }

    /// Set the default collection used by the placeholder metric.
    pub fn collection(mut self, key: impl Into<String>) -> Self {
        self.query.collection = Some(CollectionRef::Key(key.into()));
        self
    }

    /// Finish building.
    pub fn build(self) -> Query {
        self.query
    }
}

// ============================================================================
// Timeframe
// ============================================================================

/// Query time scope: an explicit `[start, end)` window or the trailing
/// `n` items by time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timeframe {
    /// Trailing-item count; becomes the sub-query limit with a default
    /// descending time sort
    LastN {
        /// Number of trailing items to return
        last_n_items: usize,
    },
    /// Explicit window; becomes an exclusive `$gt/$lt` predicate pair on
    /// the time field
    Range {
        /// Window start (exclusive)
        start: TimeSpec,
        /// Window end (exclusive)
        end: TimeSpec,
    },
}

/// A point in time as accepted on the wire: epoch milliseconds or an
/// RFC 3339 string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimeSpec {
    /// Epoch milliseconds
    Epoch(i64),
    /// RFC 3339 timestamp (date-only accepted)
    Text(String),
}

impl TimeSpec {
    /// Resolve to a UTC instant.
    pub fn to_utc(&self) -> QueryResult<DateTime<Utc>> {
        match self {
            TimeSpec::Epoch(ms) => Utc
                .timestamp_millis_opt(*ms)
                .single()
                .ok_or_else(|| QueryError::validation(format!("invalid epoch timestamp {ms}"))),
            TimeSpec::Text(s) => {
                if let Ok(t) = DateTime::parse_from_rfc3339(s) {
                    return Ok(t.with_timezone(&Utc));
                }
                chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|d| Utc.from_utc_datetime(&d))
                    .ok_or_else(|| QueryError::validation(format!("invalid timestamp '{s}'")))
            }
        }
    }

    /// Resolve to the RFC 3339 rendering used in compiled predicates.
    pub fn to_rfc3339(&self) -> QueryResult<String> {
        Ok(self.to_utc()?.to_rfc3339_opts(SecondsFormat::Secs, true))
    }
}

// ============================================================================
// Filter clauses
// ============================================================================

/// One `(field, op, value)` filter triple, serialized as a three-element
/// array to match the query wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterClause(pub String, pub FilterOp, pub Value);

impl FilterClause {
    /// Field this clause filters on.
    pub fn field(&self) -> &str {
        &self.0
    }

    /// Comparison operator.
    pub fn op(&self) -> FilterOp {
        self.1
    }

    /// Comparison operand.
    pub fn value(&self) -> &Value {
        &self.2
    }
}

// ============================================================================
// Dimensions
// ============================================================================

/// Datatype of a dimension.
///
/// `date` marks the time dimension and triggers interval bucketing;
/// `geo` is accepted but contributes no grouping; anything unrecognized
/// parses to `Unknown` and fails plan validation before any I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Datatype {
    /// The time dimension
    Date,
    /// IP address
    Ip,
    /// Numeric
    Number,
    /// Categorical string
    String,
    /// Geo coordinates; accepted, contributes no grouping
    Geo,
    /// Unrecognized datatype; a fatal validation error at plan build
    #[serde(other)]
    Unknown,
}

/// A grouping axis for aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dimension {
    /// Dimension key; the output column name
    pub key: String,

    /// Dimension datatype
    pub datatype: Datatype,

    /// Collection this dimension belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<CollectionRef>,
}

impl Dimension {
    /// Create a dimension.
    pub fn new(key: impl Into<String>, datatype: Datatype) -> Self {
        Self {
            key: key.into(),
            datatype,
            collection: None,
        }
    }

    /// Attach the owning collection.
    pub fn with_collection(mut self, collection: CollectionRef) -> Self {
        self.collection = Some(collection);
        self
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// Aggregation kinds supported by the compiler.
///
/// `distinct`, `unique`, and `ucount` are spellings of the same
/// distinct-count kind. Unrecognized spellings fall back to `sum`, the
/// default when no aggregation is declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationKind {
    /// Associative addition
    Sum,
    /// Sum / count, finalized to null on zero rows
    Avg,
    /// Keep the lesser value
    Min,
    /// Keep the greater value
    Max,
    /// Count of distinct attribute values (two-phase pipeline)
    #[serde(rename = "ucount")]
    DistinctCount,
}

impl AggregationKind {
    /// Parse a wire spelling; unrecognized spellings are `Sum`.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "avg" => AggregationKind::Avg,
            "min" => AggregationKind::Min,
            "max" => AggregationKind::Max,
            "distinct" | "unique" | "ucount" => AggregationKind::DistinctCount,
            _ => AggregationKind::Sum,
        }
    }

    /// The accumulator-name prefix for this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            AggregationKind::Sum | AggregationKind::Avg => "sum",
            AggregationKind::Min => "min",
            AggregationKind::Max => "max",
            AggregationKind::DistinctCount => "count",
        }
    }
}

impl<'de> Deserialize<'de> for AggregationKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(AggregationKind::parse(&raw))
    }
}

/// A computed aggregate requested by the query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    /// Metric key; the output column name
    pub key: String,

    /// Collection the metric reads from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<CollectionRef>,

    /// Aggregation kind; defaults to `sum`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<AggregationKind>,

    /// Source attribute the aggregation accumulates
    #[serde(
        default,
        rename = "dependsOn",
        skip_serializing_if = "Option::is_none"
    )]
    pub depends_on: Option<String>,

    /// Attribute read at finalize time; defaults to `dependsOn`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,

    /// Downstream formula; a formula metric is never compiled into a
    /// physical sub-query
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,

    /// Metric-level filters, overriding query-level clauses per field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Vec<FilterClause>>,
}

impl Metric {
    /// Create a metric with an explicit aggregation kind.
    pub fn new(
        key: impl Into<String>,
        kind: AggregationKind,
        collection: impl Into<String>,
    ) -> Self {
        let key = key.into();
        Self {
            depends_on: Some(key.clone()),
            key,
            collection: Some(CollectionRef::Key(collection.into())),
            aggregation: Some(kind),
            attribute: None,
            formula: None,
            filter: None,
        }
    }

    /// Sum metric over its own key.
    pub fn sum(key: impl Into<String>, collection: impl Into<String>) -> Self {
        Self::new(key, AggregationKind::Sum, collection)
    }

    /// Average metric over its own key.
    pub fn avg(key: impl Into<String>, collection: impl Into<String>) -> Self {
        Self::new(key, AggregationKind::Avg, collection)
    }

    /// Distinct-count metric over its own key.
    pub fn ucount(key: impl Into<String>, collection: impl Into<String>) -> Self {
        Self::new(key, AggregationKind::DistinctCount, collection)
    }

    /// Set the source attribute.
    pub fn depends_on(mut self, attribute: impl Into<String>) -> Self {
        self.depends_on = Some(attribute.into());
        self
    }

    /// Add a metric-level filter clause.
    pub fn with_filter(mut self, field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        self.filter
            .get_or_insert_with(Vec::new)
            .push(FilterClause(field.into(), op, value));
        self
    }

    /// Effective aggregation kind (`sum` when unspecified).
    pub fn kind(&self) -> AggregationKind {
        self.aggregation.unwrap_or(AggregationKind::Sum)
    }

    /// Attribute the map stage accumulates: `dependsOn`, else the key.
    pub fn source_attribute(&self) -> &str {
        self.depends_on.as_deref().unwrap_or(&self.key)
    }

    /// Attribute read at finalize time: `attribute`, else `dependsOn`,
    /// else the key.
    pub fn finalize_attribute(&self) -> &str {
        self.attribute
            .as_deref()
            .or(self.depends_on.as_deref())
            .unwrap_or(&self.key)
    }

    /// Whether this is the synthetic placeholder metric.
    pub fn is_placeholder(&self) -> bool {
        self.key == PLACEHOLDER_METRIC
    }
}

// ============================================================================
// Collections
// ============================================================================

/// Reference to a collection: a bare key or a full handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CollectionRef {
    /// Full collection handle with declared dimensions
    Handle(Collection),
    /// Bare collection key; declares no dimensions
    Key(String),
}

impl CollectionRef {
    /// Logical collection key.
    pub fn key(&self) -> &str {
        match self {
            CollectionRef::Key(key) => key,
            CollectionRef::Handle(collection) => &collection.key,
        }
    }

    /// Physical table name before sanitization.
    pub fn store_key(&self) -> &str {
        match self {
            CollectionRef::Key(key) => key,
            CollectionRef::Handle(collection) => {
                collection.store_key.as_deref().unwrap_or(&collection.key)
            }
        }
    }

    /// Dimensions declared on the collection (empty for a bare key).
    pub fn declared_dimensions(&self) -> &[Dimension] {
        match self {
            CollectionRef::Key(_) => &[],
            CollectionRef::Handle(collection) => &collection.dimensions,
        }
    }
}

/// A collection handle: logical key, optional physical store key, and
/// the dimensions its schema declares.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    /// Logical collection key
    pub key: String,

    /// Physical table name; defaults to the key
    #[serde(
        default,
        rename = "storeKey",
        skip_serializing_if = "Option::is_none"
    )]
    pub store_key: Option<String>,

    /// Dimensions declared on this collection's schema
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
}

impl Collection {
    /// Create a collection handle.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            store_key: None,
            dimensions: Vec::new(),
        }
    }

    /// Declare a dimension on this collection.
    pub fn with_dimension(mut self, dimension: Dimension) -> Self {
        self.dimensions.push(dimension);
        self
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_deserializes_wire_format() {
        let query: Query = serde_json::from_value(json!({
            "dimensions": [{"key": "country", "datatype": "string"}],
            "metrics": [{
                "key": "clicks",
                "collection": "web-events",
                "aggregation": "sum",
                "dependsOn": "clicks"
            }],
            "timeframe": {"start": "2023-05-01T00:00:00Z", "end": "2023-05-02T00:00:00Z"},
            "filter": [["browser", "eq", "chrome"]],
            "sort": [["timestamp", "desc"]],
            "interval": "timebucket.hour"
        }))
        .unwrap();

        assert_eq!(query.dimensions[0].key, "country");
        assert_eq!(query.dimensions[0].datatype, Datatype::String);
        assert_eq!(query.metrics[0].kind(), AggregationKind::Sum);
        assert_eq!(query.metrics[0].depends_on.as_deref(), Some("clicks"));
        assert_eq!(query.interval, Some(Interval::Hour));
        assert!(matches!(query.timeframe, Some(Timeframe::Range { .. })));
        let clause = &query.filter.as_ref().unwrap()[0];
        assert_eq!(clause.field(), "browser");
        assert_eq!(clause.op(), FilterOp::Eq);
    }

    #[test]
    fn test_last_n_items_timeframe() {
        let query: Query = serde_json::from_value(json!({
            "timeframe": {"last_n_items": 50}
        }))
        .unwrap();
        assert!(
            matches!(query.timeframe, Some(Timeframe::LastN { last_n_items }) if last_n_items == 50)
        );
    }

    #[test]
    fn test_unknown_datatype_parses_to_unknown() {
        let dimension: Dimension =
            serde_json::from_value(json!({"key": "d", "datatype": "unsupported"})).unwrap();
        assert_eq!(dimension.datatype, Datatype::Unknown);
    }

    #[test]
    fn test_aggregation_spellings() {
        assert_eq!(AggregationKind::parse("sum"), AggregationKind::Sum);
        assert_eq!(
            AggregationKind::parse("distinct"),
            AggregationKind::DistinctCount
        );
        assert_eq!(
            AggregationKind::parse("unique"),
            AggregationKind::DistinctCount
        );
        assert_eq!(
            AggregationKind::parse("ucount"),
            AggregationKind::DistinctCount
        );
        // Unrecognized spellings fall back to sum
        assert_eq!(AggregationKind::parse("median"), AggregationKind::Sum);
    }

    #[test]
    fn test_collection_ref_forms() {
        let bare: CollectionRef = serde_json::from_value(json!("events")).unwrap();
        assert_eq!(bare.key(), "events");
        assert!(bare.declared_dimensions().is_empty());

        let handle: CollectionRef = serde_json::from_value(json!({
            "key": "events",
            "storeKey": "events_v2",
            "dimensions": [{"key": "country", "datatype": "string"}]
        }))
        .unwrap();
        assert_eq!(handle.key(), "events");
        assert_eq!(handle.store_key(), "events_v2");
        assert_eq!(handle.declared_dimensions().len(), 1);
    }

    #[test]
    fn test_metric_attribute_defaults() {
        let metric = Metric {
            key: "clicks".into(),
            collection: None,
            aggregation: None,
            depends_on: None,
            attribute: None,
            formula: None,
            filter: None,
        };
        assert_eq!(metric.source_attribute(), "clicks");
        assert_eq!(metric.finalize_attribute(), "clicks");
        assert_eq!(metric.kind(), AggregationKind::Sum);

        let metric = Metric::sum("clicks", "events").depends_on("raw.clicks");
        assert_eq!(metric.source_attribute(), "raw.clicks");
        assert_eq!(metric.finalize_attribute(), "raw.clicks");
    }

    #[test]
    fn test_timespec_forms() {
        let t = TimeSpec::Text("2023-05-01T10:00:00Z".into());
        assert_eq!(t.to_rfc3339().unwrap(), "2023-05-01T10:00:00Z");

        let t = TimeSpec::Text("2023-05-01".into());
        assert_eq!(t.to_rfc3339().unwrap(), "2023-05-01T00:00:00Z");

        let t = TimeSpec::Epoch(1682938020000);
        assert_eq!(t.to_rfc3339().unwrap(), "2023-05-01T10:47:00Z");

        assert!(TimeSpec::Text("yesterday".into()).to_utc().is_err());
    }
}
