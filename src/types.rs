//! Core shared types and value helpers

use chrono::{DateTime, TimeZone, Utc};
use crc::{Crc, CRC_64_ECMA_182};
use serde_json::Value;
use std::cmp::Ordering;

/// A row as stored and as it flows through pipelines: an ordered mapping
/// of field name to JSON value.
pub type Document = serde_json::Map<String, Value>;

/// Canonical name of the time field on every collection.
pub const TIME_FIELD: &str = "timestamp";

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Content hash used for plan dedup keys and row identity keys,
/// rendered as fixed-width hex.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:016x}", CRC64.checksum(bytes))
}

/// Parse a value as a UTC instant: RFC 3339 strings and epoch-millisecond
/// numbers are accepted.
pub fn parse_time_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Compare two JSON values for filtering and sorting.
///
/// Numbers compare numerically; strings compare as instants when both
/// parse as RFC 3339 and lexically otherwise. Values of different types
/// compare only when both parse as instants. `None` means incomparable,
/// which filters treat as "no match".
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => {
            match (parse_time_value(a), parse_time_value(b)) {
                (Some(ta), Some(tb)) => Some(ta.cmp(&tb)),
                _ => Some(x.cmp(y)),
            }
        }
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => match (parse_time_value(a), parse_time_value(b)) {
            (Some(ta), Some(tb)) => Some(ta.cmp(&tb)),
            _ => None,
        },
    }
}

/// Read a possibly-dotted field path out of a document.
pub fn lookup_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    if !path.contains('.') {
        return doc.get(path);
    }
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_hash_is_stable() {
        let a = content_hash(b"plain_events_{}");
        let b = content_hash(b"plain_events_{}");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, content_hash(b"ucount_events_{}"));
    }

    #[test]
    fn test_parse_time_value() {
        let t = parse_time_value(&json!("2023-05-01T10:47:00Z")).unwrap();
        assert_eq!(t.timestamp(), 1682938020);

        let t = parse_time_value(&json!(1682938020000i64)).unwrap();
        assert_eq!(t.timestamp(), 1682938020);

        assert!(parse_time_value(&json!("not a time")).is_none());
        assert!(parse_time_value(&json!(true)).is_none());
    }

    #[test]
    fn test_compare_numbers_and_strings() {
        assert_eq!(
            compare_values(&json!(2), &json!(10)),
            Some(Ordering::Less)
        );
        assert_eq!(
            compare_values(&json!("b"), &json!("a")),
            Some(Ordering::Greater)
        );
        // Different types are incomparable unless both are instants
        assert_eq!(compare_values(&json!(1), &json!("a")), None);
        assert_eq!(
            compare_values(&json!("2023-05-01T00:00:00Z"), &json!(1682899200000i64)),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn test_null_comparisons() {
        assert_eq!(
            compare_values(&Value::Null, &Value::Null),
            Some(Ordering::Equal)
        );
        assert_eq!(compare_values(&Value::Null, &json!(1)), None);
    }

    #[test]
    fn test_lookup_path() {
        let doc: Document = serde_json::from_value(json!({
            "device": {"os": {"name": "linux"}},
            "plain": 1
        }))
        .unwrap();
        assert_eq!(lookup_path(&doc, "plain"), Some(&json!(1)));
        assert_eq!(lookup_path(&doc, "device.os.name"), Some(&json!("linux")));
        assert_eq!(lookup_path(&doc, "device.missing"), None);
    }
}
