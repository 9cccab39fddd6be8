//! Document model and value helpers.
//!
//! A document is an arbitrary JSON object stored as one line of the data
//! file. The engine enforces no schema; keys are opaque strings. Fields are
//! addressed by dotted paths, and date-shaped strings are treated as
//! timestamps wherever a comparison or a table column asks for one.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

/// A single stored record: a JSON object with insertion-ordered keys.
///
/// Key order is preserved through decode/encode so a re-encoded document
/// keeps its byte layout, which is what makes in-place updates possible.
pub type Document = serde_json::Map<String, Value>;

static NULL: Value = Value::Null;

/// Resolves a dotted field path inside a document.
///
/// Missing segments resolve to `Null` rather than an error, so predicates
/// can treat absent fields uniformly.
pub fn field<'a>(doc: &'a Document, path: &str) -> &'a Value {
    let mut current = match doc.get(first_segment(path)) {
        Some(v) => v,
        None => return &NULL,
    };

    for segment in path.split('.').skip(1) {
        current = match current {
            Value::Object(map) => map.get(segment).unwrap_or(&NULL),
            _ => return &NULL,
        };
    }

    current
}

fn first_segment(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}

/// Parses a value into a UTC timestamp if it is date-shaped.
///
/// Accepts ISO-8601 strings (with or without a time component) and numeric
/// epoch milliseconds.
pub fn as_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => parse_date_str(text),
        Value::Number(n) => {
            let millis = n.as_i64()?;
            DateTime::<Utc>::from_timestamp_millis(millis)
        }
        _ => None,
    }
}

fn parse_date_str(text: &str) -> Option<DateTime<Utc>> {
    if text.len() < 8 || !text.contains('-') {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc());
    }
    if let Ok(d) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(d.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

/// Epoch milliseconds for a date-shaped value.
pub fn date_millis(value: &Value) -> Option<i64> {
    as_date(value).map(|dt| dt.timestamp_millis())
}

/// Compares two JSON values the way predicates do.
///
/// Numbers compare numerically, date-shaped strings by epoch milliseconds,
/// other strings lexicographically, booleans as false < true. Values of
/// incomparable shapes return `None`, which fails every ordering operator.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::String(x), Value::String(y)) => {
            match (parse_date_str(x), parse_date_str(y)) {
                (Some(dx), Some(dy)) => Some(dx.cmp(&dy)),
                _ => Some(x.cmp(y)),
            }
        }
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        // mixed date representations: string vs epoch millis
        (Value::String(_), Value::Number(_)) | (Value::Number(_), Value::String(_)) => {
            let dx = date_millis(a)?;
            let dy = date_millis(b)?;
            Some(dx.cmp(&dy))
        }
        _ => None,
    }
}

/// True when the value holds something: non-null, non-empty string or
/// array, non-empty object.
pub fn has_content(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

/// Renders a scalar as a grouping key.
pub fn group_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
