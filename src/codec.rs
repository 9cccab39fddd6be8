//! Line codecs: free-form JSON documents and fixed-schema table rows.
//!
//! ## JSON documents
//!
//! A document encodes as ordinary JSON with one rewrite: every boolean
//! `true` value gets a trailing space before the following `,` or `}`.
//! `true ` and `false` are both five bytes, so toggling a flag never
//! changes the encoded length and the line can be rewritten in place.
//! Whitespace is valid JSON, so decode is a plain parse.
//!
//! ## Table rows
//!
//! A row encodes as `<marker>|v1|v2|…`. The marker is `+` for a live row,
//! `*` for a live row whose text/object cells needed percent escaping
//! (`|` → `%7C`, CR → `%0D`, LF → `%0A`), and `-` for a tombstone.
//! Booleans encode as `1`/`0`, dates as epoch milliseconds, objects as
//! JSON, absent values as an empty cell.

use chrono::{DateTime, Utc};
use serde_json::{Number, Value};

use crate::document::{self, Document};
use crate::errors::DbError;
use crate::schema::{ColumnType, Schema};

/// Leading byte of a live table row without escaped cells.
pub const MARKER_LIVE: u8 = b'+';
/// Leading byte of a live table row with percent-escaped cells.
pub const MARKER_ESCAPED: u8 = b'*';
/// Leading byte of a logically deleted line.
pub const MARKER_TOMBSTONE: u8 = b'-';

/// Encodes a document as a single line (no trailing newline).
pub fn encode_document(doc: &Document) -> Result<String, DbError> {
    let raw = serde_json::to_string(doc)?;
    Ok(pad_true_values(&raw))
}

/// Decodes one line into a document. Tombstoned lines return `None`.
///
/// A malformed line is reported as a parse error; callers skip it and count
/// it rather than aborting the scan.
pub fn decode_document(line: &str) -> Result<Option<Document>, DbError> {
    if line.as_bytes().first() == Some(&MARKER_TOMBSTONE) {
        return Ok(None);
    }
    let doc: Document =
        serde_json::from_str(line).map_err(|e| DbError::Parse(format!("document line: {e}")))?;
    Ok(Some(doc))
}

/// Rewrites `:true,` / `:true}` into `:true ,` / `:true }` outside string
/// literals so that `true` and `false` occupy the same number of bytes.
fn pad_true_values(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(raw.len() + 8);
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            out.push(b);
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match b {
            b'"' => {
                in_string = true;
                out.push(b'"');
                i += 1;
            }
            b't' if bytes[..i].ends_with(b":") && bytes[i..].starts_with(b"true") => {
                out.extend_from_slice(b"true");
                if matches!(bytes.get(i + 4), Some(b',') | Some(b'}')) {
                    out.push(b' ');
                }
                i += 4;
            }
            _ => {
                out.push(b);
                i += 1;
            }
        }
    }

    // only ASCII spaces were inserted at token boundaries
    String::from_utf8_lossy(&out).into_owned()
}

/// Encodes a document as a table row under the given schema.
///
/// The marker is chosen after scanning every text/object cell: a single
/// offending byte switches the whole row to `*` and escapes all cells of
/// those two types.
pub fn encode_row(doc: &Document, schema: &Schema) -> Result<String, DbError> {
    let mut cells = Vec::with_capacity(schema.columns.len());
    let mut needs_escape = false;

    for col in &schema.columns {
        let value = document::field(doc, &col.name);
        let cell = match col.kind {
            ColumnType::Text => match value {
                Value::Null => String::new(),
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            ColumnType::Number => match value {
                Value::Null => String::new(),
                Value::Number(n) => n.to_string(),
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            ColumnType::Boolean => match value {
                Value::Bool(true) => "1".to_string(),
                Value::Null => String::new(),
                Value::Number(n) if n.as_f64().unwrap_or(0.0) != 0.0 => "1".to_string(),
                _ => "0".to_string(),
            },
            ColumnType::Date => match document::as_date(value) {
                Some(dt) => dt.timestamp_millis().to_string(),
                None => String::new(),
            },
            ColumnType::Object => match value {
                Value::Null => String::new(),
                other => serde_json::to_string(other)?,
            },
        };

        if matches!(col.kind, ColumnType::Text | ColumnType::Object) && contains_unsafe(&cell) {
            needs_escape = true;
        }
        cells.push(cell);
    }

    let marker = if needs_escape {
        MARKER_ESCAPED
    } else {
        MARKER_LIVE
    };
    let mut line = String::with_capacity(1 + cells.iter().map(|c| c.len() + 1).sum::<usize>());
    line.push(marker as char);
    for (col, cell) in schema.columns.iter().zip(&cells) {
        line.push('|');
        if needs_escape && matches!(col.kind, ColumnType::Text | ColumnType::Object) {
            line.push_str(&escape_cell(cell));
        } else {
            line.push_str(cell);
        }
    }
    Ok(line)
}

/// Decodes one table row. Tombstones and the header line return `None`.
///
/// `keys` restricts decoding to a subset of columns (partial projection);
/// malformed cells coerce to the column type's zero value.
pub fn decode_row(line: &str, schema: &Schema, keys: Option<&[String]>) -> Option<Document> {
    let bytes = line.as_bytes();
    let marker = *bytes.first()?;
    let unescape_cells = match marker {
        MARKER_LIVE => false,
        MARKER_ESCAPED => true,
        _ => return None,
    };

    let mut doc = Document::new();
    let mut cells = line.split('|').skip(1);

    for col in &schema.columns {
        let raw = cells.next().unwrap_or("");
        if let Some(keep) = keys {
            if !keep.iter().any(|k| k == &col.name) {
                continue;
            }
        }
        let cell;
        let raw = if unescape_cells && matches!(col.kind, ColumnType::Text | ColumnType::Object) {
            cell = unescape_cell(raw);
            cell.as_str()
        } else {
            raw
        };

        let value = match col.kind {
            ColumnType::Text => Value::String(raw.to_string()),
            ColumnType::Number => {
                if raw.is_empty() {
                    Value::Null
                } else if let Ok(int) = raw.parse::<i64>() {
                    Value::from(int)
                } else {
                    // malformed cells coerce to the type's zero value
                    let n = raw.parse::<f64>().unwrap_or(0.0);
                    Value::Number(Number::from_f64(n).unwrap_or_else(|| Number::from(0)))
                }
            }
            ColumnType::Boolean => Value::Bool(raw == "1" || raw == "true"),
            ColumnType::Date => match raw.parse::<i64>().ok().and_then(date_from_millis) {
                Some(dt) => Value::String(dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
                None => Value::Null,
            },
            ColumnType::Object => serde_json::from_str(raw).unwrap_or(Value::Null),
        };
        doc.insert(col.name.clone(), value);
    }

    Some(doc)
}

fn date_from_millis(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
}

fn contains_unsafe(cell: &str) -> bool {
    cell.bytes().any(|b| b == b'|' || b == b'\r' || b == b'\n')
}

fn escape_cell(cell: &str) -> String {
    let mut out = String::with_capacity(cell.len());
    for ch in cell.chars() {
        match ch {
            '|' => out.push_str("%7C"),
            '\r' => out.push_str("%0D"),
            '\n' => out.push_str("%0A"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_cell(cell: &str) -> String {
    let mut out = String::with_capacity(cell.len());
    let bytes = cell.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            match &bytes[i + 1..i + 3] {
                b"7C" => {
                    out.push('|');
                    i += 3;
                    continue;
                }
                b"0D" => {
                    out.push('\r');
                    i += 3;
                    continue;
                }
                b"0A" => {
                    out.push('\n');
                    i += 3;
                    continue;
                }
                _ => {}
            }
        }
        let ch_len = utf8_len(bytes[i]);
        out.push_str(&cell[i..i + ch_len]);
        i += ch_len;
    }
    out
}

fn utf8_len(first: u8) -> usize {
    match first {
        b if b < 0x80 => 1,
        b if b >= 0xF0 => 4,
        b if b >= 0xE0 => 3,
        _ => 2,
    }
}
