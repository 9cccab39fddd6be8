//! Predicate compilation and evaluation.
//!
//! The builder's AST compiles into a [`CompiledPredicate`]: regex patterns
//! are compiled once, fulltext queries are pre-tokenized, and the result is
//! cached per database keyed by the user-supplied query id or by a hash of
//! the AST, so repeated identical queries reuse the same compiled object.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use chrono::Datelike;
use parking_lot::Mutex;
use serde_json::{Number, Value};

use crate::document::{self, Document};
use crate::errors::DbError;
use crate::query::{DatePart, LikeMode, Node, Op, ScalarKind};

enum CNode {
    Where {
        name: String,
        op: Op,
        value: Value,
    },
    In {
        name: String,
        values: Vec<Value>,
        negate: bool,
    },
    Between {
        name: String,
        low: Value,
        high: Value,
    },
    Like {
        name: String,
        needle: String,
        mode: LikeMode,
    },
    Regex {
        name: String,
        pattern: regex::Regex,
    },
    Fulltext {
        name: String,
        tokens: Vec<String>,
        required: usize,
    },
    Contains {
        name: String,
        negate: bool,
    },
    DatePart {
        part: DatePart,
        name: String,
        op: Op,
        value: i64,
    },
    Or(Vec<CNode>),
}

/// A compiled, reusable predicate over documents.
pub struct CompiledPredicate {
    nodes: Vec<CNode>,
}

impl CompiledPredicate {
    /// Compiles an AST; regex failures surface as parse errors.
    pub fn compile(nodes: &[Node]) -> Result<Self, DbError> {
        Ok(CompiledPredicate {
            nodes: compile_nodes(nodes)?,
        })
    }

    /// True when every top-level node matches (conjunctive fold).
    pub fn matches(&self, doc: &Document) -> bool {
        self.nodes.iter().all(|node| eval(node, doc))
    }
}

fn compile_nodes(nodes: &[Node]) -> Result<Vec<CNode>, DbError> {
    nodes.iter().map(compile_node).collect()
}

fn compile_node(node: &Node) -> Result<CNode, DbError> {
    Ok(match node {
        Node::Where { name, op, value } => CNode::Where {
            name: name.clone(),
            op: *op,
            value: value.clone(),
        },
        Node::In { name, values } => CNode::In {
            name: name.clone(),
            values: values.clone(),
            negate: false,
        },
        Node::NotIn { name, values } => CNode::In {
            name: name.clone(),
            values: values.clone(),
            negate: true,
        },
        Node::Between { name, low, high } => CNode::Between {
            name: name.clone(),
            low: low.clone(),
            high: high.clone(),
        },
        Node::Like { name, value, mode } => CNode::Like {
            name: name.clone(),
            needle: value.to_lowercase(),
            mode: *mode,
        },
        Node::Regex { name, pattern } => CNode::Regex {
            name: name.clone(),
            pattern: regex::Regex::new(pattern)
                .map_err(|e| DbError::Parse(format!("regex: {e}")))?,
        },
        Node::Fulltext {
            name,
            value,
            weight,
        } => {
            let tokens = tokenize(value);
            // a zero threshold (weight 0 or no tokens) matches vacuously
            let required = (tokens.len() as u32 * weight).div_ceil(100) as usize;
            CNode::Fulltext {
                name: name.clone(),
                tokens,
                required,
            }
        }
        Node::Contains { name } => CNode::Contains {
            name: name.clone(),
            negate: false,
        },
        Node::Empty { name } => CNode::Contains {
            name: name.clone(),
            negate: true,
        },
        Node::DatePart {
            part,
            name,
            op,
            value,
        } => CNode::DatePart {
            part: *part,
            name: name.clone(),
            op: *op,
            value: *value,
        },
        Node::Or(children) => CNode::Or(compile_nodes(children)?),
    })
}

fn eval(node: &CNode, doc: &Document) -> bool {
    match node {
        CNode::Where { name, op, value } => {
            op.evaluate(document::compare(document::field(doc, name), value))
        }
        CNode::In {
            name,
            values,
            negate,
        } => {
            let field = document::field(doc, name);
            let found = match field {
                Value::Array(items) => items.iter().any(|item| contains_value(values, item)),
                other => contains_value(values, other),
            };
            found != *negate
        }
        CNode::Between { name, low, high } => {
            let field = document::field(doc, name);
            Op::Gte.evaluate(document::compare(field, low))
                && Op::Lte.evaluate(document::compare(field, high))
        }
        CNode::Like { name, needle, mode } => {
            like_match(document::field(doc, name), needle, *mode)
        }
        CNode::Regex { name, pattern } => match document::field(doc, name) {
            Value::String(text) => pattern.is_match(text),
            Value::Null => false,
            other => pattern.is_match(&other.to_string()),
        },
        CNode::Fulltext {
            name,
            tokens,
            required,
        } => {
            let haystack = match document::field(doc, name) {
                Value::String(text) => text.to_lowercase(),
                Value::Null => return false,
                other => other.to_string().to_lowercase(),
            };
            let hits = tokens.iter().filter(|t| haystack.contains(t.as_str())).count();
            hits >= *required
        }
        CNode::Contains { name, negate } => {
            document::has_content(document::field(doc, name)) != *negate
        }
        CNode::DatePart {
            part,
            name,
            op,
            value,
        } => match document::as_date(document::field(doc, name)) {
            Some(dt) => {
                let component = match part {
                    DatePart::Month => dt.month() as i64,
                    DatePart::Day => dt.day() as i64,
                    DatePart::Year => dt.year() as i64,
                };
                op.evaluate(Some(component.cmp(value)))
            }
            None => false,
        },
        // booleans inside an `or` group fold disjunctively; an empty group
        // constrains nothing
        CNode::Or(children) => {
            children.is_empty() || children.iter().any(|child| eval(child, doc))
        }
    }
}

fn contains_value(values: &[Value], candidate: &Value) -> bool {
    values
        .iter()
        .any(|v| document::compare(v, candidate) == Some(std::cmp::Ordering::Equal))
}

fn like_match(field: &Value, needle: &str, mode: LikeMode) -> bool {
    match field {
        Value::String(text) => like_text(text, needle, mode),
        Value::Array(items) => items.iter().any(|item| like_match(item, needle, mode)),
        Value::Null => false,
        other => like_text(&other.to_string(), needle, mode),
    }
}

fn like_text(text: &str, needle: &str, mode: LikeMode) -> bool {
    let haystack = text.to_lowercase();
    match mode {
        LikeMode::Begins => haystack.starts_with(needle),
        LikeMode::Ends => haystack.ends_with(needle),
        LikeMode::Anywhere => haystack.contains(needle),
    }
}

/// Splits a query string into lowercase tokens; words containing CJK
/// characters additionally tokenize per character.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for word in text.split_whitespace() {
        let lower = word.to_lowercase();
        if lower.chars().any(is_cjk) {
            let mut run = String::new();
            for ch in lower.chars() {
                if is_cjk(ch) {
                    if !run.is_empty() {
                        out.push(std::mem::take(&mut run));
                    }
                    out.push(ch.to_string());
                } else {
                    run.push(ch);
                }
            }
            if !run.is_empty() {
                out.push(run);
            }
        } else {
            out.push(lower);
        }
    }
    out
}

fn is_cjk(ch: char) -> bool {
    matches!(ch,
        '\u{3040}'..='\u{30FF}'   // hiragana, katakana
        | '\u{3400}'..='\u{4DBF}' // CJK extension A
        | '\u{4E00}'..='\u{9FFF}' // CJK unified
        | '\u{AC00}'..='\u{D7AF}' // hangul syllables
    )
}

/// Applies projection after a predicate match. The sort key survives both
/// the keep list and the drop set so ordering still works downstream.
pub fn project(
    doc: Document,
    fields: &Option<Vec<String>>,
    exclude: &Option<Vec<String>>,
    sort_key: Option<&str>,
) -> Document {
    if let Some(keep) = fields {
        let mut out = Document::new();
        for (key, value) in doc {
            if keep.iter().any(|k| k == &key) || sort_key == Some(key.as_str()) {
                out.insert(key, value);
            }
        }
        return out;
    }
    if let Some(drop) = exclude {
        let mut out = Document::new();
        for (key, value) in doc {
            if !drop.iter().any(|k| k == &key) || sort_key == Some(key.as_str()) {
                out.insert(key, value);
            }
        }
        return out;
    }
    doc
}

/// Streaming scalar accumulator for `count/sum/min/max/avg/group`.
pub struct ScalarAcc {
    kind: ScalarKind,
    field: Option<String>,
    count: usize,
    numeric_count: usize,
    sum: f64,
    min: Option<Value>,
    max: Option<Value>,
    groups: serde_json::Map<String, Value>,
}

impl ScalarAcc {
    pub fn new(kind: ScalarKind, field: Option<String>) -> Self {
        ScalarAcc {
            kind,
            field,
            count: 0,
            numeric_count: 0,
            sum: 0.0,
            min: None,
            max: None,
            groups: serde_json::Map::new(),
        }
    }

    pub fn push(&mut self, doc: &Document) {
        self.count += 1;
        let name = match &self.field {
            Some(name) => name,
            None => return,
        };
        let value = document::field(doc, name);

        match self.kind {
            ScalarKind::Sum | ScalarKind::Avg => {
                if let Value::Number(n) = value {
                    self.sum += n.as_f64().unwrap_or(0.0);
                    self.numeric_count += 1;
                }
            }
            ScalarKind::Min => {
                if !value.is_null() && !better(self.min.as_ref(), value, false) {
                    self.min = Some(value.clone());
                }
            }
            ScalarKind::Max => {
                if !value.is_null() && !better(self.max.as_ref(), value, true) {
                    self.max = Some(value.clone());
                }
            }
            ScalarKind::Group => {
                if !value.is_null() {
                    let key = document::group_key(value);
                    let entry = self.groups.entry(key).or_insert(Value::from(0u64));
                    let seen = entry.as_u64().unwrap_or(0);
                    *entry = Value::from(seen + 1);
                }
            }
            ScalarKind::Count => {}
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn finish(self) -> Value {
        match self.kind {
            ScalarKind::Count => Value::from(self.count as u64),
            ScalarKind::Sum => number(self.sum),
            ScalarKind::Min => self.min.unwrap_or(Value::Null),
            ScalarKind::Max => self.max.unwrap_or(Value::Null),
            ScalarKind::Avg => {
                if self.numeric_count == 0 {
                    Value::Null
                } else {
                    number(self.sum / self.numeric_count as f64)
                }
            }
            ScalarKind::Group => Value::Object(self.groups),
        }
    }
}

// true when `current` already beats `candidate` for the given direction
fn better(current: Option<&Value>, candidate: &Value, want_max: bool) -> bool {
    match current {
        None => false,
        Some(held) => match document::compare(held, candidate) {
            Some(ord) => {
                if want_max {
                    ord != std::cmp::Ordering::Less
                } else {
                    ord != std::cmp::Ordering::Greater
                }
            }
            None => true,
        },
    }
}

fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Per-database cache of compiled predicates.
///
/// Keyed by the user-supplied query id when present, otherwise by a hash
/// of the AST's canonical rendering.
#[derive(Default)]
pub struct QueryCache {
    map: Mutex<HashMap<String, Arc<CompiledPredicate>>>,
}

impl QueryCache {
    pub fn compiled(
        &self,
        cache_id: Option<&str>,
        nodes: &[Node],
    ) -> Result<Arc<CompiledPredicate>, DbError> {
        let key = match cache_id {
            Some(id) => format!("id:{id}"),
            None => {
                let mut hasher = DefaultHasher::new();
                format!("{nodes:?}").hash(&mut hasher);
                format!("ast:{:016x}", hasher.finish())
            }
        };

        if let Some(found) = self.map.lock().get(&key) {
            return Ok(found.clone());
        }
        let compiled = Arc::new(CompiledPredicate::compile(nodes)?);
        self.map.lock().insert(key, compiled.clone());
        Ok(compiled)
    }

    pub fn clear(&self) {
        self.map.lock().clear();
    }
}
