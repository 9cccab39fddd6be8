//! Query builder: fluent assembly of a predicate tree plus read options.
//!
//! Builder methods push typed nodes into an AST; `or()` opens a
//! disjunctive group that `end()` closes. The finished builder is consumed
//! by exactly one scheduler drain, which compiles the AST (see
//! [`crate::filter`]) and evaluates it against every live document of the
//! pass.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::document::Document;
use crate::engine::Database;

/// Comparison operator for `where_` and the date-part predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Op {
    /// Parses the textual operators accepted by the builder.
    pub fn parse(text: &str) -> Option<Op> {
        match text {
            "=" | "==" => Some(Op::Eq),
            "!=" | "<>" => Some(Op::Ne),
            ">" => Some(Op::Gt),
            ">=" => Some(Op::Gte),
            "<" => Some(Op::Lt),
            "<=" => Some(Op::Lte),
            _ => None,
        }
    }

    pub(crate) fn evaluate(self, ordering: Option<Ordering>) -> bool {
        match self {
            Op::Eq => ordering == Some(Ordering::Equal),
            Op::Ne => ordering != Some(Ordering::Equal),
            Op::Gt => ordering == Some(Ordering::Greater),
            Op::Gte => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
            Op::Lt => ordering == Some(Ordering::Less),
            Op::Lte => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        }
    }
}

/// Position constraint for `like`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikeMode {
    Begins,
    Ends,
    Anywhere,
}

/// Date component selected by `month`/`day`/`year`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatePart {
    Month,
    Day,
    Year,
}

/// One predicate node of the typed AST.
#[derive(Debug, Clone)]
pub enum Node {
    Where {
        name: String,
        op: Op,
        value: Value,
    },
    In {
        name: String,
        values: Vec<Value>,
    },
    NotIn {
        name: String,
        values: Vec<Value>,
    },
    Between {
        name: String,
        low: Value,
        high: Value,
    },
    Like {
        name: String,
        value: String,
        mode: LikeMode,
    },
    Regex {
        name: String,
        pattern: String,
    },
    Fulltext {
        name: String,
        value: String,
        weight: u32,
    },
    Contains {
        name: String,
    },
    Empty {
        name: String,
    },
    DatePart {
        part: DatePart,
        name: String,
        op: Op,
        value: i64,
    },
    /// Disjunctive group: true when any child matches.
    Or(Vec<Node>),
}

/// Reduction applied instead of returning documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Count,
    Sum,
    Min,
    Max,
    Avg,
    Group,
}

/// Result ordering.
#[derive(Clone)]
pub enum Sort {
    /// Order by a field, ascending or descending.
    Field { name: String, ascending: bool },
    /// Shuffle the result set.
    Random,
    /// Caller-supplied comparator.
    Comparator(Arc<dyn Fn(&Document, &Document) -> Ordering + Send + Sync>),
}

/// Paginated result shape produced by `listing`.
#[derive(Debug, Clone, Serialize)]
pub struct Listing {
    pub page: usize,
    pub pages: usize,
    pub limit: usize,
    pub count: usize,
    pub items: Vec<Document>,
}

/// Change set applied by the update phase to every matching document.
pub enum Modify {
    /// Replace the whole document.
    Set(Document),
    /// Merge fields into the document. A key prefixed with `+`, `-`, `*`
    /// or `/` applies the arithmetic operation to the existing numeric
    /// value instead of assigning.
    Merge(Document),
    /// Arbitrary in-place mutation.
    With(Arc<dyn Fn(&mut Document) + Send + Sync>),
}

/// Join resolved against a sibling database after the scan completes.
pub struct Join {
    pub(crate) field: String,
    pub(crate) db: Database,
    pub(crate) local: String,
    pub(crate) foreign: String,
    pub(crate) first: bool,
    pub(crate) scalar: Option<(ScalarKind, String)>,
}

impl Join {
    /// Joined documents land under `field` of every result document.
    pub fn new(field: impl Into<String>, db: &Database) -> Self {
        Join {
            field: field.into(),
            db: db.clone(),
            local: String::new(),
            foreign: String::new(),
            first: false,
            scalar: None,
        }
    }

    /// Matches `local` on the result documents against `foreign` on the
    /// joined database.
    pub fn on(mut self, local: impl Into<String>, foreign: impl Into<String>) -> Self {
        self.local = local.into();
        self.foreign = foreign.into();
        self
    }

    /// Attach only the first joined document instead of an array.
    pub fn first(mut self) -> Self {
        self.first = true;
        self
    }

    /// Attach a reduction over the joined documents instead of the
    /// documents themselves.
    pub fn scalar(mut self, kind: ScalarKind, field: impl Into<String>) -> Self {
        self.scalar = Some((kind, field.into()));
        self
    }
}

/// User closure predicate, ANDed after the cached AST.
pub type PrepareFn = Arc<dyn Fn(&Document, usize) -> bool + Send + Sync>;

/// Fluent query assembly. Created per call, consumed by one drain.
#[derive(Default)]
pub struct QueryBuilder {
    pub(crate) nodes: Vec<Node>,
    group_stack: Vec<Vec<Node>>,
    pub(crate) take: usize,
    pub(crate) skip: usize,
    pub(crate) first: bool,
    pub(crate) sort: Option<Sort>,
    pub(crate) fields: Option<Vec<String>>,
    pub(crate) fields_exclude: Option<Vec<String>>,
    pub(crate) scalar: Option<(ScalarKind, Option<String>)>,
    pub(crate) listing: bool,
    pub(crate) cache_id: Option<String>,
    pub(crate) prepare: Vec<PrepareFn>,
    pub(crate) joins: Vec<Join>,
    pub(crate) empty_error: Option<String>,
}

impl QueryBuilder {
    pub fn new() -> Self {
        QueryBuilder::default()
    }

    fn push(mut self, node: Node) -> Self {
        match self.group_stack.last_mut() {
            Some(group) => group.push(node),
            None => self.nodes.push(node),
        }
        self
    }

    /// `field <op> value`; dates compare by epoch milliseconds.
    pub fn where_(self, name: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        self.push(Node::Where {
            name: name.into(),
            op,
            value: value.into(),
        })
    }

    /// Field value (scalar or any array element) is one of `values`.
    pub fn in_(self, name: impl Into<String>, values: Vec<Value>) -> Self {
        self.push(Node::In {
            name: name.into(),
            values,
        })
    }

    /// Field value is none of `values`.
    pub fn not_in(self, name: impl Into<String>, values: Vec<Value>) -> Self {
        self.push(Node::NotIn {
            name: name.into(),
            values,
        })
    }

    /// `low <= field <= high`.
    pub fn between(
        self,
        name: impl Into<String>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Self {
        self.push(Node::Between {
            name: name.into(),
            low: low.into(),
            high: high.into(),
        })
    }

    /// Case-insensitive substring match with a position constraint.
    pub fn like(self, name: impl Into<String>, value: impl Into<String>, mode: LikeMode) -> Self {
        self.push(Node::Like {
            name: name.into(),
            value: value.into(),
            mode,
        })
    }

    /// `like` with a list value; the items join with a space before the
    /// match.
    pub fn like_list(
        self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<String>>,
        mode: LikeMode,
    ) -> Self {
        let value = values
            .into_iter()
            .map(Into::into)
            .collect::<Vec<String>>()
            .join(" ");
        self.like(name, value, mode)
    }

    /// `like` anywhere; the conventional search shorthand.
    pub fn search(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.like(name, value, LikeMode::Anywhere)
    }

    /// Regular-expression match over the field's text.
    pub fn regex(self, name: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.push(Node::Regex {
            name: name.into(),
            pattern: pattern.into(),
        })
    }

    /// Token search: at least `ceil(tokens * weight / 100)` of the query
    /// tokens must appear in the field. CJK text tokenizes per character.
    pub fn fulltext(
        self,
        name: impl Into<String>,
        value: impl Into<String>,
        weight: Option<u32>,
    ) -> Self {
        self.push(Node::Fulltext {
            name: name.into(),
            value: value.into(),
            weight: weight.unwrap_or(100).min(100),
        })
    }

    /// Field holds something (non-null, non-empty).
    pub fn contains(self, name: impl Into<String>) -> Self {
        self.push(Node::Contains { name: name.into() })
    }

    /// Field is absent or empty.
    pub fn empty(self, name: impl Into<String>) -> Self {
        self.push(Node::Empty { name: name.into() })
    }

    /// Compare the month component (1-12) of a date-shaped field.
    pub fn month(self, name: impl Into<String>, op: Op, value: u32) -> Self {
        self.push(Node::DatePart {
            part: DatePart::Month,
            name: name.into(),
            op,
            value: value as i64,
        })
    }

    /// Compare the day-of-month component of a date-shaped field.
    pub fn day(self, name: impl Into<String>, op: Op, value: u32) -> Self {
        self.push(Node::DatePart {
            part: DatePart::Day,
            name: name.into(),
            op,
            value: value as i64,
        })
    }

    /// Compare the year component of a date-shaped field.
    pub fn year(self, name: impl Into<String>, op: Op, value: i32) -> Self {
        self.push(Node::DatePart {
            part: DatePart::Year,
            name: name.into(),
            op,
            value: value as i64,
        })
    }

    /// Opens a disjunctive group; nodes pushed until `end()` are OR-ed.
    pub fn or(mut self) -> Self {
        self.group_stack.push(Vec::new());
        self
    }

    /// Closes the innermost `or()` group.
    pub fn end(mut self) -> Self {
        if let Some(group) = self.group_stack.pop() {
            self = self.push(Node::Or(group));
        }
        self
    }

    /// User predicate closure, evaluated after the AST (receives the
    /// document and its ordinal in the scan).
    pub fn prepare(mut self, f: impl Fn(&Document, usize) -> bool + Send + Sync + 'static) -> Self {
        self.prepare.push(Arc::new(f));
        self
    }

    /// Maximum number of documents to return (0 = unbounded).
    pub fn take(mut self, n: usize) -> Self {
        self.take = n;
        self
    }

    /// Number of matching documents to pass over before collecting.
    pub fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    /// Stop at the first match and return a single document.
    pub fn first(mut self) -> Self {
        self.first = true;
        self.take = 1;
        self
    }

    /// Order by a field.
    pub fn sort(mut self, name: impl Into<String>, ascending: bool) -> Self {
        self.sort = Some(Sort::Field {
            name: name.into(),
            ascending,
        });
        self
    }

    /// Shuffle the results.
    pub fn sort_random(mut self) -> Self {
        self.sort = Some(Sort::Random);
        self
    }

    /// Order with a caller-supplied comparator.
    pub fn sort_with(
        mut self,
        cmp: impl Fn(&Document, &Document) -> Ordering + Send + Sync + 'static,
    ) -> Self {
        self.sort = Some(Sort::Comparator(Arc::new(cmp)));
        self
    }

    /// Keep only the listed fields (the sort key is always retained).
    pub fn fields(mut self, names: &[&str]) -> Self {
        self.fields = Some(names.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Drop the listed fields (the sort key is never dropped).
    pub fn fields_exclude(mut self, names: &[&str]) -> Self {
        self.fields_exclude = Some(names.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Reduce to a scalar instead of returning documents. `field` is
    /// unused for `Count`.
    pub fn scalar(mut self, kind: ScalarKind, field: Option<&str>) -> Self {
        self.scalar = Some((kind, field.map(|s| s.to_string())));
        self
    }

    /// Shape the response as a [`Listing`] page.
    pub fn listing(mut self) -> Self {
        self.listing = true;
        self
    }

    /// Paging shorthand: `take(limit)` plus `skip((page - 1) * limit)`.
    pub fn page(self, page: usize, limit: usize) -> Self {
        self.take(limit).skip(page.saturating_sub(1) * limit)
    }

    /// Cache key for the compiled predicate, scoped to the database.
    /// Without it the cache key is a hash of the AST.
    pub fn id(mut self, key: impl Into<String>) -> Self {
        self.cache_id = Some(key.into());
        self
    }

    /// Resolve a join against a sibling database after the scan.
    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    /// Surface [`crate::DbError::EmptyResult`] with this message when the
    /// query matches nothing.
    pub fn require_result(mut self, message: impl Into<String>) -> Self {
        self.empty_error = Some(message.into());
        self
    }

    /// Closes any unterminated `or()` groups; called by the drain.
    pub(crate) fn seal(mut self) -> Self {
        while !self.group_stack.is_empty() {
            self = self.end();
        }
        self
    }
}
