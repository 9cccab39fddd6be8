//! # textdb
//!
//! An embedded, file-backed document database. Records live one per line
//! in append-only text files: free-form JSON documents in `<name>.nosql`,
//! or typed pipe-delimited rows in `<name>.table` with the schema on the
//! first line. Logical deletes tombstone a line by overwriting its leading
//! byte; `clean` compacts tombstones away; updates rewrite in place when
//! the new encoding keeps the byte length and tombstone-then-append
//! otherwise.
//!
//! Each database instance serializes its operations through a per-database
//! scheduler backed by a worker thread, so concurrent callers never race
//! on the file and writes queued together share one streaming pass.
//!
//! ## Modules
//!
//! - `engine`: the database facade, scheduler worker and operation phases
//! - `query`: fluent query builder (predicates, projection, sort, paging)
//! - `filter`: predicate compilation, caching and scalar reductions
//! - `stream`: forward/reverse line streaming and in-place update sessions
//! - `codec`: the JSON document and table row line codecs
//! - `schema`: typed column lists for tables
//! - `counter`: per-key hit/min/max time series with debounced flush
//! - `table`: the schema-table specialization
//! - `events`: typed change listeners
//! - `scheduler`: pending queues and completion handles
//! - `document`: document model and value helpers
//! - `errors`: the crate-wide error type

pub mod codec;
pub mod counter;
pub mod document;
pub mod engine;
pub mod errors;
pub mod events;
pub mod filter;
pub mod query;
pub mod scheduler;
pub mod schema;
pub mod stream;
pub mod table;

pub use counter::{Counter, CounterMode, CounterSlice};
pub use document::Document;
pub use engine::{Database, DatabaseOptions, EngineStats};
pub use errors::DbError;
pub use events::{Event, EventKind};
pub use query::{Join, LikeMode, Listing, Modify, Op, QueryBuilder, ScalarKind, Sort};
pub use scheduler::Pending;
pub use schema::{Column, ColumnType, Schema};
pub use table::Table;
