//! Error types for database operations.
//!
//! All fallible operations in the crate surface a [`DbError`]. The type is
//! cheaply cloneable because a single failure inside a batched write phase
//! is delivered to every job that shared the pass.

use std::sync::Arc;

use thiserror::Error;

/// Comprehensive error type for all database operations.
#[derive(Error, Debug, Clone)]
pub enum DbError {
    /// A write was attempted against a database opened read-only.
    #[error("database is read-only")]
    ReadOnly,

    /// A table operation ran without a declared or persisted schema.
    #[error("table schema is missing")]
    SchemaMissing,

    /// Underlying filesystem error, surfaced to the originating operation.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(Arc<serde_json::Error>),

    /// Malformed input that could not be coerced (schema headers, regex
    /// patterns, counter lines).
    #[error("failed to parse {0}")]
    Parse(String),

    /// A query opted into an error on empty result and matched nothing.
    #[error("{0}")]
    EmptyResult(String),

    /// Waiting on an operation exceeded the caller-supplied deadline.
    #[error("operation timed out")]
    Timeout,

    /// The operation was submitted after the instance was released, or its
    /// completion was abandoned by a shutdown.
    #[error("database instance was released")]
    Released,

    /// The requested combination is not supported by this engine.
    #[error("{0}")]
    Unsupported(&'static str),
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        DbError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Serialization(Arc::new(err))
    }
}
