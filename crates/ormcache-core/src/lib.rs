//! Core types and traits for ormcache.
//!
//! This crate provides the foundations shared by the cache and its drivers:
//!
//! - `Value` for dynamically-typed field values
//! - `ModelInfo` / `FieldInfo` / `Registry` for model metadata
//! - `Connection` and `Cursor` traits for transactional database access
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod error;
pub mod model;
pub mod value;

pub use connection::{Connection, Cursor, Dialect, IsolationLevel};
pub use error::{
    CacheError, CacheErrorKind, ConfigError, ConnectionError, ConnectionErrorKind,
    ConsistencyError, Error, QueryError, QueryErrorKind, Result, SchemaError, SchemaErrorKind,
    TransactionError, TransactionErrorKind, outcome_into_result,
};
pub use model::{FieldInfo, FieldKind, ID_FIELD, LinkTableInfo, ModelInfo, Registry};
pub use value::Value;
