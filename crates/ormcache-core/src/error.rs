//! Error types for cache and transaction operations.

use asupersync::Outcome;
use std::fmt;

/// SQLSTATE reported by databases for a serialization failure.
pub const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";

/// The primary error type for all ormcache operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect)
    Connection(ConnectionError),
    /// Statement execution errors reported by the database
    Query(QueryError),
    /// Transaction lifecycle errors
    Transaction(TransactionError),
    /// Invalid model or field metadata
    Schema(SchemaError),
    /// Cache lookups and writes that cannot be satisfied
    Cache(CacheError),
    /// The database disagrees with what the cache believes
    Consistency(ConsistencyError),
    /// Configuration errors
    Config(ConfigError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retrying the transaction may succeed)
    Serialization,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// BEGIN was refused
    Begin,
    /// COMMIT failed for a reason other than a serialization conflict
    Commit,
    /// ROLLBACK failed
    Rollback,
}

#[derive(Debug)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// A model name is registered twice
    DuplicateModel,
    /// A relation points at a model that is not registered
    UnknownRelatedModel,
    /// A relation field lacks the metadata its kind needs
    Invalid,
}

#[derive(Debug)]
pub struct CacheError {
    pub kind: CacheErrorKind,
    pub model: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheErrorKind {
    /// An intermediate record of a dotted path is not cached
    NotInCache,
    /// A value does not fit the field kind it is written to
    ShapeMismatch,
    /// The model is not registered
    UnknownModel,
    /// The field does not exist on the model
    UnknownField,
    /// Pending inserts reference each other through foreign keys
    DependencyCycle,
}

/// The database and the cache disagree; never retried.
#[derive(Debug)]
pub struct ConsistencyError {
    pub model: String,
    pub id: i64,
    pub message: String,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Build the error a driver reports for SQLSTATE 40001.
    pub fn serialization_failure(message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind: QueryErrorKind::Serialization,
            sql: None,
            sqlstate: Some(SQLSTATE_SERIALIZATION_FAILURE.to_string()),
            message: message.into(),
            source: None,
        })
    }

    /// Whether this is a serialization conflict that warrants restarting
    /// the whole transaction.
    pub fn is_serialization_failure(&self) -> bool {
        match self {
            Error::Query(q) => {
                q.kind == QueryErrorKind::Serialization
                    || q.sqlstate.as_deref() == Some(SQLSTATE_SERIALIZATION_FAILURE)
            }
            _ => false,
        }
    }

    /// Get the SQLSTATE code, if the database reported one.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    /// The cache error kind, if this is a cache error.
    pub fn cache_kind(&self) -> Option<CacheErrorKind> {
        match self {
            Error::Cache(c) => Some(c.kind),
            _ => None,
        }
    }
}

impl CacheError {
    pub fn new(kind: CacheErrorKind, model: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            model: model.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::Cache(e) => write!(f, "Cache error on '{}': {}", e.model, e.message),
            Error::Consistency(e) => {
                write!(f, "Consistency error on {}({}): {}", e.model, e.id, e.message)
            }
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl From<CacheError> for Error {
    fn from(err: CacheError) -> Self {
        Error::Cache(err)
    }
}

impl From<ConsistencyError> for Error {
    fn from(err: ConsistencyError) -> Self {
        Error::Consistency(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(ConfigError {
            message: err.to_string(),
            source: Some(Box::new(err)),
        })
    }
}

/// Result type alias for ormcache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Collapse an async `Outcome` into a `Result` inside a unit of work.
///
/// Cancellation becomes [`Error::Cancelled`]; a panic reported by the
/// runtime becomes [`Error::Custom`]. Neither is retried.
pub fn outcome_into_result<T>(outcome: Outcome<T, Error>) -> Result<T> {
    match outcome {
        Outcome::Ok(v) => Ok(v),
        Outcome::Err(e) => Err(e),
        Outcome::Cancelled(_) => Err(Error::Cancelled),
        Outcome::Panicked(p) => Err(Error::Custom(format!("panicked: {p:?}"))),
    }
}
