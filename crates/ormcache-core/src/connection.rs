//! Database connection traits.
//!
//! The cache needs very little from a driver:
//!
//! - [`Connection`] - opens a transaction at a chosen isolation level
//! - [`Cursor`] - runs INSERT (yielding the new id) and UPDATE/DELETE
//!   (yielding affected rows) inside that transaction, then commits or rolls back
//! - [`Dialect`] - placeholder and quoting rules for the statements we build
//!
//! All operations integrate with asupersync's structured concurrency via `Cx` context
//! for proper cancellation handling.

use crate::value::Value;
use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Read uncommitted: dirty reads possible.
    ReadUncommitted,

    /// Read committed: only committed changes of others are visible.
    ReadCommitted,

    /// Repeatable read: a consistent snapshot for the whole transaction.
    RepeatableRead,

    /// Serializable: transactions appear to execute sequentially, at the cost
    /// of serialization failures the caller must retry.
    #[default]
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL syntax for this isolation level.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// SQL dialect spoken by a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// `$1` placeholders, `RETURNING` for generated ids.
    #[default]
    Postgres,
    /// `?1` placeholders.
    Sqlite,
    /// `?` placeholders, backtick quoting.
    Mysql,
}

impl Dialect {
    /// Bind placeholder for the 1-based parameter `index`.
    #[must_use]
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier, doubling embedded quote characters.
    #[must_use]
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Mysql => format!("`{}`", name.replace('`', "``")),
            Dialect::Postgres | Dialect::Sqlite => format!("\"{}\"", name.replace('"', "\"\"")),
        }
    }

    /// Whether an INSERT must say `RETURNING` to report the generated id.
    #[must_use]
    pub const fn needs_returning(self) -> bool {
        matches!(self, Dialect::Postgres)
    }
}

/// A database connection able to open transactions.
///
/// Implementations must be `Send + Sync` for use across async boundaries.
pub trait Connection: Send + Sync {
    /// The transaction type returned by this connection.
    type Tx<'conn>: Cursor
    where
        Self: 'conn;

    /// Begin a transaction with a specific isolation level.
    fn begin_with(
        &self,
        cx: &Cx,
        isolation: IsolationLevel,
    ) -> impl Future<Output = Outcome<Self::Tx<'_>, crate::Error>> + Send;
}

/// An open transaction.
///
/// Dropping a cursor without calling [`commit`](Cursor::commit) or
/// [`rollback`](Cursor::rollback) must roll the transaction back.
pub trait Cursor: Send {
    /// SQL dialect used to build statements for this cursor.
    fn dialect(&self) -> Dialect;

    /// Execute a statement (UPDATE, DELETE, link-table INSERT) and return rows affected.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    /// Execute an INSERT and return the id of the new row.
    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, crate::Error>> + Send;

    /// Commit the transaction, making all changes permanent.
    fn commit(self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Rollback the transaction, discarding all changes.
    fn rollback(self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;
}
