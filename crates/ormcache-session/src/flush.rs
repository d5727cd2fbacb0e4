//! Flush operation ordering and statement building.
//!
//! A flush writes the cache back in three steps:
//! - INSERT placeholders, dependencies first (a record is inserted after
//!   every not-yet-inserted record its foreign keys point at)
//! - UPDATE dirty fields of persisted records (any order)
//! - rewrite link table rows of touched many-to-many fields
//!
//! This module plans the insert order and builds the statements; the
//! [`Environment`](crate::Environment) executes them.

use crate::cache::{Cache, CacheRef};
use asupersync::{Cx, Outcome};
use ormcache_core::{
    CacheError, CacheErrorKind, Cursor, Dialect, Error, ID_FIELD, LinkTableInfo, Result, Value,
};
use std::collections::HashSet;

/// A SQL statement with its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// A pending row write.
#[derive(Debug, Clone)]
pub enum PendingOp {
    /// Insert a new row.
    Insert {
        /// Record being inserted (a placeholder).
        record: CacheRef,
        /// Table name.
        table: &'static str,
        /// Column names.
        columns: Vec<&'static str>,
        /// Values to insert.
        values: Vec<Value>,
    },
    /// Update an existing row.
    Update {
        /// Record being updated (a persisted reference).
        record: CacheRef,
        /// Table name.
        table: &'static str,
        /// Columns to update (only dirty ones).
        set_columns: Vec<&'static str>,
        /// New values for dirty columns.
        set_values: Vec<Value>,
    },
}

impl PendingOp {
    /// Get the table name for this operation.
    pub fn table(&self) -> &'static str {
        match self {
            PendingOp::Insert { table, .. } | PendingOp::Update { table, .. } => table,
        }
    }

    /// Get the record this operation writes.
    pub fn record(&self) -> CacheRef {
        match self {
            PendingOp::Insert { record, .. } | PendingOp::Update { record, .. } => *record,
        }
    }

    /// Render the operation for `dialect`.
    pub fn to_statement(&self, dialect: Dialect) -> Statement {
        match self {
            PendingOp::Insert {
                table,
                columns,
                values,
                ..
            } => {
                let table = dialect.quote_identifier(table);
                let mut sql = if columns.is_empty() {
                    match dialect {
                        Dialect::Mysql => format!("INSERT INTO {} () VALUES ()", table),
                        Dialect::Postgres | Dialect::Sqlite => {
                            format!("INSERT INTO {} DEFAULT VALUES", table)
                        }
                    }
                } else {
                    let col_list = columns
                        .iter()
                        .map(|c| dialect.quote_identifier(c))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let placeholders = (1..=columns.len())
                        .map(|i| dialect.placeholder(i))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("INSERT INTO {} ({}) VALUES ({})", table, col_list, placeholders)
                };
                if dialect.needs_returning() {
                    sql.push_str(&format!(" RETURNING {}", dialect.quote_identifier(ID_FIELD)));
                }
                Statement {
                    sql,
                    params: values.clone(),
                }
            }
            PendingOp::Update {
                record,
                table,
                set_columns,
                set_values,
            } => {
                let set_clause = set_columns
                    .iter()
                    .enumerate()
                    .map(|(i, c)| {
                        format!("{} = {}", dialect.quote_identifier(c), dialect.placeholder(i + 1))
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "UPDATE {} SET {} WHERE {} = {}",
                    dialect.quote_identifier(table),
                    set_clause,
                    dialect.quote_identifier(ID_FIELD),
                    dialect.placeholder(set_columns.len() + 1)
                );
                let mut params = set_values.clone();
                params.push(Value::BigInt(record.id));
                Statement { sql, params }
            }
        }
    }
}

/// A pending link table operation (for many-to-many relationships).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTableOp {
    /// Delete every link row of one record.
    Clear {
        /// Link table name.
        table: &'static str,
        /// Column holding the owning record's id.
        column: &'static str,
        /// Owning record id.
        value: i64,
    },
    /// Insert one link row.
    Link {
        /// Link table name.
        table: &'static str,
        /// Owning column name.
        our_column: &'static str,
        /// Owning record id.
        our_value: i64,
        /// Related column name.
        their_column: &'static str,
        /// Related record id.
        their_value: i64,
    },
}

impl LinkTableOp {
    /// Operations replacing the link rows of `ours` with exactly `theirs`.
    pub fn replace(link: &LinkTableInfo, ours: i64, theirs: &[i64]) -> Vec<Self> {
        let mut ops = Vec::with_capacity(theirs.len() + 1);
        ops.push(LinkTableOp::Clear {
            table: link.table_name,
            column: link.our_column,
            value: ours,
        });
        ops.extend(theirs.iter().map(|&their_value| LinkTableOp::Link {
            table: link.table_name,
            our_column: link.our_column,
            our_value: ours,
            their_column: link.their_column,
            their_value,
        }));
        ops
    }

    /// Get the table name.
    pub fn table(&self) -> &'static str {
        match self {
            LinkTableOp::Clear { table, .. } | LinkTableOp::Link { table, .. } => table,
        }
    }

    /// Check if this is a link (insert) operation.
    pub fn is_link(&self) -> bool {
        matches!(self, LinkTableOp::Link { .. })
    }

    /// Render the operation for `dialect`.
    pub fn to_statement(&self, dialect: Dialect) -> Statement {
        match self {
            LinkTableOp::Clear {
                table,
                column,
                value,
            } => Statement {
                sql: format!(
                    "DELETE FROM {} WHERE {} = {}",
                    dialect.quote_identifier(table),
                    dialect.quote_identifier(column),
                    dialect.placeholder(1)
                ),
                params: vec![Value::BigInt(*value)],
            },
            LinkTableOp::Link {
                table,
                our_column,
                our_value,
                their_column,
                their_value,
            } => Statement {
                sql: format!(
                    "INSERT INTO {} ({}, {}) VALUES ({}, {})",
                    dialect.quote_identifier(table),
                    dialect.quote_identifier(our_column),
                    dialect.quote_identifier(their_column),
                    dialect.placeholder(1),
                    dialect.placeholder(2)
                ),
                params: vec![Value::BigInt(*our_value), Value::BigInt(*their_value)],
            },
        }
    }

    /// Execute this link table operation.
    #[tracing::instrument(level = "debug", skip(cx, cursor))]
    pub async fn execute<T: Cursor>(&self, cx: &Cx, cursor: &T) -> Outcome<u64, Error> {
        let stmt = self.to_statement(cursor.dialect());
        tracing::trace!(sql = %stmt.sql, "Executing link table statement");
        cursor.execute(cx, &stmt.sql, &stmt.params).await
    }
}

/// Execute a batch of link table operations, returning how many links were written.
#[tracing::instrument(level = "debug", skip(cx, cursor, ops))]
pub async fn execute_link_table_ops<T: Cursor>(
    cx: &Cx,
    cursor: &T,
    ops: &[LinkTableOp],
) -> Outcome<usize, Error> {
    let mut linked = 0;
    for op in ops {
        match op.execute(cx, cursor).await {
            Outcome::Ok(_) => {
                if op.is_link() {
                    linked += 1;
                }
            }
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
    }
    Outcome::Ok(linked)
}

/// Not-yet-inserted records that `r`'s foreign keys point at.
pub fn insert_dependencies(cache: &Cache, r: CacheRef) -> Vec<CacheRef> {
    cache
        .stored_values(r)
        .into_iter()
        .filter(|(fi, _)| fi.kind.is_fk_relation())
        .filter_map(|(fi, value)| Some(CacheRef::new(fi.related_model?, value.as_i64()?)))
        .filter(|dep| cache.is_not_in_db(*dep))
        .collect()
}

/// Orders placeholder inserts so that dependencies come first.
///
/// Depth-first walk over foreign keys. A record reached again while it is
/// still on the walk stack closes a cycle, which cannot be inserted and is
/// reported before any statement runs.
#[derive(Debug)]
pub struct InsertPlanner<'a> {
    cache: &'a Cache,
    visited: HashSet<CacheRef>,
    stack: Vec<CacheRef>,
    order: Vec<CacheRef>,
}

impl<'a> InsertPlanner<'a> {
    pub fn new(cache: &'a Cache) -> Self {
        Self {
            cache,
            visited: HashSet::new(),
            stack: Vec::new(),
            order: Vec::new(),
        }
    }

    /// Insert order covering `roots` and everything they depend on.
    ///
    /// Records already in the database are left out.
    pub fn plan(mut self, roots: &[CacheRef]) -> Result<Vec<CacheRef>> {
        for &root in roots {
            if self.cache.is_not_in_db(root) {
                self.visit(root)?;
            }
        }
        Ok(self.order)
    }

    fn visit(&mut self, r: CacheRef) -> Result<()> {
        if self.visited.contains(&r) {
            return Ok(());
        }
        if let Some(pos) = self.stack.iter().position(|s| *s == r) {
            let chain = self.stack[pos..]
                .iter()
                .chain(std::iter::once(&r))
                .map(ToString::to_string)
                .collect::<Vec<_>>();
            return Err(CacheError::new(
                CacheErrorKind::DependencyCycle,
                r.model,
                format!("insert dependency cycle: {}", chain.join(" -> ")),
            )
            .into());
        }

        self.stack.push(r);
        for dep in insert_dependencies(self.cache, r) {
            self.visit(dep)?;
        }
        self.stack.pop();
        self.visited.insert(r);
        self.order.push(r);
        Ok(())
    }
}

/// Result of a flush operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of rows updated.
    pub updated: usize,
    /// Number of link rows written.
    pub linked: usize,
}

impl FlushResult {
    /// Create a new empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of operations performed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.linked
    }
}
