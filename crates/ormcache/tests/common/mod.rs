//! Shared fixtures: an in-memory mock database and a small model set.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

use ormcache::prelude::*;
use ormcache::{Dialect, QueryError, QueryErrorKind};

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}

pub fn fields(entries: &[(&str, Value)]) -> FieldMap {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

// ==================== Models ====================

static CUSTOMER_FIELDS: [FieldInfo; 3] = [
    FieldInfo::scalar("name"),
    FieldInfo::one2many("orders", "order", "customer"),
    FieldInfo::many2many(
        "tags",
        "tag",
        LinkTableInfo::new("customer_tag_rel", "customer_id", "tag_id"),
    ),
];
pub static CUSTOMER: ModelInfo = ModelInfo::new("customer", "customer", &CUSTOMER_FIELDS);

static ORDER_FIELDS: [FieldInfo; 2] = [
    FieldInfo::scalar("amount"),
    FieldInfo::many2one("customer", "customer").column("customer_id"),
];
pub static ORDER: ModelInfo = ModelInfo::new("order", "sale_order", &ORDER_FIELDS);

static TAG_FIELDS: [FieldInfo; 2] = [
    FieldInfo::scalar("name"),
    FieldInfo::many2many(
        "customers",
        "customer",
        LinkTableInfo::new("customer_tag_rel", "tag_id", "customer_id"),
    ),
];
pub static TAG: ModelInfo = ModelInfo::new("tag", "tag", &TAG_FIELDS);

static NODE_FIELDS: [FieldInfo; 2] = [
    FieldInfo::scalar("label"),
    FieldInfo::many2one("parent", "node").column("parent_id"),
];
pub static NODE: ModelInfo = ModelInfo::new("node", "node", &NODE_FIELDS);

pub fn registry() -> Arc<Registry> {
    Arc::new(Registry::from_models(&[&CUSTOMER, &ORDER, &TAG, &NODE]).expect("valid models"))
}

// ==================== Mock database ====================

#[derive(Debug, Default)]
pub struct MockState {
    next_id: HashMap<String, i64>,
    /// Committed rows
    rows: HashSet<(String, i64)>,
    /// Every statement in execution order, including COMMIT and ROLLBACK
    pub log: Vec<(String, Vec<Value>)>,
    pub begins: Vec<IsolationLevel>,
    pub commits: usize,
    pub rollbacks: usize,
    commit_failures: u32,
    failing_sql: Option<String>,
}

/// Hands out ids per table and remembers which rows exist, so an UPDATE of
/// an unknown row affects nothing. Rows inserted by a transaction become
/// visible to others only once it commits; ids are never reused, like a
/// database sequence.
#[derive(Debug, Clone, Default)]
pub struct MockDb {
    pub state: Arc<Mutex<MockState>>,
}

impl MockDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("lock poisoned")
    }

    /// Pretend a row already exists.
    pub fn seed(&self, table: &str, id: i64) {
        let mut state = self.lock();
        state.rows.insert((table.to_string(), id));
        let next = state.next_id.entry(table.to_string()).or_insert(0);
        *next = (*next).max(id);
    }

    /// Make the next `n` commits fail with a serialization failure.
    pub fn fail_commits(&self, n: u32) {
        self.lock().commit_failures = n;
    }

    /// Make every statement containing `needle` fail with a syntax error.
    pub fn fail_sql(&self, needle: &str) {
        self.lock().failing_sql = Some(needle.to_string());
    }

    pub fn statements(&self) -> Vec<String> {
        self.lock().log.iter().map(|(sql, _)| sql.clone()).collect()
    }

    /// Statements starting with `prefix`, with their parameters.
    pub fn statements_like(&self, prefix: &str) -> Vec<(String, Vec<Value>)> {
        self.lock()
            .log
            .iter()
            .filter(|(sql, _)| sql.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Committed row ids of `table`, sorted.
    pub fn rows(&self, table: &str) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .lock()
            .rows
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, id)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn begins(&self) -> usize {
        self.lock().begins.len()
    }

    pub fn commits(&self) -> usize {
        self.lock().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.lock().rollbacks
    }
}

fn table_of(sql: &str) -> String {
    sql.split('"').nth(1).unwrap_or_default().to_string()
}

impl MockState {
    fn record(&mut self, sql: &str, params: &[Value]) -> Result<()> {
        self.log.push((sql.to_string(), params.to_vec()));
        match &self.failing_sql {
            Some(needle) if sql.contains(needle.as_str()) => Err(Error::Query(QueryError {
                kind: QueryErrorKind::Syntax,
                sql: Some(sql.to_string()),
                sqlstate: Some("42601".to_string()),
                message: "injected failure".to_string(),
                source: None,
            })),
            _ => Ok(()),
        }
    }
}

impl Connection for MockDb {
    type Tx<'conn>
        = MockTx
    where
        Self: 'conn;

    fn begin_with(
        &self,
        _cx: &Cx,
        isolation: IsolationLevel,
    ) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            state.lock().expect("lock poisoned").begins.push(isolation);
            Outcome::Ok(MockTx {
                state,
                written: Arc::new(Mutex::new(HashSet::new())),
            })
        }
    }
}

pub struct MockTx {
    state: Arc<Mutex<MockState>>,
    /// Rows inserted by this transaction, not yet committed
    written: Arc<Mutex<HashSet<(String, i64)>>>,
}

impl Cursor for MockTx {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let state = Arc::clone(&self.state);
        let written = Arc::clone(&self.written);
        let sql = sql.to_string();
        let params = params.to_vec();
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            if let Err(e) = guard.record(&sql, &params) {
                return Outcome::Err(e);
            }
            if sql.starts_with("UPDATE") {
                let id = params.last().and_then(Value::as_i64).unwrap_or_default();
                let key = (table_of(&sql), id);
                let found = guard.rows.contains(&key)
                    || written.lock().expect("lock poisoned").contains(&key);
                return Outcome::Ok(u64::from(found));
            }
            Outcome::Ok(1)
        }
    }

    fn insert(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        let state = Arc::clone(&self.state);
        let written = Arc::clone(&self.written);
        let sql = sql.to_string();
        let params = params.to_vec();
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            if let Err(e) = guard.record(&sql, &params) {
                return Outcome::Err(e);
            }
            let table = table_of(&sql);
            let next = guard.next_id.entry(table.clone()).or_insert(0);
            *next += 1;
            let id = *next;
            written.lock().expect("lock poisoned").insert((table, id));
            Outcome::Ok(id)
        }
    }

    fn commit(self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            let mut guard = self.state.lock().expect("lock poisoned");
            guard.log.push(("COMMIT".to_string(), Vec::new()));
            if guard.commit_failures > 0 {
                guard.commit_failures -= 1;
                return Outcome::Err(Error::serialization_failure(
                    "could not serialize access due to concurrent update",
                ));
            }
            guard.commits += 1;
            let written = std::mem::take(&mut *self.written.lock().expect("lock poisoned"));
            guard.rows.extend(written);
            Outcome::Ok(())
        }
    }

    fn rollback(self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            let mut guard = self.state.lock().expect("lock poisoned");
            guard.log.push(("ROLLBACK".to_string(), Vec::new()));
            guard.rollbacks += 1;
            Outcome::Ok(())
        }
    }
}
