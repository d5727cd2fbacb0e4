//! One unit of work: an open transaction and the cache in front of it.

use crate::cache::{Cache, CacheRef, FieldMap};
use crate::config::{Context, EnvironmentConfig};
use crate::flush::{FlushResult, InsertPlanner, LinkTableOp, PendingOp, execute_link_table_ops};
use asupersync::{Cx, Outcome};
use ormcache_core::{
    ConsistencyError, Cursor, Error, FieldInfo, ID_FIELD, Registry, Result, Value,
};
use std::sync::Arc;

/// Owns a cursor and a fresh [`Cache`] for the duration of one transaction.
///
/// Records created through [`create`](Self::create) receive placeholder ids
/// from a counter owned by the environment (-1, -2, ...). Nothing reaches the
/// database until [`flush`](Self::flush) or [`commit`](Self::commit).
pub struct Environment<T: Cursor> {
    cursor: T,
    cache: Cache,
    uid: i64,
    context: Context,
    attempt: u32,
    last_placeholder: i64,
}

impl<T: Cursor> Environment<T> {
    /// Wrap an open transaction.
    pub fn new(cursor: T, registry: Arc<Registry>, config: &EnvironmentConfig) -> Self {
        Self {
            cursor,
            cache: Cache::new(registry),
            uid: config.uid,
            context: config.context.clone(),
            attempt: 1,
            last_placeholder: 0,
        }
    }

    pub(crate) fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Id of the acting user.
    pub fn uid(&self) -> i64 {
        self.uid
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    /// 1 for the first run of a unit of work, incremented on every retry.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut Cache {
        &mut self.cache
    }

    pub fn cursor(&self) -> &T {
        &self.cursor
    }

    fn next_placeholder_id(&mut self) -> i64 {
        self.last_placeholder -= 1;
        self.last_placeholder
    }

    /// Create a record that exists only in the cache until the next flush.
    pub fn create(&mut self, model: &str, data: FieldMap) -> Result<CacheRef> {
        let model = self.cache.registry().require(model)?.name;
        let r = CacheRef::new(model, self.next_placeholder_id());
        self.cache.schedule_insert(r);
        for (field, value) in data {
            if field == ID_FIELD {
                continue;
            }
            self.cache.update_entry_by_ref(r, &field, value)?;
        }
        tracing::debug!(record = %r, "Created record in cache");
        Ok(r)
    }

    /// Cache a row read from the database without marking anything dirty.
    pub fn load(&mut self, model: &str, id: i64, data: FieldMap) -> Result<CacheRef> {
        let r = self.cache.cache_ref(model, id)?;
        self.cache.init_with_data(r, data)?;
        Ok(r)
    }

    /// Read a cached value by dotted path.
    pub fn get(&self, model: &str, id: i64, path: &str) -> Option<Value> {
        self.cache.get(model, id, path)
    }

    /// Write a value by dotted path relative to `r`.
    pub fn set(&mut self, r: CacheRef, path: &str, value: impl Into<Value>) -> Result<()> {
        self.cache.update_entry(r.model, r.id, path, value.into())
    }

    /// Insert `r` and every placeholder it depends on; return its database
    /// reference.
    ///
    /// A reference already in the database is returned as is, without a
    /// statement.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn insert_data(&mut self, cx: &Cx, r: CacheRef) -> Outcome<CacheRef, Error> {
        if self.cache.is_in_db(r) {
            return Outcome::Ok(self.cache.resolve(r));
        }
        let plan = match InsertPlanner::new(&self.cache).plan(&[r]) {
            Ok(plan) => plan,
            Err(e) => return Outcome::Err(e),
        };
        for record in plan {
            match self.insert_one(cx, record).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(reason) => return Outcome::Cancelled(reason),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(self.cache.resolve(r))
    }

    async fn insert_one(&mut self, cx: &Cx, r: CacheRef) -> Outcome<CacheRef, Error> {
        let info = match self.cache.registry().require(r.model) {
            Ok(info) => info,
            Err(e) => return Outcome::Err(e),
        };
        let mut columns = Vec::new();
        let mut values = Vec::new();
        for (fi, value) in self.cache.stored_values(r) {
            match self.resolve_foreign_key(r, fi, value) {
                Ok(value) => {
                    columns.push(fi.column_name);
                    values.push(value);
                }
                Err(e) => return Outcome::Err(e),
            }
        }

        let op = PendingOp::Insert {
            record: r,
            table: info.table_name,
            columns,
            values,
        };
        let stmt = op.to_statement(self.cursor.dialect());
        tracing::trace!(sql = %stmt.sql, "Executing INSERT");
        let id = match self.cursor.insert(cx, &stmt.sql, &stmt.params).await {
            Outcome::Ok(id) => id,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(reason) => return Outcome::Cancelled(reason),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let real = CacheRef::new(r.model, id);
        self.cache.promote(r, real);
        Outcome::Ok(real)
    }

    /// Point a foreign key value at the database id of its target.
    fn resolve_foreign_key(&mut self, r: CacheRef, fi: &FieldInfo, value: Value) -> Result<Value> {
        if !fi.kind.is_fk_relation() {
            return Ok(value);
        }
        let (Some(related), Some(id)) = (fi.related_model, value.as_i64()) else {
            return Ok(value);
        };
        let target = CacheRef::new(related, id);
        if self.cache.is_not_in_db(target) {
            return Err(Error::Consistency(ConsistencyError {
                model: r.model.to_string(),
                id: r.id,
                message: format!("{} points at {}, which was never inserted", fi.name, target),
            }));
        }
        let real = self.cache.resolve(target);
        if real.id != id {
            self.cache.set_raw(r, fi.name, Value::BigInt(real.id));
        }
        Ok(Value::BigInt(real.id))
    }

    /// Placeholders the flush must insert: scheduled ones plus any still
    /// referenced by pending updates or link syncs.
    fn insert_roots(&self) -> Vec<CacheRef> {
        let registry = self.cache.registry();
        let mut roots = self.cache.pending_inserts();
        for (r, fields) in self.cache.pending_updates() {
            for name in fields {
                let Ok(fi) = registry.field(r.model, name) else {
                    continue;
                };
                if !fi.kind.is_fk_relation() {
                    continue;
                }
                let id = self.cache.raw(r, name).and_then(Value::as_i64);
                if let (Some(related), Some(id)) = (fi.related_model, id) {
                    let target = CacheRef::new(related, id);
                    if self.cache.is_not_in_db(target) {
                        roots.push(target);
                    }
                }
            }
        }
        for (r, field) in self.cache.pending_link_syncs() {
            if self.cache.is_not_in_db(r) {
                roots.push(r);
            }
            let Ok(fi) = registry.field(r.model, field) else {
                continue;
            };
            let (Some(related), Some(link)) = (fi.related_model, fi.link) else {
                continue;
            };
            for id in self.cache.linked_ids(r, &link) {
                let target = CacheRef::new(related, id);
                if self.cache.is_not_in_db(target) {
                    roots.push(target);
                }
            }
        }
        roots
    }

    fn update_op(&mut self, r: CacheRef, fields: &[&'static str]) -> Result<Option<PendingOp>> {
        let info = self.cache.registry().require(r.model)?;
        let mut set_columns = Vec::new();
        let mut set_values = Vec::new();
        for &name in fields {
            let Some(fi) = info.field(name) else {
                continue;
            };
            if !fi.kind.is_stored() {
                continue;
            }
            let Some(value) = self.cache.raw(r, name).cloned() else {
                continue;
            };
            set_values.push(self.resolve_foreign_key(r, fi, value)?);
            set_columns.push(fi.column_name);
        }
        if set_columns.is_empty() {
            return Ok(None);
        }
        Ok(Some(PendingOp::Update {
            record: r,
            table: info.table_name,
            set_columns,
            set_values,
        }))
    }

    fn link_ops(&self, r: CacheRef, field: &str) -> Result<Vec<LinkTableOp>> {
        let fi = self.cache.registry().field(r.model, field)?;
        let Some(link) = fi.link else {
            return Ok(Vec::new());
        };
        let ours = self.cache.resolve(r);
        let theirs = self.cache.linked_ids(ours, &link);
        if ours.is_placeholder() || theirs.iter().any(|&id| id <= 0) {
            return Err(Error::Consistency(ConsistencyError {
                model: r.model.to_string(),
                id: r.id,
                message: format!("links of {} reference records that were never inserted", field),
            }));
        }
        Ok(LinkTableOp::replace(&link, ours.id, &theirs))
    }

    /// Write every pending change to the database.
    ///
    /// Inserts run dependencies first, then dirty fields are updated, then
    /// link tables are rewritten. An UPDATE that matches no row is a
    /// [`Error::Consistency`] failure.
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        let start = std::time::Instant::now();
        let mut result = FlushResult::new();
        let dialect = self.cursor.dialect();

        // 1. Inserts, dependencies first
        let roots = self.insert_roots();
        let plan = match InsertPlanner::new(&self.cache).plan(&roots) {
            Ok(plan) => plan,
            Err(e) => return Outcome::Err(e),
        };
        for r in plan {
            match self.insert_one(cx, r).await {
                Outcome::Ok(_) => result.inserted += 1,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(reason) => return Outcome::Cancelled(reason),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        // 2. Updates (dirty fields only)
        for (r, fields) in self.cache.pending_updates() {
            let op = match self.update_op(r, &fields) {
                Ok(Some(op)) => op,
                Ok(None) => continue,
                Err(e) => return Outcome::Err(e),
            };
            let stmt = op.to_statement(dialect);
            tracing::trace!(sql = %stmt.sql, "Executing UPDATE");
            match self.cursor.execute(cx, &stmt.sql, &stmt.params).await {
                Outcome::Ok(0) => {
                    tracing::warn!(record = %r, "UPDATE matched no row");
                    return Outcome::Err(Error::Consistency(ConsistencyError {
                        model: r.model.to_string(),
                        id: r.id,
                        message: format!("UPDATE of {} matched no row", fields.join(", ")),
                    }));
                }
                Outcome::Ok(_) => result.updated += 1,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(reason) => return Outcome::Cancelled(reason),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        self.cache.clear_scheduled_updates();

        // 3. Link tables
        for (r, field) in self.cache.pending_link_syncs() {
            let ops = match self.link_ops(r, field) {
                Ok(ops) => ops,
                Err(e) => return Outcome::Err(e),
            };
            match execute_link_table_ops(cx, &self.cursor, &ops).await {
                Outcome::Ok(count) => result.linked += count,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(reason) => return Outcome::Cancelled(reason),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        self.cache.clear_link_syncs();

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            inserted = result.inserted,
            updated = result.updated,
            linked = result.linked,
            "Flush complete"
        );
        Outcome::Ok(result)
    }

    /// Flush, then commit the transaction.
    ///
    /// A failed flush rolls the transaction back before the error is returned.
    #[tracing::instrument(level = "info", skip(self, cx), fields(attempt = self.attempt))]
    pub async fn commit(mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        let result = match self.flush(cx).await {
            Outcome::Ok(result) => result,
            Outcome::Err(e) => {
                self.discard(cx).await;
                return Outcome::Err(e);
            }
            Outcome::Cancelled(reason) => return Outcome::Cancelled(reason),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match self.cursor.commit(cx).await {
            Outcome::Ok(()) => {
                tracing::info!(total = result.total(), "Transaction committed");
                Outcome::Ok(result)
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(reason) => Outcome::Cancelled(reason),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Roll the transaction back, discarding the cache.
    #[tracing::instrument(level = "info", skip(self, cx), fields(attempt = self.attempt))]
    pub async fn rollback(self, cx: &Cx) -> Outcome<(), Error> {
        self.cursor.rollback(cx).await
    }

    /// Roll back, logging instead of returning a rollback failure.
    pub(crate) async fn discard(self, cx: &Cx) {
        match self.rollback(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => tracing::warn!(error = %e, "Rollback failed"),
            Outcome::Cancelled(reason) => tracing::warn!(?reason, "Rollback cancelled"),
            Outcome::Panicked(p) => tracing::warn!(panic = ?p, "Rollback panicked"),
        }
    }
}
