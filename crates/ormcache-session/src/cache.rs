//! Transaction-scoped record cache.
//!
//! The cache is an identity map from [`CacheRef`] to a [`FieldMap`], plus the
//! bookkeeping a flush needs:
//!
//! - scheduled inserts: placeholder references waiting for a database id
//! - scheduled updates: per-record sets of dirty field names
//! - link syncs: many-to-many fields whose link table rows must be rewritten
//!
//! Storage is an arena of slots with a key index on top. Promoting a
//! placeholder points its real reference at the same slot, so reads and
//! writes through either key observe one value.
//!
//! One-to-many, reverse one-to-one and many-to-many values are never read
//! from a slot; they are computed from the current contents of the cache.

use crate::links::LinkTable;
use ormcache_core::{
    CacheError, CacheErrorKind, Error, FieldInfo, FieldKind, ID_FIELD, LinkTableInfo, ModelInfo,
    Registry, Result, SchemaError, SchemaErrorKind, Value,
};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Separator of dotted field paths (`"customer.profile.age"`).
pub const PATH_SEPARATOR: char = '.';

/// Key of a cached record.
///
/// A positive id is a database row; zero or a negative id is a placeholder
/// for a record that has not been inserted yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheRef {
    pub model: &'static str,
    pub id: i64,
}

impl CacheRef {
    #[must_use]
    pub const fn new(model: &'static str, id: i64) -> Self {
        Self { model, id }
    }

    #[must_use]
    pub const fn is_placeholder(&self) -> bool {
        self.id <= 0
    }
}

impl fmt::Display for CacheRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.model, self.id)
    }
}

/// Known field values of one record, keyed by field name.
pub type FieldMap = BTreeMap<String, Value>;

/// Identity map plus scheduled operations for one transaction.
#[derive(Debug)]
pub struct Cache {
    registry: Arc<Registry>,
    slots: Vec<FieldMap>,
    index: HashMap<CacheRef, usize>,
    links: LinkTable,
    /// `None` until inserted, then the promoted reference.
    scheduled_insert: HashMap<CacheRef, Option<CacheRef>>,
    scheduled_update: HashMap<CacheRef, BTreeSet<&'static str>>,
    link_syncs: BTreeSet<(CacheRef, &'static str)>,
}

impl Cache {
    /// Create an empty cache over the given models.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            slots: Vec::new(),
            index: HashMap::new(),
            links: LinkTable::new(),
            scheduled_insert: HashMap::new(),
            scheduled_update: HashMap::new(),
            link_syncs: BTreeSet::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Build a reference for a registered model.
    pub fn cache_ref(&self, model: &str, id: i64) -> Result<CacheRef> {
        Ok(CacheRef::new(self.registry.require(model)?.name, id))
    }

    /// Whether `r` has an entry.
    pub fn contains(&self, r: CacheRef) -> bool {
        self.index.contains_key(&r)
    }

    /// Number of keys (an aliased record counts once per key).
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn slot_index(&mut self, r: CacheRef) -> usize {
        if let Some(&idx) = self.index.get(&r) {
            return idx;
        }
        self.slots.push(FieldMap::new());
        let idx = self.slots.len() - 1;
        self.index.insert(r, idx);
        idx
    }

    fn snapshot(&self, r: CacheRef, idx: usize) -> FieldMap {
        let mut data = self.slots[idx].clone();
        data.insert(ID_FIELD.to_string(), Value::BigInt(r.id));
        data
    }

    /// Field map of `r`, created with only its id if absent.
    pub fn get_data(&mut self, r: CacheRef) -> FieldMap {
        let idx = self.slot_index(r);
        self.snapshot(r, idx)
    }

    /// Replace everything known about `r` with `data`.
    ///
    /// Nothing is marked dirty. Relation fields are routed the same way as
    /// [`update_entry`](Self::update_entry) routes them, so many-to-many ids
    /// land in the link table and one-to-many ids on the targets.
    pub fn init_with_data(&mut self, r: CacheRef, data: FieldMap) -> Result<()> {
        let info = self.registry.require(r.model)?;
        let mut fields = Vec::with_capacity(data.len());
        for (name, value) in data {
            if name == ID_FIELD {
                continue;
            }
            let fi = field_of(info, &name)?;
            check_shape(r, fi, &value)?;
            fields.push((fi, value));
        }

        let idx = self.slot_index(r);
        self.slots[idx].clear();
        for (fi, value) in fields {
            self.write(r, fi, value, false)?;
        }
        Ok(())
    }

    /// Write `value` at the dotted `path` starting from `model(id)`.
    ///
    /// Every intermediate foreign key must already be cached; otherwise the
    /// write fails with [`CacheErrorKind::NotInCache`] and nothing changes.
    pub fn update_entry(&mut self, model: &str, id: i64, path: &str, value: Value) -> Result<()> {
        let info = self.registry.require(model)?;
        let (r, fi) = self.related_ref(info, id, path)?;
        self.write(r, fi, value, true)
    }

    /// Write a single (non-dotted) field of `r`.
    pub fn update_entry_by_ref(&mut self, r: CacheRef, field: &str, value: Value) -> Result<()> {
        let fi = self.registry.field(r.model, field)?;
        self.write(r, fi, value, true)
    }

    fn write(&mut self, r: CacheRef, fi: &'static FieldInfo, value: Value, track: bool) -> Result<()> {
        check_shape(r, fi, &value)?;
        match fi.kind {
            FieldKind::Scalar => {
                self.store(r, fi.name, value);
                if track {
                    self.mark_dirty(r, fi.name);
                }
            }
            FieldKind::Many2One | FieldKind::One2One => {
                let related = related_model(r, fi)?;
                let stored = match value.as_record_id() {
                    Some(Some(id)) => Value::BigInt(self.resolve_id(related, id)),
                    _ => Value::Null,
                };
                self.store(r, fi.name, stored);
                if track {
                    self.mark_dirty(r, fi.name);
                }
            }
            FieldKind::One2Many | FieldKind::Rev2One => {
                let related = related_model(r, fi)?;
                let Some(reverse_name) = fi.reverse_fk else {
                    return Err(missing_metadata(r, fi, "reverse foreign key"));
                };
                let reverse = self.registry.field(related, reverse_name)?;
                let targets = if fi.kind == FieldKind::One2Many {
                    value.as_id_list().unwrap_or_default()
                } else {
                    value.as_record_id().flatten().into_iter().collect()
                };
                let back = Value::BigInt(self.resolve(r).id);
                for target in targets {
                    self.write(CacheRef::new(related, target), reverse, back.clone(), track)?;
                }
                self.store(r, fi.name, Value::Bool(true));
            }
            FieldKind::Many2Many => {
                let related = related_model(r, fi)?;
                let link = link_of(r, fi)?;
                let ours = self.resolve(r);
                let theirs: Vec<i64> = value
                    .as_id_list()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|id| self.resolve_id(related, id))
                    .collect();
                self.links.replace(&link, ours.id, &theirs);
                self.store(r, fi.name, Value::Bool(true));
                if track {
                    self.link_syncs.insert((ours, fi.name));
                }
            }
        }
        tracing::trace!(record = %r, field = fi.name, "Updated cache entry");
        Ok(())
    }

    fn store(&mut self, r: CacheRef, field: &str, value: Value) {
        let idx = self.slot_index(r);
        self.slots[idx].insert(field.to_string(), value);
    }

    fn mark_dirty(&mut self, r: CacheRef, field: &'static str) {
        let canonical = self.resolve(r);
        if canonical.id > 0 {
            self.scheduled_update
                .entry(canonical)
                .or_default()
                .insert(field);
        }
    }

    /// Apply every entry of `data` to `model(id)`, shallowest path first.
    ///
    /// Paths that cannot be resolved yet are skipped.
    pub fn add_record(&mut self, model: &str, id: i64, data: FieldMap) -> Result<()> {
        let info = self.registry.require(model)?;
        let mut entries: Vec<(String, Value)> = data
            .into_iter()
            .filter(|(path, _)| path.rsplit(PATH_SEPARATOR).next() != Some(ID_FIELD))
            .collect();
        entries.sort_by_key(|(path, _)| path.split(PATH_SEPARATOR).count());

        self.slot_index(CacheRef::new(info.name, id));
        for (path, value) in entries {
            match self.update_entry(info.name, id, &path, value) {
                Ok(()) => {}
                Err(e) if e.cache_kind() == Some(CacheErrorKind::NotInCache) => {
                    tracing::debug!(
                        model = info.name,
                        id = id,
                        path = %path,
                        "Skipping path not resolvable in cache"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Read the value at the dotted `path` starting from `model(id)`.
    ///
    /// `None` means the value is not cached and must be fetched.
    pub fn get(&self, model: &str, id: i64, path: &str) -> Option<Value> {
        let info = self.registry.get(model)?;
        let (r, fi) = self.related_ref(info, id, path).ok()?;
        self.value_of(r, fi)
    }

    /// Every cached field of `model(id)` with relation fields recomputed.
    pub fn get_record(&self, model: &str, id: i64) -> Option<FieldMap> {
        let info = self.registry.get(model)?;
        let r = CacheRef::new(info.name, id);
        let &idx = self.index.get(&r)?;
        let mut record = FieldMap::new();
        for name in self.slots[idx].keys() {
            if let Some(value) = info.field(name).and_then(|fi| self.value_of(r, fi)) {
                record.insert(name.clone(), value);
            }
        }
        record.insert(ID_FIELD.to_string(), Value::BigInt(id));
        Some(record)
    }

    /// Whether every path in `fields` is cached for every persisted id.
    ///
    /// Placeholder ids are always considered complete.
    pub fn check_if_in_cache(&self, model: &str, ids: &[i64], fields: &[&str]) -> bool {
        let Some(info) = self.registry.get(model) else {
            return false;
        };
        ids.iter().filter(|&&id| id > 0).all(|&id| {
            fields.iter().all(|path| match self.related_ref(info, id, path) {
                Ok((r, fi)) => {
                    fi.name == ID_FIELD
                        || self
                            .index
                            .get(&r)
                            .is_some_and(|&idx| self.slots[idx].contains_key(fi.name))
                }
                Err(_) => false,
            })
        })
    }

    /// Split `ids` into (cached, not cached).
    pub fn partition_cached(&self, model: &str, ids: &[i64]) -> (Vec<i64>, Vec<i64>) {
        let Some(info) = self.registry.get(model) else {
            return (Vec::new(), ids.to_vec());
        };
        ids.iter()
            .copied()
            .partition(|&id| self.contains(CacheRef::new(info.name, id)))
    }

    /// Forget `model(id)`: its field map, its many-to-many links and its
    /// pending updates. A placeholder that was never inserted is also
    /// unscheduled.
    ///
    /// Relation views of other records computed by scanning stop including
    /// this record until it is loaded again.
    pub fn invalidate_record(&mut self, model: &str, id: i64) -> Result<()> {
        let info = self.registry.require(model)?;
        let key = CacheRef::new(info.name, id);
        let canonical = self.resolve(key);
        if let Some(idx) = self.index.get(&key).copied() {
            self.index.retain(|_, slot| *slot != idx);
            self.slots[idx].clear();
        }
        for fi in info.many2many_fields() {
            if let Some(link) = fi.link {
                self.links.remove_all(&link, canonical.id);
            }
        }
        self.scheduled_update.remove(&canonical);
        self.link_syncs.retain(|(r, _)| *r != canonical);
        if canonical.is_placeholder() {
            self.scheduled_insert.remove(&canonical);
        }
        tracing::debug!(record = %key, "Invalidated cached record");
        Ok(())
    }

    /// Drop one cached field of `model(id)`.
    pub fn remove_entry(&mut self, model: &str, id: i64, field: &str) -> Result<()> {
        let info = self.registry.require(model)?;
        let fi = field_of(info, field)?;
        let key = CacheRef::new(info.name, id);
        let canonical = self.resolve(key);
        if let Some(&idx) = self.index.get(&key) {
            self.slots[idx].remove(fi.name);
        }
        if fi.kind == FieldKind::Many2Many {
            if let Some(link) = fi.link {
                self.links.remove_all(&link, canonical.id);
            }
            self.link_syncs.remove(&(canonical, fi.name));
        }
        if let Some(dirty) = self.scheduled_update.get_mut(&canonical) {
            dirty.remove(fi.name);
            if dirty.is_empty() {
                self.scheduled_update.remove(&canonical);
            }
        }
        Ok(())
    }

    /// Make `to` resolve to the same slot as `from`.
    pub fn copy_pointer(&mut self, from: CacheRef, to: CacheRef) {
        let idx = self.slot_index(from);
        self.index.insert(to, idx);
    }

    /// The reference `r` was promoted to, if it has been inserted.
    pub fn promoted(&self, r: CacheRef) -> Option<CacheRef> {
        self.scheduled_insert.get(&r).copied().flatten()
    }

    /// `r` itself, or its promoted reference.
    pub fn resolve(&self, r: CacheRef) -> CacheRef {
        self.promoted(r).unwrap_or(r)
    }

    fn resolve_id(&self, model: &'static str, id: i64) -> i64 {
        self.resolve(CacheRef::new(model, id)).id
    }

    pub fn is_not_in_db(&self, r: CacheRef) -> bool {
        r.id <= 0 && self.promoted(r).is_none()
    }

    pub fn is_in_db(&self, r: CacheRef) -> bool {
        !self.is_not_in_db(r)
    }

    /// Register `r` as waiting for an INSERT.
    pub fn schedule_insert(&mut self, r: CacheRef) {
        self.slot_index(r);
        self.scheduled_insert.entry(r).or_insert(None);
    }

    /// Record that `placeholder` was inserted as `real`.
    ///
    /// Aliases the slot, then moves every link pair, pending link sync and
    /// cached foreign key that still names the placeholder id.
    pub fn promote(&mut self, placeholder: CacheRef, real: CacheRef) {
        self.copy_pointer(placeholder, real);
        self.scheduled_insert.insert(placeholder, Some(real));

        let syncs: Vec<_> = self
            .link_syncs
            .iter()
            .filter(|(r, _)| *r == placeholder)
            .copied()
            .collect();
        for (r, field) in syncs {
            self.link_syncs.remove(&(r, field));
            self.link_syncs.insert((real, field));
        }

        let mut fk_rewrites = Vec::new();
        for info in self.registry.models() {
            for fi in info.many2many_fields() {
                let Some(link) = fi.link else { continue };
                if info.name == placeholder.model {
                    self.links
                        .rewrite_id(link.table_name, link.our_index(), placeholder.id, real.id);
                }
                if fi.related_model == Some(placeholder.model) {
                    self.links
                        .rewrite_id(link.table_name, link.their_index(), placeholder.id, real.id);
                }
            }
        }
        for (key, &idx) in &self.index {
            let Some(info) = self.registry.get(key.model) else {
                continue;
            };
            for fi in info.fields.iter().filter(|f| {
                f.kind.is_fk_relation() && f.related_model == Some(placeholder.model)
            }) {
                if self.slots[idx].get(fi.name).and_then(Value::as_i64) == Some(placeholder.id) {
                    fk_rewrites.push((idx, fi.name));
                }
            }
        }
        for (idx, field) in fk_rewrites {
            self.slots[idx].insert(field.to_string(), Value::BigInt(real.id));
        }
        tracing::debug!(placeholder = %placeholder, real = %real, "Promoted placeholder record");
    }

    /// Placeholders still waiting for an INSERT, in creation order.
    pub fn pending_inserts(&self) -> Vec<CacheRef> {
        let mut refs: Vec<CacheRef> = self
            .scheduled_insert
            .iter()
            .filter(|(_, promoted)| promoted.is_none())
            .map(|(r, _)| *r)
            .collect();
        refs.sort_by_key(|r| (Reverse(r.id), r.model));
        refs
    }

    /// Records with dirty fields, sorted by reference.
    pub fn pending_updates(&self) -> Vec<(CacheRef, Vec<&'static str>)> {
        let mut updates: Vec<_> = self
            .scheduled_update
            .iter()
            .map(|(r, fields)| (*r, fields.iter().copied().collect()))
            .collect();
        updates.sort_by_key(|(r, _)| *r);
        updates
    }

    /// Dirty field names of `r`.
    pub fn dirty_fields(&self, r: CacheRef) -> Vec<&'static str> {
        self.scheduled_update
            .get(&self.resolve(r))
            .map(|fields| fields.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn clear_scheduled_updates(&mut self) {
        self.scheduled_update.clear();
    }

    /// Many-to-many fields whose link rows must be rewritten.
    pub fn pending_link_syncs(&self) -> Vec<(CacheRef, &'static str)> {
        self.link_syncs.iter().copied().collect()
    }

    pub fn clear_link_syncs(&mut self) {
        self.link_syncs.clear();
    }

    /// Ids currently linked to `r` through `link`.
    pub fn linked_ids(&self, r: CacheRef, link: &LinkTableInfo) -> Vec<i64> {
        self.links.linked(link, self.resolve(r).id)
    }

    /// Stored value of a single field, without recomputing relations.
    pub fn raw(&self, r: CacheRef, field: &str) -> Option<&Value> {
        self.index
            .get(&r)
            .and_then(|&idx| self.slots[idx].get(field))
    }

    /// Overwrite a stored value without marking it dirty.
    pub(crate) fn set_raw(&mut self, r: CacheRef, field: &str, value: Value) {
        self.store(r, field, value);
    }

    /// Column fields of `r` that hold a value, in declaration order.
    pub fn stored_values(&self, r: CacheRef) -> Vec<(&'static FieldInfo, Value)> {
        let Some(info) = self.registry.get(r.model) else {
            return Vec::new();
        };
        info.fields
            .iter()
            .filter(|fi| fi.kind.is_stored() && fi.name != ID_FIELD)
            .filter_map(|fi| self.raw(r, fi.name).map(|v| (fi, v.clone())))
            .collect()
    }

    fn related_ref(
        &self,
        info: &'static ModelInfo,
        id: i64,
        path: &str,
    ) -> Result<(CacheRef, &'static FieldInfo)> {
        let segments: Vec<&str> = path.split(PATH_SEPARATOR).collect();
        let Some((last, hops)) = segments.split_last() else {
            return Err(unknown_field(info, path));
        };
        let mut info = info;
        let mut current = CacheRef::new(info.name, id);
        for hop in hops {
            let fi = field_of(info, hop)?;
            if !matches!(
                fi.kind,
                FieldKind::Many2One | FieldKind::One2One | FieldKind::Rev2One
            ) {
                return Err(CacheError::new(
                    CacheErrorKind::ShapeMismatch,
                    info.name,
                    format!("path '{}' crosses multi-valued field '{}'", path, hop),
                )
                .into());
            }
            let Some(next) = self.value_of(current, fi).as_ref().and_then(Value::as_i64) else {
                return Err(CacheError::new(
                    CacheErrorKind::NotInCache,
                    info.name,
                    format!("requested value not in cache: {}.{}", current, hop),
                )
                .into());
            };
            info = self.registry.require(related_model(current, fi)?)?;
            current = CacheRef::new(info.name, next);
        }
        Ok((current, field_of(info, last)?))
    }

    fn value_of(&self, r: CacheRef, fi: &'static FieldInfo) -> Option<Value> {
        match fi.kind {
            FieldKind::Scalar if fi.name == ID_FIELD => Some(Value::BigInt(r.id)),
            FieldKind::Scalar | FieldKind::Many2One | FieldKind::One2One => {
                self.raw(r, fi.name).cloned()
            }
            FieldKind::One2Many => Some(Value::ids(self.scan_reverse(r, fi))),
            FieldKind::Rev2One => self
                .scan_reverse(r, fi)
                .first()
                .map(|&id| Value::BigInt(id)),
            FieldKind::Many2Many => fi.link.map(|link| Value::ids(self.linked_ids(r, &link))),
        }
    }

    /// Ids of cached records of the related model whose reverse foreign key
    /// points at `r`.
    fn scan_reverse(&self, r: CacheRef, fi: &FieldInfo) -> Vec<i64> {
        let (Some(related), Some(reverse)) = (fi.related_model, fi.reverse_fk) else {
            return Vec::new();
        };
        let target = self.resolve(r).id;
        let mut ids = BTreeSet::new();
        for (key, &idx) in &self.index {
            if key.model != related {
                continue;
            }
            let Some(fk) = self.slots[idx].get(reverse).and_then(Value::as_i64) else {
                continue;
            };
            if self.resolve_id(r.model, fk) == target {
                ids.insert(self.resolve(*key).id);
            }
        }
        ids.into_iter().collect()
    }
}

fn field_of(info: &'static ModelInfo, name: &str) -> Result<&'static FieldInfo> {
    info.field(name).ok_or_else(|| unknown_field(info, name))
}

fn unknown_field(info: &ModelInfo, name: &str) -> Error {
    CacheError::new(
        CacheErrorKind::UnknownField,
        info.name,
        format!("unknown field '{}' on model '{}'", name, info.name),
    )
    .into()
}

fn related_model(r: CacheRef, fi: &FieldInfo) -> Result<&'static str> {
    fi.related_model
        .ok_or_else(|| missing_metadata(r, fi, "related model"))
}

fn link_of(r: CacheRef, fi: &FieldInfo) -> Result<LinkTableInfo> {
    fi.link.ok_or_else(|| missing_metadata(r, fi, "link table"))
}

fn missing_metadata(r: CacheRef, fi: &FieldInfo, what: &str) -> Error {
    Error::Schema(SchemaError {
        kind: SchemaErrorKind::Invalid,
        message: format!("{}.{} has no {}", r.model, fi.name, what),
    })
}

fn check_shape(r: CacheRef, fi: &FieldInfo, value: &Value) -> Result<()> {
    let ok = match fi.kind {
        FieldKind::Scalar => fi.name != ID_FIELD,
        FieldKind::Many2One | FieldKind::One2One | FieldKind::Rev2One => {
            value.as_record_id().is_some()
        }
        FieldKind::One2Many | FieldKind::Many2Many => value.as_id_list().is_some(),
    };
    if ok {
        Ok(())
    } else {
        Err(CacheError::new(
            CacheErrorKind::ShapeMismatch,
            r.model,
            format!(
                "field '{}' of {} cannot take a {} value",
                fi.name,
                r,
                value.type_name()
            ),
        )
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static CUSTOMER_FIELDS: [FieldInfo; 4] = [
        FieldInfo::scalar("name"),
        FieldInfo::one2many("orders", "order", "customer"),
        FieldInfo::rev2one("profile", "profile", "customer"),
        FieldInfo::many2many(
            "tags",
            "tag",
            LinkTableInfo::new("customer_tag_rel", "customer_id", "tag_id"),
        ),
    ];
    static CUSTOMER: ModelInfo = ModelInfo::new("customer", "customer", &CUSTOMER_FIELDS);

    static ORDER_FIELDS: [FieldInfo; 2] = [
        FieldInfo::scalar("amount"),
        FieldInfo::many2one("customer", "customer").column("customer_id"),
    ];
    static ORDER: ModelInfo = ModelInfo::new("order", "sale_order", &ORDER_FIELDS);

    static PROFILE_FIELDS: [FieldInfo; 2] = [
        FieldInfo::scalar("age"),
        FieldInfo::one2one("customer", "customer").column("customer_id"),
    ];
    static PROFILE: ModelInfo = ModelInfo::new("profile", "profile", &PROFILE_FIELDS);

    static TAG_FIELDS: [FieldInfo; 2] = [
        FieldInfo::scalar("name"),
        FieldInfo::many2many(
            "customers",
            "customer",
            LinkTableInfo::new("customer_tag_rel", "tag_id", "customer_id"),
        ),
    ];
    static TAG: ModelInfo = ModelInfo::new("tag", "tag", &TAG_FIELDS);

    fn cache() -> Cache {
        let registry = Registry::from_models(&[&CUSTOMER, &ORDER, &PROFILE, &TAG]).unwrap();
        Cache::new(Arc::new(registry))
    }

    fn fields(entries: &[(&str, Value)]) -> FieldMap {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn get_data_creates_entry_with_id() {
        let mut cache = cache();
        for id in [-3, 0, 12] {
            let r = CacheRef::new("order", id);
            let data = cache.get_data(r);
            assert_eq!(data.get("id"), Some(&Value::BigInt(id)));
            assert!(cache.contains(r));
        }
    }

    #[test]
    fn init_with_data_replaces_and_forces_id() {
        let mut cache = cache();
        let r = CacheRef::new("customer", 4);
        cache
            .update_entry("customer", 4, "name", Value::from("Old"))
            .unwrap();
        cache
            .init_with_data(
                r,
                fields(&[("id", Value::BigInt(99)), ("tags", Value::ids([1, 2]))]),
            )
            .unwrap();

        let data = cache.get_data(r);
        assert_eq!(data.get("id"), Some(&Value::BigInt(4)));
        assert!(!data.contains_key("name"));
        assert_eq!(cache.get("customer", 4, "tags"), Some(Value::ids([1, 2])));
        assert!(cache.pending_link_syncs().is_empty());
    }

    #[test]
    fn scalar_updates_schedule_persisted_records_only() {
        let mut cache = cache();
        cache
            .update_entry("order", 5, "amount", Value::Int(10))
            .unwrap();
        cache
            .update_entry("order", -1, "amount", Value::Int(20))
            .unwrap();

        let order5 = CacheRef::new("order", 5);
        assert_eq!(cache.dirty_fields(order5), vec!["amount"]);
        assert!(cache.dirty_fields(CacheRef::new("order", -1)).is_empty());
        assert_eq!(cache.pending_updates(), vec![(order5, vec!["amount"])]);
    }

    #[test]
    fn one2many_writes_reverse_foreign_keys() {
        let mut cache = cache();
        cache
            .update_entry("customer", 3, "orders", Value::ids([10, 11]))
            .unwrap();

        assert_eq!(cache.get("order", 10, "customer"), Some(Value::BigInt(3)));
        assert_eq!(cache.get("order", 11, "customer"), Some(Value::BigInt(3)));
        assert_eq!(cache.get("customer", 3, "orders"), Some(Value::ids([10, 11])));
        assert_eq!(
            cache.dirty_fields(CacheRef::new("order", 10)),
            vec!["customer"]
        );
        // The marker is stored but never read back.
        assert_eq!(
            cache.raw(CacheRef::new("customer", 3), "orders"),
            Some(&Value::Bool(true))
        );
    }

    #[test]
    fn rev2one_reads_single_related_record() {
        let mut cache = cache();
        cache
            .update_entry("customer", 3, "profile", Value::BigInt(8))
            .unwrap();
        assert_eq!(cache.get("profile", 8, "customer"), Some(Value::BigInt(3)));
        assert_eq!(cache.get("customer", 3, "profile"), Some(Value::BigInt(8)));
        // Nothing cached points at customer(4): unknown, not "no profile".
        assert_eq!(cache.get("customer", 4, "profile"), None);
    }

    #[test]
    fn many2many_is_replaced_and_symmetric() {
        let mut cache = cache();
        cache
            .update_entry("customer", 1, "tags", Value::ids([7, 8]))
            .unwrap();
        assert_eq!(cache.get("tag", 7, "customers"), Some(Value::ids([1])));
        assert_eq!(
            cache.raw(CacheRef::new("customer", 1), "tags"),
            Some(&Value::Bool(true))
        );

        cache
            .update_entry("customer", 1, "tags", Value::ids([]))
            .unwrap();
        assert_eq!(cache.get("customer", 1, "tags"), Some(Value::ids([])));
        assert_eq!(cache.get("tag", 7, "customers"), Some(Value::ids([])));
        assert_eq!(
            cache.pending_link_syncs(),
            vec![(CacheRef::new("customer", 1), "tags")]
        );
    }

    #[test]
    fn dotted_paths_need_cached_foreign_keys() {
        let mut cache = cache();
        let err = cache
            .update_entry("order", 2, "customer.name", Value::from("Ann"))
            .unwrap_err();
        assert_eq!(err.cache_kind(), Some(CacheErrorKind::NotInCache));
        assert!(!cache.contains(CacheRef::new("customer", 9)));
        assert_eq!(cache.get("order", 2, "customer.name"), None);

        cache
            .update_entry("order", 2, "customer", Value::BigInt(9))
            .unwrap();
        cache
            .update_entry("order", 2, "customer.name", Value::from("Ann"))
            .unwrap();
        assert_eq!(cache.get("customer", 9, "name"), Some(Value::from("Ann")));
        assert_eq!(
            cache.get("order", 2, "customer.name"),
            Some(Value::from("Ann"))
        );
    }

    #[test]
    fn shape_mismatch_leaves_cache_untouched() {
        let mut cache = cache();
        let err = cache
            .update_entry("customer", 1, "orders", Value::from("ten"))
            .unwrap_err();
        assert_eq!(err.cache_kind(), Some(CacheErrorKind::ShapeMismatch));
        assert!(!cache.contains(CacheRef::new("customer", 1)));

        let err = cache
            .update_entry("order", 1, "id", Value::BigInt(4))
            .unwrap_err();
        assert_eq!(err.cache_kind(), Some(CacheErrorKind::ShapeMismatch));

        let err = cache
            .update_entry("order", 1, "missing", Value::Null)
            .unwrap_err();
        assert_eq!(err.cache_kind(), Some(CacheErrorKind::UnknownField));
    }

    #[test]
    fn add_record_applies_shallow_paths_first() {
        let mut cache = cache();
        let data = fields(&[
            ("id", Value::BigInt(2)),
            ("customer.name", Value::from("Ann")),
            ("customer", Value::BigInt(9)),
            ("customer.profile.age", Value::Int(40)),
            ("amount", Value::Int(5)),
        ]);
        cache.add_record("order", 2, data).unwrap();

        assert_eq!(cache.get("order", 2, "amount"), Some(Value::Int(5)));
        assert_eq!(
            cache.get("order", 2, "customer.name"),
            Some(Value::from("Ann"))
        );
        // customer(9) has no cached profile, so the deepest path was skipped.
        assert_eq!(cache.get("customer", 9, "profile"), None);
        assert_eq!(cache.get("customer", 9, "profile.age"), None);
    }

    #[test]
    fn add_record_propagates_shape_errors() {
        let mut cache = cache();
        let err = cache
            .add_record("order", 2, fields(&[("customer", Value::from("x"))]))
            .unwrap_err();
        assert_eq!(err.cache_kind(), Some(CacheErrorKind::ShapeMismatch));
    }

    #[test]
    fn presence_check_ignores_placeholders() {
        let mut cache = cache();
        cache
            .update_entry("order", 2, "amount", Value::Int(1))
            .unwrap();
        assert!(cache.check_if_in_cache("order", &[2, -4, 0], &["amount", "id"]));
        assert!(!cache.check_if_in_cache("order", &[2], &["customer"]));
        assert!(!cache.check_if_in_cache("order", &[3], &["amount"]));
        assert!(!cache.check_if_in_cache("order", &[2], &["customer.name"]));
        assert!(cache.check_if_in_cache("order", &[-1], &["customer.name"]));
    }

    #[test]
    fn partition_splits_cached_ids() {
        let mut cache = cache();
        cache.get_data(CacheRef::new("order", 1));
        cache.get_data(CacheRef::new("order", 3));
        let (cached, missing) = cache.partition_cached("order", &[1, 2, 3, 4]);
        assert_eq!(cached, vec![1, 3]);
        assert_eq!(missing, vec![2, 4]);
    }

    #[test]
    fn invalidate_drops_data_links_and_updates() {
        let mut cache = cache();
        cache
            .update_entry("customer", 1, "name", Value::from("Ann"))
            .unwrap();
        cache
            .update_entry("customer", 1, "tags", Value::ids([7]))
            .unwrap();
        cache
            .update_entry("order", 10, "customer", Value::BigInt(1))
            .unwrap();

        cache.invalidate_record("customer", 1).unwrap();

        assert!(!cache.contains(CacheRef::new("customer", 1)));
        assert_eq!(cache.get("customer", 1, "name"), None);
        assert_eq!(cache.get("tag", 7, "customers"), Some(Value::ids([])));
        assert!(cache.dirty_fields(CacheRef::new("customer", 1)).is_empty());
        assert!(cache.pending_link_syncs().is_empty());

        cache.invalidate_record("order", 10).unwrap();
        assert_eq!(cache.get("customer", 1, "orders"), Some(Value::ids([])));
    }

    #[test]
    fn invalidating_a_placeholder_unschedules_its_insert() {
        let mut cache = cache();
        let placeholder = CacheRef::new("customer", -1);
        cache.schedule_insert(placeholder);
        cache
            .update_entry_by_ref(placeholder, "name", Value::from("Ann"))
            .unwrap();

        cache.invalidate_record("customer", -1).unwrap();

        assert!(cache.pending_inserts().is_empty());
        assert!(cache.stored_values(placeholder).is_empty());
        assert!(cache.promoted(placeholder).is_none());
    }

    #[test]
    fn invalidating_a_promoted_record_keeps_the_promotion() {
        let mut cache = cache();
        let placeholder = CacheRef::new("customer", -1);
        let real = CacheRef::new("customer", 12);
        cache.schedule_insert(placeholder);
        cache.promote(placeholder, real);

        cache.invalidate_record("customer", 12).unwrap();

        assert_eq!(cache.promoted(placeholder), Some(real));
        assert!(cache.is_in_db(placeholder));
    }

    #[test]
    fn id_reads_return_the_key_id() {
        let cache = cache();
        assert_eq!(cache.get("order", 6, "id"), Some(Value::BigInt(6)));
        assert!(cache.check_if_in_cache("order", &[6], &["id"]));
        assert!(!cache.check_if_in_cache("order", &[6], &["customer.id"]));
    }

    #[test]
    fn remove_entry_drops_single_field() {
        let mut cache = cache();
        cache
            .update_entry("customer", 1, "name", Value::from("Ann"))
            .unwrap();
        cache
            .update_entry("customer", 1, "tags", Value::ids([7]))
            .unwrap();

        cache.remove_entry("customer", 1, "name").unwrap();
        cache.remove_entry("customer", 1, "tags").unwrap();
        cache.remove_entry("customer", 2, "name").unwrap();

        assert!(!cache.check_if_in_cache("customer", &[1], &["name"]));
        assert!(cache.dirty_fields(CacheRef::new("customer", 1)).is_empty());
        assert_eq!(cache.get("tag", 7, "customers"), Some(Value::ids([])));
    }

    #[test]
    fn get_record_recomputes_relations() {
        let mut cache = cache();
        cache
            .update_entry("customer", 1, "name", Value::from("Ann"))
            .unwrap();
        cache
            .update_entry("customer", 1, "orders", Value::ids([4]))
            .unwrap();
        cache
            .update_entry("order", 5, "customer", Value::BigInt(1))
            .unwrap();

        let record = cache.get_record("customer", 1).unwrap();
        assert_eq!(record.get("id"), Some(&Value::BigInt(1)));
        assert_eq!(record.get("name"), Some(&Value::from("Ann")));
        assert_eq!(record.get("orders"), Some(&Value::ids([4, 5])));
        assert!(cache.get_record("customer", 2).is_none());
    }

    #[test]
    fn promotion_aliases_both_keys() {
        let mut cache = cache();
        let placeholder = CacheRef::new("customer", -2);
        let order = CacheRef::new("order", -1);
        cache.schedule_insert(placeholder);
        cache.schedule_insert(order);
        cache
            .update_entry_by_ref(placeholder, "name", Value::from("Ann"))
            .unwrap();
        cache
            .update_entry_by_ref(order, "customer", Value::BigInt(-2))
            .unwrap();
        cache
            .update_entry_by_ref(placeholder, "tags", Value::ids([7]))
            .unwrap();
        assert!(cache.is_not_in_db(placeholder));
        assert_eq!(cache.pending_inserts(), vec![order, placeholder]);

        let real = CacheRef::new("customer", 31);
        cache.promote(placeholder, real);

        assert!(cache.is_in_db(placeholder));
        assert_eq!(cache.resolve(placeholder), real);
        assert_eq!(cache.get_data(real).get("name"), Some(&Value::from("Ann")));
        assert_eq!(
            cache.get_data(placeholder).get("id"),
            Some(&Value::BigInt(-2))
        );
        assert_eq!(cache.get("order", -1, "customer"), Some(Value::BigInt(31)));
        assert_eq!(cache.get("tag", 7, "customers"), Some(Value::ids([31])));
        assert_eq!(cache.pending_link_syncs(), vec![(real, "tags")]);
        assert_eq!(cache.pending_inserts(), vec![order]);

        // Writes through the placeholder key are tracked on the real record.
        cache
            .update_entry_by_ref(placeholder, "name", Value::from("Bea"))
            .unwrap();
        assert_eq!(cache.dirty_fields(real), vec!["name"]);
        assert_eq!(cache.get("customer", 31, "name"), Some(Value::from("Bea")));
    }

    #[test]
    fn copy_pointer_shares_one_slot() {
        let mut cache = cache();
        let a = CacheRef::new("order", -1);
        let b = CacheRef::new("order", 40);
        cache
            .update_entry_by_ref(a, "amount", Value::Int(3))
            .unwrap();
        cache.copy_pointer(a, b);
        cache
            .update_entry_by_ref(b, "amount", Value::Int(4))
            .unwrap();
        assert_eq!(cache.get("order", -1, "amount"), Some(Value::Int(4)));
    }

    #[test]
    fn stored_values_skip_relations_and_missing_fields() {
        let mut cache = cache();
        let r = CacheRef::new("customer", -1);
        cache
            .update_entry_by_ref(r, "name", Value::from("Ann"))
            .unwrap();
        cache
            .update_entry_by_ref(r, "tags", Value::ids([1]))
            .unwrap();
        let stored: Vec<_> = cache
            .stored_values(r)
            .into_iter()
            .map(|(fi, v)| (fi.name, v))
            .collect();
        assert_eq!(stored, vec![("name", Value::from("Ann"))]);
    }
}
