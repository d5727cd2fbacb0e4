//! Model and field metadata consumed by the cache.
//!
//! The cache never inspects Rust structs. It only needs to know, per model,
//! which fields exist, what kind of relation each one is, and where relation
//! data lives (reverse foreign keys, link tables). Metadata is declared as
//! `static` values and collected in a [`Registry`].

use crate::error::{CacheError, CacheErrorKind, Error, Result, SchemaError, SchemaErrorKind};
use std::collections::HashMap;

/// Name of the implicit primary key field every model carries.
pub const ID_FIELD: &str = "id";

static ID_FIELD_INFO: FieldInfo = FieldInfo::scalar(ID_FIELD);

/// How a field stores its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// Plain column value.
    Scalar,
    /// Foreign key column pointing at one related record.
    Many2One,
    /// Foreign key column with a uniqueness guarantee.
    One2One,
    /// Derived: records of the related model whose reverse FK points here.
    One2Many,
    /// Derived: the single related record whose reverse FK points here.
    Rev2One,
    /// Stored in a link table, never in the field map.
    Many2Many,
}

impl FieldKind {
    /// Whether the field is a foreign key column on this model's table.
    #[must_use]
    pub const fn is_fk_relation(self) -> bool {
        matches!(self, FieldKind::Many2One | FieldKind::One2One)
    }

    /// Whether the field is written as a column of this model's table.
    #[must_use]
    pub const fn is_stored(self) -> bool {
        matches!(
            self,
            FieldKind::Scalar | FieldKind::Many2One | FieldKind::One2One
        )
    }

    /// Whether the field's value is computed from other records on read.
    #[must_use]
    pub const fn is_derived(self) -> bool {
        matches!(
            self,
            FieldKind::One2Many | FieldKind::Rev2One | FieldKind::Many2Many
        )
    }
}

/// A link table backing a many-to-many field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTableInfo {
    /// The link table name (e.g., `"tag_post_rel"`).
    pub table_name: &'static str,

    /// Column holding this model's id.
    pub our_column: &'static str,

    /// Column holding the related model's id.
    pub their_column: &'static str,
}

impl LinkTableInfo {
    #[must_use]
    pub const fn new(
        table_name: &'static str,
        our_column: &'static str,
        their_column: &'static str,
    ) -> Self {
        Self {
            table_name,
            our_column,
            their_column,
        }
    }

    /// Position of this side's id inside a stored link pair.
    ///
    /// Both sides of a relation share one pair layout: the side whose column
    /// name sorts greater occupies index 1.
    #[must_use]
    pub fn our_index(&self) -> usize {
        usize::from(self.our_column > self.their_column)
    }

    /// Position of the related side's id inside a stored link pair.
    #[must_use]
    pub fn their_index(&self) -> usize {
        1 - self.our_index()
    }
}

/// Metadata about a model field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    /// Field name used in cache paths
    pub name: &'static str,
    /// Database column name (may differ from field name)
    pub column_name: &'static str,
    /// Storage kind
    pub kind: FieldKind,
    /// Related model name for relation fields
    pub related_model: Option<&'static str>,
    /// FK field on the related model pointing back here (one-to-many, reverse one-to-one)
    pub reverse_fk: Option<&'static str>,
    /// Link table (many-to-many)
    pub link: Option<LinkTableInfo>,
}

impl FieldInfo {
    const fn base(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            column_name: name,
            kind,
            related_model: None,
            reverse_fk: None,
            link: None,
        }
    }

    #[must_use]
    pub const fn scalar(name: &'static str) -> Self {
        Self::base(name, FieldKind::Scalar)
    }

    #[must_use]
    pub const fn many2one(name: &'static str, related: &'static str) -> Self {
        let mut f = Self::base(name, FieldKind::Many2One);
        f.related_model = Some(related);
        f
    }

    #[must_use]
    pub const fn one2one(name: &'static str, related: &'static str) -> Self {
        let mut f = Self::base(name, FieldKind::One2One);
        f.related_model = Some(related);
        f
    }

    #[must_use]
    pub const fn one2many(
        name: &'static str,
        related: &'static str,
        reverse_fk: &'static str,
    ) -> Self {
        let mut f = Self::base(name, FieldKind::One2Many);
        f.related_model = Some(related);
        f.reverse_fk = Some(reverse_fk);
        f
    }

    #[must_use]
    pub const fn rev2one(
        name: &'static str,
        related: &'static str,
        reverse_fk: &'static str,
    ) -> Self {
        let mut f = Self::base(name, FieldKind::Rev2One);
        f.related_model = Some(related);
        f.reverse_fk = Some(reverse_fk);
        f
    }

    #[must_use]
    pub const fn many2many(name: &'static str, related: &'static str, link: LinkTableInfo) -> Self {
        let mut f = Self::base(name, FieldKind::Many2Many);
        f.related_model = Some(related);
        f.link = Some(link);
        f
    }

    /// Set the database column name.
    #[must_use]
    pub const fn column(mut self, name: &'static str) -> Self {
        self.column_name = name;
        self
    }
}

/// Metadata about a model: its table and its fields.
#[derive(Debug, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: &'static str,
    pub table_name: &'static str,
    pub fields: &'static [FieldInfo],
}

impl ModelInfo {
    #[must_use]
    pub const fn new(
        name: &'static str,
        table_name: &'static str,
        fields: &'static [FieldInfo],
    ) -> Self {
        Self {
            name,
            table_name,
            fields,
        }
    }

    /// Look up a field by name; `"id"` is always present.
    pub fn field(&self, name: &str) -> Option<&'static FieldInfo> {
        if name == ID_FIELD {
            return Some(&ID_FIELD_INFO);
        }
        self.fields.iter().find(|f| f.name == name)
    }

    /// Fields backed by a link table.
    pub fn many2many_fields(&self) -> impl Iterator<Item = &'static FieldInfo> {
        self.fields
            .iter()
            .filter(|f| f.kind == FieldKind::Many2Many)
    }
}

/// All models known to a cache, by name.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    models: HashMap<&'static str, &'static ModelInfo>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every model and validate their relations.
    pub fn from_models(models: &[&'static ModelInfo]) -> Result<Self> {
        let mut registry = Self::new();
        for model in models {
            registry.register(model)?;
        }
        registry.validate()?;
        Ok(registry)
    }

    pub fn register(&mut self, model: &'static ModelInfo) -> Result<()> {
        if self.models.insert(model.name, model).is_some() {
            return Err(Error::Schema(SchemaError {
                kind: SchemaErrorKind::DuplicateModel,
                message: format!("model '{}' registered twice", model.name),
            }));
        }
        tracing::trace!(model = model.name, table = model.table_name, "Registered model");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&'static ModelInfo> {
        self.models.get(name).copied()
    }

    /// Like [`get`](Self::get), reporting an unknown model as a cache error.
    pub fn require(&self, name: &str) -> Result<&'static ModelInfo> {
        self.get(name).ok_or_else(|| {
            CacheError::new(
                CacheErrorKind::UnknownModel,
                name,
                format!("model '{}' is not registered", name),
            )
            .into()
        })
    }

    /// Resolve a field of a registered model.
    pub fn field(&self, model: &str, field: &str) -> Result<&'static FieldInfo> {
        self.require(model)?.field(field).ok_or_else(|| {
            CacheError::new(
                CacheErrorKind::UnknownField,
                model,
                format!("unknown field '{}' on model '{}'", field, model),
            )
            .into()
        })
    }

    /// Iterate over registered models (unordered).
    pub fn models(&self) -> impl Iterator<Item = &'static ModelInfo> + '_ {
        self.models.values().copied()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Check that every relation names a registered model and carries the
    /// metadata its kind needs.
    pub fn validate(&self) -> Result<()> {
        for model in self.models.values() {
            for field in model.fields {
                if field.kind == FieldKind::Scalar {
                    continue;
                }
                let Some(related_name) = field.related_model else {
                    return Err(invalid(model, field, "has no related model"));
                };
                let Some(related) = self.get(related_name) else {
                    return Err(Error::Schema(SchemaError {
                        kind: SchemaErrorKind::UnknownRelatedModel,
                        message: format!(
                            "{}.{} points at unregistered model '{}'",
                            model.name, field.name, related_name
                        ),
                    }));
                };
                match field.kind {
                    FieldKind::One2Many | FieldKind::Rev2One => {
                        let reverse = field
                            .reverse_fk
                            .and_then(|name| related.field(name))
                            .filter(|f| f.kind.is_fk_relation());
                        if reverse.is_none() {
                            return Err(invalid(
                                model,
                                field,
                                "needs a reverse foreign key on the related model",
                            ));
                        }
                    }
                    FieldKind::Many2Many if field.link.is_none() => {
                        return Err(invalid(model, field, "needs a link table"));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

fn invalid(model: &ModelInfo, field: &FieldInfo, what: &str) -> Error {
    Error::Schema(SchemaError {
        kind: SchemaErrorKind::Invalid,
        message: format!("{}.{} {}", model.name, field.name, what),
    })
}
