//! Entity schema model.
//!
//! Record declarations are parsed into a canonical [`TableSchema`] per
//! entity type: ordered column definitions, indexes, foreign keys,
//! reference columns, cached-query descriptors and cache bindings.
//! Schemas are computed once during [`Registry::validate`] and are
//! immutable afterwards.

mod column;
mod registry;
mod tags;

pub use registry::{
    Registry, ValidatedRegistry, DIRTY_RECONCILE_SET, INVALIDATE_QUEUE, LAZY_QUEUE, LOG_QUEUE,
};
pub(crate) use tags::TagSet;

use std::collections::BTreeMap;

use thiserror::Error;

/// Default cap on rows served by a cached query before falling through to
/// uncached execution.
pub const DEFAULT_CACHED_QUERY_MAX: u32 = 50_000;

/// Ids per cached-query page bucket.
pub const CACHED_QUERY_PAGE_SIZE: u32 = 1_000;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("entity `{name}` is not registered")]
    EntityNotRegistered { name: String },
    #[error("enum `{name}` is not registered")]
    EnumNotRegistered { name: String },
    #[error("pool `{name}` is not registered")]
    PoolNotRegistered { name: String },
    #[error("pool `{name}` could not be initialized: {message}")]
    InvalidPool { name: String, message: String },
    #[error("entity `{entity}` must declare an unsigned integer `ID` as its first field")]
    InvalidPrimaryKey { entity: &'static str },
    #[error("invalid tag on `{entity}.{field}`: {message}")]
    InvalidTag {
        entity: String,
        field: String,
        message: String,
    },
    #[error("row image for `{entity}` has an unexpected value in column `{column}`")]
    InvalidRow { entity: String, column: String },
}

impl SchemaError {
    pub(crate) fn invalid_tag(
        entity: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidTag {
            entity: entity.into(),
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn invalid_row(entity: impl Into<String>, column: impl Into<String>) -> Self {
        Self::InvalidRow {
            entity: entity.into(),
            column: column.into(),
        }
    }
}

/// Storage kind of one declared field.
#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    Bool,
    F32,
    F64,
    /// String storage: `varchar(length)`, `mediumtext` (`length=max`), or
    /// an `enum=`/`set=` column per tags.
    Str,
    /// Raw blob.
    Bytes,
    /// Opaque JSON payload.
    Json,
    /// `date`, or `datetime` when tagged `time=true`.
    Time,
    /// Embedded struct; fields are flattened with the declared name as
    /// column prefix.
    Struct(fn() -> Vec<FieldDecl>),
    /// Reference to another registered entity; stored as the target's
    /// primary-key integer type.
    Ref(&'static str),
}

impl FieldKind {
    pub(crate) fn is_unsigned_int(self) -> bool {
        matches!(self, Self::U8 | Self::U16 | Self::U32 | Self::U64)
    }
}

/// One declared field, tag string in the `key[=value][;…]` grammar.
#[derive(Debug, Clone)]
pub struct FieldDecl {
    pub name: &'static str,
    pub kind: FieldKind,
    pub nullable: bool,
    pub tags: &'static str,
}

impl FieldDecl {
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            nullable: false,
            tags: "",
        }
    }

    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub const fn tags(mut self, tags: &'static str) -> Self {
        self.tags = tags;
        self
    }
}

/// A named query whose id-list result is cached per argument tuple.
///
/// Fields referenced with a `:` prefix in the template (and order clause)
/// are tracked; mutations touching them invalidate the index.
#[derive(Debug, Clone)]
pub struct CachedQueryDecl {
    pub name: &'static str,
    pub template: &'static str,
    pub order_by: &'static str,
    pub one: bool,
    pub max: u32,
}

impl CachedQueryDecl {
    pub const fn new(name: &'static str, template: &'static str) -> Self {
        Self {
            name,
            template,
            order_by: "",
            one: false,
            max: 0,
        }
    }

    pub const fn order_by(mut self, order_by: &'static str) -> Self {
        self.order_by = order_by;
        self
    }

    pub const fn one(mut self) -> Self {
        self.one = true;
        self
    }

    pub const fn max(mut self, max: u32) -> Self {
        self.max = max;
        self
    }
}

/// A complete record declaration: metadata-carrier tags, then the `ID`
/// field, then the remaining fields in storage order.
#[derive(Debug, Clone)]
pub struct EntityDeclaration {
    pub name: &'static str,
    pub meta_tags: &'static str,
    pub fields: Vec<FieldDecl>,
    pub queries: Vec<CachedQueryDecl>,
}

/// A rendered column: name plus its full MySQL definition.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub definition: String,
    pub nullable: bool,
}

/// A (possibly composite) index; columns keyed by 1-based position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub unique: bool,
    pub columns: BTreeMap<u16, String>,
}

/// Foreign-key policy of a reference column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDelete {
    Restrict,
    Cascade,
}

impl OnDelete {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Restrict => "RESTRICT",
            Self::Cascade => "CASCADE",
        }
    }
}

/// A reference column resolved against the registry.
#[derive(Debug, Clone)]
pub struct RefColumn {
    pub column: String,
    pub target_entity: String,
    pub target_table: String,
    /// Absent when the target schema lives in a different pool; no
    /// foreign key is emitted in that case.
    pub foreign_key: Option<OnDelete>,
}

/// A validated cached-query descriptor.
#[derive(Debug, Clone)]
pub struct CachedQueryDef {
    pub name: String,
    /// Predicate with tracked-field markers stripped.
    pub query: String,
    pub order_by: Option<String>,
    /// Fields bound by the predicate's placeholders, in template order;
    /// a row's values for these form the argument tuple its pages are
    /// keyed by.
    pub predicate_fields: Vec<String>,
    /// Every field the index depends on (predicate plus order clause);
    /// mutations touching any of them invalidate the index.
    pub tracked_fields: Vec<String>,
    pub one: bool,
    pub max: u32,
}

/// The canonical description of one entity type.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub entity_name: String,
    pub table_name: String,
    pub pool_name: String,
    /// `ID` first, synthetic `FakeDelete` last when present; order is the
    /// declaration order and migrations rely on it.
    pub columns: Vec<ColumnDef>,
    pub indexes: BTreeMap<String, IndexDef>,
    pub ref_columns: Vec<RefColumn>,
    pub cached_queries: BTreeMap<String, CachedQueryDef>,
    pub has_fake_delete: bool,
    pub local_cache: Option<String>,
    pub shared_cache: Option<String>,
    pub log_pool: Option<String>,
    pub dirty_queues: Vec<String>,
}

impl TableSchema {
    /// Cache key of one row image: `<Type>:<id>`.
    pub fn cache_key(&self, id: u64) -> String {
        format!("{}:{}", self.entity_name, id)
    }

    /// Columns carrying row data (everything except `ID`).
    pub fn data_columns(&self) -> &[ColumnDef] {
        &self.columns[1..]
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.data_columns().iter().position(|c| c.name == name)
    }

    pub fn log_table_name(&self) -> String {
        format!("_log_{}", self.table_name)
    }

    pub fn has_any_cache(&self) -> bool {
        self.local_cache.is_some() || self.shared_cache.is_some()
    }

    /// Cached queries tracking any of the given columns.
    pub fn queries_tracking<'a>(
        &'a self,
        columns: &'a [String],
    ) -> impl Iterator<Item = &'a CachedQueryDef> {
        self.cached_queries.values().filter(move |query| {
            query
                .tracked_fields
                .iter()
                .any(|field| columns.iter().any(|c| c == field))
        })
    }
}
