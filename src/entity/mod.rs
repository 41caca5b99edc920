//! Entity model.
//!
//! A domain record participates in the engine through two traits:
//! [`Entity`] (object-safe: header access, id, row marshalling) and
//! [`EntityDef`] (the static declaration the schema registry consumes).
//! Every entity embeds an [`EntityMeta`] header carrying its last
//! persisted row snapshot and lifecycle flags.

mod bind;
mod value;

pub(crate) use bind::{dirty_bind, DirtyState};
pub use value::SqlValue;

use std::any::Any;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::cache::lock::{rw_read, rw_write};
use crate::schema::{EntityDeclaration, SchemaError};

const SOURCE: &str = "entity";

/// `ON DUPLICATE KEY UPDATE` override attached to one instance.
#[derive(Debug, Clone)]
pub struct OnDuplicateUpdate {
    pub assignments: String,
    pub params: Vec<SqlValue>,
}

/// Per-instance engine header.
///
/// `db_data` is the snapshot of the last-known persisted column values in
/// declaration order; the flush diff runs against it. An entity with
/// `loaded == false` and a zero id is new; with a non-zero id it is a
/// shallow stub.
#[derive(Debug, Default)]
pub struct EntityMeta {
    pub(crate) db_data: Vec<SqlValue>,
    pub(crate) loaded: bool,
    pub(crate) delete: bool,
    pub(crate) force_delete: bool,
    pub(crate) on_duplicate: Option<OnDuplicateUpdate>,
    pub(crate) log_meta: Option<serde_json::Value>,
}

impl EntityMeta {
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn is_marked_to_delete(&self) -> bool {
        self.delete
    }

    /// Mark for deletion on the next flush; soft-delete schemas rewrite
    /// this into a `FakeDelete` update.
    pub fn mark_to_delete(&mut self) {
        self.delete = true;
    }

    /// Mark for a real `DELETE`, bypassing soft delete.
    pub fn force_mark_to_delete(&mut self) {
        self.delete = true;
        self.force_delete = true;
    }

    pub fn set_on_duplicate_update(&mut self, assignments: impl Into<String>, params: Vec<SqlValue>) {
        self.on_duplicate = Some(OnDuplicateUpdate {
            assignments: assignments.into(),
            params,
        });
    }

    /// Extra metadata attached to this instance's change-log rows.
    pub fn set_log_meta(&mut self, meta: serde_json::Value) {
        self.log_meta = Some(meta);
    }

    /// Forget engine state; the entity reads as new again.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn snapshot(&mut self, row: Vec<SqlValue>) {
        self.db_data = row;
        self.loaded = true;
        self.delete = false;
        self.force_delete = false;
    }
}

/// Object-safe entity surface the engine works through.
pub trait Entity: Any + Send + Sync {
    fn entity_name(&self) -> &'static str;

    fn meta(&self) -> &EntityMeta;

    fn meta_mut(&mut self) -> &mut EntityMeta;

    fn id(&self) -> u64;

    fn set_id(&mut self, id: u64);

    /// Current field values as a row image: every data column in
    /// declaration order (`ID` excluded).
    fn to_row(&self) -> Vec<SqlValue>;

    /// Overwrite fields from a row image in declaration order.
    fn apply_row(&mut self, row: &[SqlValue]) -> Result<(), SchemaError>;

    /// Target id held by the given reference column.
    fn ref_id(&self, _column: &str) -> Option<u64> {
        None
    }

    /// Hand a hydrated referenced entity to the given reference column;
    /// `entity` is a boxed instance of the column's target type.
    fn set_ref(&mut self, _column: &str, _entity: Box<dyn Any>) {}

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Consume the box for a downcast; used when handing a hydrated
    /// entity to a reference column.
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Static side of an entity type: its declaration for the registry.
pub trait EntityDef: Entity + Default + Sized {
    const NAME: &'static str;

    fn declaration() -> EntityDeclaration;
}

/// A reference stub: `{target type, id, hydrated?}`.
///
/// References never own their target as a plain value; cycles between
/// entity types stay representable and the preloader fills in
/// `entity` on demand. Pointing a reference at a tracked entity makes the
/// id follow the target even when the target is inserted later in the
/// same flush.
#[derive(Debug, Default)]
pub struct Ref<E: EntityDef> {
    id: u64,
    entity: Option<Box<E>>,
    shared: Option<Arc<RwLock<E>>>,
}

impl<E: EntityDef> Ref<E> {
    pub fn none() -> Self {
        Self {
            id: 0,
            entity: None,
            shared: None,
        }
    }

    pub fn to(id: u64) -> Self {
        Self {
            id,
            entity: None,
            shared: None,
        }
    }

    /// Follow a tracked entity; the reference resolves to whatever id the
    /// target has at flush time.
    pub fn to_tracked(tracked: &Tracked<E>) -> Self {
        Self {
            id: 0,
            entity: None,
            shared: Some(tracked.inner.clone()),
        }
    }

    pub fn id(&self) -> u64 {
        match &self.shared {
            Some(shared) => rw_read!(shared, SOURCE, "ref_id").id(),
            None => self.id,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.id() == 0
    }

    /// True once the referenced row has been hydrated by a preload.
    pub fn loaded(&self) -> bool {
        self.entity.is_some()
    }

    pub fn entity(&self) -> Option<&E> {
        self.entity.as_deref()
    }

    pub fn set_loaded(&mut self, entity: Box<E>) {
        self.id = entity.id();
        self.shared = None;
        self.entity = Some(entity);
    }

    pub fn clear(&mut self) {
        self.entity = None;
    }
}

impl<E: EntityDef> From<&Ref<E>> for SqlValue {
    fn from(reference: &Ref<E>) -> Self {
        match reference.id() {
            0 => SqlValue::Null,
            id => SqlValue::UInt(id),
        }
    }
}

/// Shared handle to an entity registered with an engine.
///
/// Engines keep these in their tracked list across `await` points, so the
/// entity lives behind a lock instead of a borrow.
pub struct Tracked<E: Entity> {
    inner: Arc<RwLock<E>>,
}

impl<E: Entity> Tracked<E> {
    pub fn new(entity: E) -> Self {
        Self {
            inner: Arc::new(RwLock::new(entity)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, E> {
        rw_read!(&self.inner, SOURCE, "read")
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, E> {
        rw_write!(&self.inner, SOURCE, "write")
    }

    pub fn id(&self) -> u64 {
        self.read().id()
    }

    pub(crate) fn as_dyn(&self) -> TrackedDyn
    where
        E: Sized,
    {
        self.inner.clone()
    }
}

impl<E: Entity> Clone for Tracked<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Type-erased tracked entity as held by the engine.
pub(crate) type TrackedDyn = Arc<RwLock<dyn Entity>>;

#[cfg(test)]
mod tests {
    use crate::schema::{FieldDecl, FieldKind};

    use super::*;

    #[derive(Default)]
    struct Sample {
        meta: EntityMeta,
        id: u64,
        name: String,
    }

    impl Entity for Sample {
        fn entity_name(&self) -> &'static str {
            "Sample"
        }
        fn meta(&self) -> &EntityMeta {
            &self.meta
        }
        fn meta_mut(&mut self) -> &mut EntityMeta {
            &mut self.meta
        }
        fn id(&self) -> u64 {
            self.id
        }
        fn set_id(&mut self, id: u64) {
            self.id = id;
        }
        fn to_row(&self) -> Vec<SqlValue> {
            vec![self.name.clone().into()]
        }
        fn apply_row(&mut self, row: &[SqlValue]) -> Result<(), SchemaError> {
            self.name = row[0]
                .as_str()
                .ok_or_else(|| SchemaError::invalid_row("Sample", "Name"))?
                .to_string();
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
        fn into_any(self: Box<Self>) -> Box<dyn Any> {
            self
        }
    }

    impl EntityDef for Sample {
        const NAME: &'static str = "Sample";

        fn declaration() -> EntityDeclaration {
            EntityDeclaration {
                name: "Sample",
                meta_tags: "",
                fields: vec![
                    FieldDecl::new("ID", FieldKind::U64),
                    FieldDecl::new("Name", FieldKind::Str),
                ],
                queries: Vec::new(),
            }
        }
    }

    #[test]
    fn tracked_handle_round_trip() {
        let sample = Tracked::new(Sample::default());
        sample.write().name = "Ada".to_string();
        assert_eq!(sample.read().name, "Ada");

        let dynamic: TrackedDyn = sample.as_dyn();
        assert_eq!(dynamic.read().unwrap().entity_name(), "Sample");
    }

    #[test]
    fn reference_follows_tracked_target() {
        let target = Tracked::new(Sample::default());
        let reference = Ref::to_tracked(&target);
        assert!(reference.is_zero());
        assert_eq!(SqlValue::from(&reference), SqlValue::Null);

        target.write().set_id(7);
        assert_eq!(reference.id(), 7);
        assert_eq!(SqlValue::from(&reference), SqlValue::UInt(7));
    }

    #[test]
    fn meta_reset_reads_as_new() {
        let mut meta = EntityMeta::default();
        meta.snapshot(vec![SqlValue::Str("Ada".into())]);
        assert!(meta.is_loaded());

        meta.mark_to_delete();
        meta.reset();
        assert!(!meta.is_loaded());
        assert!(!meta.is_marked_to_delete());
    }
}
