//! Shared fixtures: two entity types over recording/in-memory backends.

use std::any::Any;
use std::sync::Arc;

use stratum::bus::MemoryBus;
use stratum::cache::MemoryBackend;
use stratum::db::testing::RecordingConn;
use stratum::entity::{Entity, EntityMeta, Ref, SqlValue};
use stratum::schema::{
    CachedQueryDecl, EntityDeclaration, FieldDecl, FieldKind, Registry, SchemaError,
    ValidatedRegistry,
};
use stratum::EntityDef;

#[derive(Default)]
pub struct User {
    pub meta: EntityMeta,
    pub id: u64,
    pub name: String,
    pub age: i32,
}

impl Entity for User {
    fn entity_name(&self) -> &'static str {
        "User"
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
        vec![self.name.clone().into(), self.age.into()]
    }
    fn apply_row(&mut self, row: &[SqlValue]) -> Result<(), SchemaError> {
        self.name = row[0]
            .as_str()
            .ok_or_else(|| SchemaError::invalid_row("User", "Name"))?
            .to_string();
        self.age = row[1]
            .as_i64()
            .ok_or_else(|| SchemaError::invalid_row("User", "Age"))? as i32;
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

impl EntityDef for User {
    const NAME: &'static str = "User";

    fn declaration() -> EntityDeclaration {
        EntityDeclaration {
            name: "User",
            meta_tags: "localCache;redisCache;dirty=user_changed",
            fields: vec![
                FieldDecl::new("ID", FieldKind::U64),
                FieldDecl::new("Name", FieldKind::Str).tags("length=40;unique=Name"),
                FieldDecl::new("Age", FieldKind::I32),
            ],
            queries: vec![
                CachedQueryDecl::new("IndexAge", ":Age = ?"),
                CachedQueryDecl::new("ByName", ":Name = ?").one(),
            ],
        }
    }
}

#[derive(Default)]
pub struct Post {
    pub meta: EntityMeta,
    pub id: u64,
    pub title: String,
    pub author: Ref<User>,
    pub fake_delete: bool,
}

impl Entity for Post {
    fn entity_name(&self) -> &'static str {
        "Post"
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
        vec![
            self.title.clone().into(),
            SqlValue::from(&self.author),
            self.fake_delete.into(),
        ]
    }
    fn apply_row(&mut self, row: &[SqlValue]) -> Result<(), SchemaError> {
        self.title = row[0]
            .as_str()
            .ok_or_else(|| SchemaError::invalid_row("Post", "Title"))?
            .to_string();
        self.author = match row[1].as_u64() {
            Some(id) => Ref::to(id),
            None => Ref::none(),
        };
        self.fake_delete = row[2].as_bool().unwrap_or(false);
        Ok(())
    }
    fn ref_id(&self, column: &str) -> Option<u64> {
        (column == "Author").then(|| self.author.id())
    }
    fn set_ref(&mut self, column: &str, entity: Box<dyn Any>) {
        if column == "Author"
            && let Ok(user) = entity.downcast::<User>()
        {
            self.author.set_loaded(user);
        }
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

impl EntityDef for Post {
    const NAME: &'static str = "Post";

    fn declaration() -> EntityDeclaration {
        EntityDeclaration {
            name: "Post",
            meta_tags: "localCache;redisCache;log",
            fields: vec![
                FieldDecl::new("ID", FieldKind::U64),
                FieldDecl::new("Title", FieldKind::Str).tags("length=100;required"),
                FieldDecl::new("Author", FieldKind::Ref("User")).nullable(),
                FieldDecl::new("FakeDelete", FieldKind::Bool),
            ],
            queries: Vec::new(),
        }
    }
}

pub struct Fixture {
    pub registry: Arc<ValidatedRegistry>,
    pub conn: Arc<RecordingConn>,
    pub kv: Arc<MemoryBackend>,
    pub bus: Arc<MemoryBus>,
}

pub fn fixture() -> Fixture {
    let conn = Arc::new(RecordingConn::new("app"));
    let kv = Arc::new(MemoryBackend::new());
    let bus = Arc::new(MemoryBus::new());

    let mut registry = Registry::new();
    registry.register_sql_conn("default", conn.clone());
    registry.register_shared_backend("default", kv.clone());
    registry.register_local_cache("default", 1_000);
    registry.register_bus_backend("default", Arc::new(bus.clone()), Vec::new(), Vec::new());
    registry.register_locker("default", "default");
    registry.register_dirty_queue("user_changed", 10);
    registry.register_entity::<User>();
    registry.register_entity::<Post>();

    Fixture {
        registry: registry.validate().expect("registry validates"),
        conn,
        kv,
        bus,
    }
}
