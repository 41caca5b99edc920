//! Registry of entities, pools and enums.
//!
//! Everything is registered up front, then [`Registry::validate`] computes
//! all table schemas, checks every cross-reference and builds the shared
//! runtime objects (pools, caches, bus clients). The result is immutable;
//! engines are cheap per-request values created from it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::column::{render_fields, push_fake_delete_column, RenderOutput};
use super::{
    CachedQueryDecl, CachedQueryDef, EntityDeclaration, RefColumn, SchemaError, TableSchema,
    TagSet, DEFAULT_CACHED_QUERY_MAX,
};
use crate::bus::{BusBackend, BusClient, QueueSettings, RabbitBackend, RouterSettings};
use crate::cache::{KvBackend, LocalCache, RedisBackend, SharedCache};
use crate::db::{MySqlConn, SqlConn};
use crate::engine::Engine;
use crate::entity::{Entity, EntityDef};

const SOURCE: &str = "schema::registry";

/// Queue the lazy write path publishes serialized mutations to.
pub const LAZY_QUEUE: &str = "lazy_queue";
/// Queue change-log rows ride when flushed lazily.
pub const LOG_QUEUE: &str = "log_queue";
/// Queue carrying `<Type>:<id>` cache-invalidation keys for other
/// processes.
pub const INVALIDATE_QUEUE: &str = "invalidate_queue";
/// Shared-cache set fed by `flush_in_cache`, drained by the reconcile
/// receiver.
pub const DIRTY_RECONCILE_SET: &str = "dirty_queue";

struct EntityRegistration {
    declaration: fn() -> EntityDeclaration,
    factory: fn() -> Box<dyn Entity>,
}

fn factory_of<E: EntityDef>() -> Box<dyn Entity> {
    Box::new(E::default())
}

enum SqlSource {
    Dsn(String),
    Conn(Arc<dyn SqlConn>),
}

enum SharedSource {
    Address(String),
    Backend(Arc<dyn KvBackend>),
}

struct BusRegistration {
    backend: BusBackendSource,
    queues: Vec<QueueSettings>,
    routers: Vec<RouterSettings>,
}

enum BusBackendSource {
    Address(String),
    Backend(Arc<dyn BusBackend>),
}

struct LocalSettings {
    capacity: usize,
    ttl: Option<Duration>,
}

/// Mutable collection phase; consumed by [`Registry::validate`].
#[derive(Default)]
pub struct Registry {
    entities: BTreeMap<&'static str, EntityRegistration>,
    enums: BTreeMap<String, Vec<String>>,
    sql: BTreeMap<String, SqlSource>,
    shared: BTreeMap<String, SharedSource>,
    local: BTreeMap<String, LocalSettings>,
    buses: BTreeMap<String, BusRegistration>,
    lockers: BTreeMap<String, String>,
    dirty_queues: BTreeMap<String, u16>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_entity<E: EntityDef>(&mut self) -> &mut Self {
        self.entities.insert(
            E::NAME,
            EntityRegistration {
                declaration: E::declaration,
                factory: factory_of::<E>,
            },
        );
        self
    }

    /// Register an ordered named value set used by `enum=`/`set=` tags.
    pub fn register_enum(
        &mut self,
        name: impl Into<String>,
        values: Vec<String>,
    ) -> &mut Self {
        self.enums.insert(name.into(), values);
        self
    }

    pub fn register_mysql_pool(&mut self, name: impl Into<String>, dsn: impl Into<String>) -> &mut Self {
        self.sql.insert(name.into(), SqlSource::Dsn(dsn.into()));
        self
    }

    /// Register a pre-built relational connection (tests, custom drivers).
    pub fn register_sql_conn(&mut self, name: impl Into<String>, conn: Arc<dyn SqlConn>) -> &mut Self {
        self.sql.insert(name.into(), SqlSource::Conn(conn));
        self
    }

    /// `address` is `host:port:db`.
    pub fn register_redis(&mut self, name: impl Into<String>, address: impl Into<String>) -> &mut Self {
        self.shared
            .insert(name.into(), SharedSource::Address(address.into()));
        self
    }

    pub fn register_shared_backend(
        &mut self,
        name: impl Into<String>,
        backend: Arc<dyn KvBackend>,
    ) -> &mut Self {
        self.shared
            .insert(name.into(), SharedSource::Backend(backend));
        self
    }

    pub fn register_local_cache(&mut self, name: impl Into<String>, capacity: usize) -> &mut Self {
        self.local.insert(
            name.into(),
            LocalSettings {
                capacity,
                ttl: None,
            },
        );
        self
    }

    pub fn register_local_cache_with_ttl(
        &mut self,
        name: impl Into<String>,
        capacity: usize,
        ttl: Duration,
    ) -> &mut Self {
        self.local.insert(
            name.into(),
            LocalSettings {
                capacity,
                ttl: Some(ttl),
            },
        );
        self
    }

    pub fn register_rabbitmq(
        &mut self,
        name: impl Into<String>,
        server: impl Into<String>,
        queues: Vec<QueueSettings>,
        routers: Vec<RouterSettings>,
    ) -> &mut Self {
        self.buses.insert(
            name.into(),
            BusRegistration {
                backend: BusBackendSource::Address(server.into()),
                queues,
                routers,
            },
        );
        self
    }

    pub fn register_bus_backend(
        &mut self,
        name: impl Into<String>,
        backend: Arc<dyn BusBackend>,
        queues: Vec<QueueSettings>,
        routers: Vec<RouterSettings>,
    ) -> &mut Self {
        self.buses.insert(
            name.into(),
            BusRegistration {
                backend: BusBackendSource::Backend(backend),
                queues,
                routers,
            },
        );
        self
    }

    /// Bind a named distributed locker to a shared-cache pool.
    pub fn register_locker(
        &mut self,
        name: impl Into<String>,
        shared_pool: impl Into<String>,
    ) -> &mut Self {
        self.lockers.insert(name.into(), shared_pool.into());
        self
    }

    /// Declare a dirty-notification queue with its consumer prefetch.
    pub fn register_dirty_queue(&mut self, name: impl Into<String>, prefetch: u16) -> &mut Self {
        self.dirty_queues.insert(name.into(), prefetch);
        self
    }

    /// Compute every schema, verify all cross-references and freeze the
    /// registry.
    pub fn validate(self) -> Result<Arc<ValidatedRegistry>, SchemaError> {
        let declarations: BTreeMap<&'static str, EntityDeclaration> = self
            .entities
            .iter()
            .map(|(name, registration)| (*name, (registration.declaration)()))
            .collect();

        // Primary keys first; reference columns take the target's width.
        let mut id_kinds = BTreeMap::new();
        for (name, declaration) in &declarations {
            let id = declaration
                .fields
                .first()
                .filter(|field| field.name == "ID" && field.kind.is_unsigned_int())
                .ok_or(SchemaError::InvalidPrimaryKey { entity: *name })?;
            id_kinds.insert(*name, id.kind);
        }

        let mut schemas = BTreeMap::new();
        for (name, declaration) in &declarations {
            let schema = self.build_schema(*name, declaration, &id_kinds, &declarations)?;
            schemas.insert((*name).to_string(), Arc::new(schema));
        }

        let mut sql: BTreeMap<String, Arc<dyn SqlConn>> = BTreeMap::new();
        for (name, source) in self.sql {
            let conn: Arc<dyn SqlConn> = match source {
                SqlSource::Dsn(dsn) => {
                    Arc::new(MySqlConn::connect_lazy(name.clone(), &dsn).map_err(|err| {
                        SchemaError::InvalidPool {
                            name: name.clone(),
                            message: err.to_string(),
                        }
                    })?)
                }
                SqlSource::Conn(conn) => conn,
            };
            sql.insert(name, conn);
        }

        let mut shared = BTreeMap::new();
        for (name, source) in self.shared {
            let backend: Arc<dyn KvBackend> = match source {
                SharedSource::Address(address) => {
                    Arc::new(RedisBackend::from_address(&address).map_err(|err| {
                        SchemaError::InvalidPool {
                            name: name.clone(),
                            message: err.to_string(),
                        }
                    })?)
                }
                SharedSource::Backend(backend) => backend,
            };
            shared.insert(name.clone(), SharedCache::new(name, backend));
        }

        let local: BTreeMap<String, Arc<LocalCache>> = self
            .local
            .into_iter()
            .map(|(name, settings)| {
                let cache = Arc::new(LocalCache::new(
                    name.clone(),
                    settings.capacity,
                    settings.ttl,
                ));
                (name, cache)
            })
            .collect();

        let mut buses = BTreeMap::new();
        for (name, registration) in self.buses {
            let mut queues = registration.queues;
            for built_in in [LAZY_QUEUE, LOG_QUEUE, INVALIDATE_QUEUE] {
                if !queues.iter().any(|queue| queue.name == built_in) {
                    queues.push(QueueSettings::new(built_in).durable().prefetch(100));
                }
            }
            for (queue, prefetch) in &self.dirty_queues {
                if !queues.iter().any(|existing| existing.name == *queue) {
                    queues.push(QueueSettings::new(queue.clone()).durable().prefetch(*prefetch));
                }
            }
            let backend: Arc<dyn BusBackend> = match registration.backend {
                BusBackendSource::Address(server) => Arc::new(RabbitBackend::new(server)),
                BusBackendSource::Backend(backend) => backend,
            };
            buses.insert(
                name.clone(),
                BusClient::new(name, backend, queues, registration.routers),
            );
        }

        let mut lockers = BTreeMap::new();
        for (name, pool) in self.lockers {
            let cache = shared
                .get(&pool)
                .ok_or_else(|| SchemaError::PoolNotRegistered { name: pool.clone() })?
                .clone();
            lockers.insert(name, cache);
        }

        // Every pool a schema names must exist.
        for schema in schemas.values() {
            if !sql.contains_key(&schema.pool_name) {
                return Err(SchemaError::PoolNotRegistered {
                    name: schema.pool_name.clone(),
                });
            }
            if let Some(pool) = &schema.local_cache
                && !local.contains_key(pool)
            {
                return Err(SchemaError::PoolNotRegistered { name: pool.clone() });
            }
            if let Some(pool) = &schema.shared_cache
                && !shared.contains_key(pool)
            {
                return Err(SchemaError::PoolNotRegistered { name: pool.clone() });
            }
            if let Some(pool) = &schema.log_pool
                && !sql.contains_key(pool)
            {
                return Err(SchemaError::PoolNotRegistered { name: pool.clone() });
            }
        }

        let factories = self
            .entities
            .iter()
            .map(|(name, registration)| ((*name).to_string(), registration.factory))
            .collect();

        info!(
            target: SOURCE,
            entities = schemas.len(),
            sql_pools = sql.len(),
            shared_pools = shared.len(),
            "registry validated"
        );

        Ok(Arc::new(ValidatedRegistry {
            schemas,
            factories,
            sql,
            local,
            shared,
            buses,
            lockers,
            enums: self.enums,
        }))
    }

    fn build_schema(
        &self,
        name: &'static str,
        declaration: &EntityDeclaration,
        id_kinds: &BTreeMap<&'static str, super::FieldKind>,
        declarations: &BTreeMap<&'static str, EntityDeclaration>,
    ) -> Result<TableSchema, SchemaError> {
        // FakeDelete is re-rendered at the end of the table; to keep the
        // row image aligned with the column order it must already be the
        // last declared field.
        if let Some(position) = declaration
            .fields
            .iter()
            .position(|field| field.name == "FakeDelete")
            && position != declaration.fields.len() - 1
        {
            return Err(SchemaError::invalid_tag(
                name,
                "FakeDelete",
                "soft-delete column must be the last declared field",
            ));
        }

        let mut rendered = RenderOutput::default();
        render_fields(
            name,
            &declaration.fields,
            &self.enums,
            id_kinds,
            "",
            &mut rendered,
        )?;
        if rendered.has_fake_delete {
            push_fake_delete_column(&mut rendered);
        }

        let meta = TagSet::parse(declaration.meta_tags);
        let table_name = meta
            .get("table")
            .unwrap_or(declaration.name)
            .to_string();
        let pool_name = meta.pool("mysql").unwrap_or_else(|| "default".to_string());

        let mut ref_columns = Vec::new();
        for pending in &rendered.refs {
            let target = declarations
                .get(pending.target)
                .ok_or_else(|| SchemaError::EntityNotRegistered {
                    name: pending.target.to_string(),
                })?;
            let target_meta = TagSet::parse(target.meta_tags);
            let target_pool = target_meta
                .pool("mysql")
                .unwrap_or_else(|| "default".to_string());
            let target_table = target_meta.get("table").unwrap_or(target.name).to_string();
            ref_columns.push(RefColumn {
                column: pending.column.clone(),
                target_entity: pending.target.to_string(),
                target_table,
                foreign_key: (target_pool == pool_name).then_some(pending.on_delete),
            });
        }

        let column_names: Vec<String> =
            rendered.columns.iter().map(|c| c.name.clone()).collect();
        let mut cached_queries = BTreeMap::new();
        for query in &declaration.queries {
            cached_queries.insert(
                query.name.to_string(),
                build_cached_query(name, query, &column_names)?,
            );
        }

        let dirty_queues = meta
            .get("dirty")
            .map(|raw| raw.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();

        Ok(TableSchema {
            entity_name: name.to_string(),
            table_name,
            pool_name,
            columns: rendered.columns,
            indexes: rendered.indexes,
            ref_columns,
            cached_queries,
            has_fake_delete: rendered.has_fake_delete,
            local_cache: meta.pool("localCache"),
            shared_cache: meta.pool("redisCache"),
            log_pool: meta.pool("log"),
            dirty_queues,
        })
    }
}

fn build_cached_query(
    entity: &'static str,
    declaration: &CachedQueryDecl,
    columns: &[String],
) -> Result<CachedQueryDef, SchemaError> {
    let (query, predicate_fields) = strip_tracked_fields(declaration.template);
    let mut tracked = predicate_fields.clone();
    let order_by = if declaration.order_by.is_empty() {
        None
    } else {
        let (rendered, order_tracked) = strip_tracked_fields(declaration.order_by);
        tracked.extend(order_tracked);
        Some(rendered)
    };
    dedup_preserving_order(&mut tracked);
    let mut predicate_fields = predicate_fields;
    dedup_preserving_order(&mut predicate_fields);
    for field in &tracked {
        if !columns.iter().any(|column| column == field) {
            return Err(SchemaError::invalid_tag(
                entity,
                declaration.name,
                format!("tracked field `{field}` is not a column"),
            ));
        }
    }
    Ok(CachedQueryDef {
        name: declaration.name.to_string(),
        query,
        order_by,
        predicate_fields,
        tracked_fields: tracked,
        one: declaration.one,
        max: if declaration.max == 0 {
            DEFAULT_CACHED_QUERY_MAX
        } else {
            declaration.max
        },
    })
}

fn dedup_preserving_order(fields: &mut Vec<String>) {
    let mut seen = std::collections::BTreeSet::new();
    fields.retain(|field| seen.insert(field.clone()));
}

/// Rewrite `:Field` markers to backticked column references, collecting
/// the tracked field names.
fn strip_tracked_fields(template: &str) -> (String, Vec<String>) {
    let mut rendered = String::with_capacity(template.len());
    let mut tracked = Vec::new();
    let mut chars = template.char_indices().peekable();
    while let Some((_, ch)) = chars.next() {
        if ch != ':' {
            rendered.push(ch);
            continue;
        }
        let mut field = String::new();
        while let Some((_, next)) = chars.peek() {
            if next.is_ascii_alphanumeric() || *next == '_' {
                field.push(*next);
                chars.next();
            } else {
                break;
            }
        }
        if field.is_empty() {
            rendered.push(ch);
        } else {
            rendered.push('`');
            rendered.push_str(&field);
            rendered.push('`');
            tracked.push(field);
        }
    }
    (rendered, tracked)
}

/// The frozen registry: schemas plus the shared runtime objects.
pub struct ValidatedRegistry {
    schemas: BTreeMap<String, Arc<TableSchema>>,
    factories: BTreeMap<String, fn() -> Box<dyn Entity>>,
    sql: BTreeMap<String, Arc<dyn SqlConn>>,
    local: BTreeMap<String, Arc<LocalCache>>,
    shared: BTreeMap<String, SharedCache>,
    buses: BTreeMap<String, BusClient>,
    lockers: BTreeMap<String, SharedCache>,
    enums: BTreeMap<String, Vec<String>>,
}

impl ValidatedRegistry {
    /// New per-request engine over this registry.
    pub fn create_engine(self: &Arc<Self>) -> Engine {
        Engine::new(self.clone())
    }

    pub fn schema(&self, entity: &str) -> Result<&Arc<TableSchema>, SchemaError> {
        self.schemas
            .get(entity)
            .ok_or_else(|| SchemaError::EntityNotRegistered {
                name: entity.to_string(),
            })
    }

    pub fn schema_of<E: EntityDef>(&self) -> Result<&Arc<TableSchema>, SchemaError> {
        self.schema(E::NAME)
    }

    pub fn schemas(&self) -> impl Iterator<Item = &Arc<TableSchema>> {
        self.schemas.values()
    }

    /// Fresh boxed instance of a registered entity type.
    pub(crate) fn new_entity(&self, entity: &str) -> Result<Box<dyn Entity>, SchemaError> {
        self.factories
            .get(entity)
            .map(|factory| factory())
            .ok_or_else(|| SchemaError::EntityNotRegistered {
                name: entity.to_string(),
            })
    }

    pub fn sql_conn(&self, pool: &str) -> Result<&Arc<dyn SqlConn>, SchemaError> {
        self.sql.get(pool).ok_or_else(|| SchemaError::PoolNotRegistered {
            name: pool.to_string(),
        })
    }

    pub fn sql_pool_names(&self) -> impl Iterator<Item = &str> {
        self.sql.keys().map(String::as_str)
    }

    pub fn local_cache(&self, pool: &str) -> Result<&Arc<LocalCache>, SchemaError> {
        self.local
            .get(pool)
            .ok_or_else(|| SchemaError::PoolNotRegistered {
                name: pool.to_string(),
            })
    }

    pub fn shared_cache(&self, pool: &str) -> Result<&SharedCache, SchemaError> {
        self.shared
            .get(pool)
            .ok_or_else(|| SchemaError::PoolNotRegistered {
                name: pool.to_string(),
            })
    }

    /// The bus pool used for engine-internal queues; `default` when
    /// registered, else the only bus, else none.
    pub fn default_bus(&self) -> Option<&BusClient> {
        self.buses
            .get("default")
            .or_else(|| (self.buses.len() == 1).then(|| self.buses.values().next()).flatten())
    }

    pub fn bus(&self, pool: &str) -> Result<&BusClient, SchemaError> {
        self.buses
            .get(pool)
            .ok_or_else(|| SchemaError::PoolNotRegistered {
                name: pool.to_string(),
            })
    }

    pub fn locker_cache(&self, name: &str) -> Result<&SharedCache, SchemaError> {
        self.lockers
            .get(name)
            .ok_or_else(|| SchemaError::PoolNotRegistered {
                name: name.to_string(),
            })
    }

    pub fn enum_values(&self, name: &str) -> Option<&[String]> {
        self.enums.get(name).map(Vec::as_slice)
    }
}
