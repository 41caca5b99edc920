//! Asynchronous receivers over the bus queues.
//!
//! - lazy-flush: applies serialized mutations through the eager pipeline
//! - log: appends change-log rows to their log pool
//! - dirty: hands `{entity, id, action}` notifications to user handlers
//! - cache-reconcile: drains the `flush_in_cache` set, repairing drift
//!   between the shared cache and the row store, plus the invalidation
//!   repair queue
//!
//! Every receiver batches through the bus consumer and acknowledges a
//! batch only after it was fully applied.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::Engine;
use crate::bus::{BusClient, BusError, HandlerError};
use crate::cache::keys::{pack_row, parse_row_key, row_key, unpack_row, MISS_MARKER};
use crate::entity::SqlValue;
use crate::error::StratumError;
use crate::schema::{
    TableSchema, DIRTY_RECONCILE_SET, INVALIDATE_QUEUE, LAZY_QUEUE, LOG_QUEUE,
};

const SOURCE: &str = "engine::receivers";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

/// One deferred mutation as published by `flush_lazy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LazyMutation {
    pub entity: String,
    pub id: u64,
    pub action: MutationKind,
    /// Full row image, declaration order; inserts only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<Vec<SqlValue>>,
    /// Changed columns; updates only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<BTreeMap<String, SqlValue>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirtyAction {
    Added,
    Updated,
    Deleted,
}

/// Dirty notification delivered to user handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirtyRecord {
    pub entity: String,
    pub id: u64,
    pub action: DirtyAction,
}

/// One change-log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub pool: String,
    pub table: String,
    pub entity_id: u64,
    pub added_at: String,
    pub meta: Option<serde_json::Value>,
    pub data: Option<serde_json::Value>,
}

/// Applies lazy mutations through the eager write path.
pub struct LazyFlushReceiver {
    engine: Engine,
}

impl LazyFlushReceiver {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Process whatever is queued right now, then return.
    pub async fn digest(&mut self) -> Result<usize, StratumError> {
        self.run_inner(true).await
    }

    /// Consume until the queue source fails.
    pub async fn run(&mut self) -> Result<(), StratumError> {
        self.run_inner(false).await.map(|_| ())
    }

    async fn run_inner(&mut self, once: bool) -> Result<usize, StratumError> {
        let bus = self
            .engine
            .registry()
            .default_bus()
            .ok_or(BusError::NotConfigured)?
            .clone();
        let mut consumer = bus.consumer(LAZY_QUEUE, "lazy_flush").await?;
        if once {
            consumer.disable_loop();
        }
        let mut applied = 0;
        while let Some(batch) = consumer.next_batch().await? {
            for body in &batch {
                let mutation: LazyMutation = serde_json::from_slice(body)
                    .map_err(|err| BusError::payload(err.to_string()))?;
                self.engine.apply_lazy(mutation).await?;
                applied += 1;
            }
            consumer.ack().await?;
            if once {
                break;
            }
        }
        info!(target: SOURCE, applied, "lazy flush digest complete");
        Ok(applied)
    }
}

/// Writes queued change-log records into their log pools.
pub struct LogReceiver {
    engine: Engine,
}

impl LogReceiver {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub async fn digest(&mut self) -> Result<usize, StratumError> {
        self.run_inner(true).await
    }

    pub async fn run(&mut self) -> Result<(), StratumError> {
        self.run_inner(false).await.map(|_| ())
    }

    async fn run_inner(&mut self, once: bool) -> Result<usize, StratumError> {
        let bus = self
            .engine
            .registry()
            .default_bus()
            .ok_or(BusError::NotConfigured)?
            .clone();
        let mut consumer = bus.consumer(LOG_QUEUE, "log_receiver").await?;
        if once {
            consumer.disable_loop();
        }
        let mut written = 0;
        while let Some(batch) = consumer.next_batch().await? {
            for body in &batch {
                let record: LogRecord = serde_json::from_slice(body)
                    .map_err(|err| BusError::payload(err.to_string()))?;
                self.engine.insert_log_row(&record).await?;
                written += 1;
            }
            consumer.ack().await?;
            if once {
                break;
            }
        }
        Ok(written)
    }
}

/// Delivers dirty notifications from one named queue to a user handler.
pub struct DirtyReceiver {
    bus: BusClient,
    queue: String,
}

impl DirtyReceiver {
    pub fn new(engine: &Engine, queue: impl Into<String>) -> Result<Self, StratumError> {
        let bus = engine
            .registry()
            .default_bus()
            .ok_or(BusError::NotConfigured)?
            .clone();
        Ok(Self {
            bus,
            queue: queue.into(),
        })
    }

    /// Process the currently queued notifications, then return.
    pub async fn digest<H>(&mut self, handler: H) -> Result<usize, StratumError>
    where
        H: FnMut(Vec<DirtyRecord>) -> Result<(), HandlerError>,
    {
        self.run_inner(true, handler).await
    }

    pub async fn run<H>(&mut self, handler: H) -> Result<(), StratumError>
    where
        H: FnMut(Vec<DirtyRecord>) -> Result<(), HandlerError>,
    {
        self.run_inner(false, handler).await.map(|_| ())
    }

    async fn run_inner<H>(&mut self, once: bool, mut handler: H) -> Result<usize, StratumError>
    where
        H: FnMut(Vec<DirtyRecord>) -> Result<(), HandlerError>,
    {
        let mut consumer = self.bus.consumer(&self.queue, "dirty_receiver").await?;
        if once {
            consumer.disable_loop();
        }
        let mut delivered = 0;
        while let Some(batch) = consumer.next_batch().await? {
            let mut records = Vec::with_capacity(batch.len());
            for body in &batch {
                let record: DirtyRecord = serde_json::from_slice(body)
                    .map_err(|err| BusError::payload(err.to_string()))?;
                records.push(record);
            }
            delivered += records.len();
            handler(records).map_err(BusError::Handler)?;
            consumer.ack().await?;
            if once {
                break;
            }
        }
        Ok(delivered)
    }
}

/// Repairs drift left behind by `flush_in_cache` and failed
/// invalidations.
pub struct CacheReconcileReceiver {
    engine: Engine,
    shared_pool: String,
}

impl CacheReconcileReceiver {
    pub fn new(engine: Engine, shared_pool: impl Into<String>) -> Self {
        Self {
            engine,
            shared_pool: shared_pool.into(),
        }
    }

    /// Size of the reconcile backlog.
    pub async fn backlog(&self) -> Result<u64, StratumError> {
        let cache = self
            .engine
            .registry()
            .shared_cache(&self.shared_pool)?
            .clone();
        Ok(cache.scard(DIRTY_RECONCILE_SET).await?)
    }

    /// Drain the reconcile set: for each `<Type>:<id>` member compare the
    /// cached image against the row store and write the difference back
    /// to the store. A failing member is re-queued before the error
    /// surfaces.
    pub async fn digest(&mut self) -> Result<usize, StratumError> {
        let cache = self
            .engine
            .registry()
            .shared_cache(&self.shared_pool)?
            .clone();
        let mut reconciled = 0;
        while let Some(member) = cache.spop(DIRTY_RECONCILE_SET).await? {
            let Some((entity, id)) = parse_row_key(&member) else {
                warn!(target: SOURCE, %member, "malformed reconcile member dropped");
                continue;
            };
            let entity = entity.to_string();
            if let Err(error) = self.reconcile_one(&entity, id).await {
                cache.sadd(DIRTY_RECONCILE_SET, &[member]).await?;
                return Err(error);
            }
            reconciled += 1;
        }
        Ok(reconciled)
    }

    async fn reconcile_one(&mut self, entity: &str, id: u64) -> Result<(), StratumError> {
        let schema = self.engine.registry().schema(entity)?.clone();
        let cache = self
            .engine
            .registry()
            .shared_cache(&self.shared_pool)?
            .clone();
        let key = schema.cache_key(id);
        let Some(packed) = cache.get(&key).await? else {
            return Ok(());
        };
        let Some(image) = unpack_row(&packed) else {
            return Ok(());
        };
        let stored = self.engine.fetch_row_direct(&schema, id).await?;
        let Some(stored) = stored else {
            // The row vanished from the store; the cached image is stale.
            cache.del(&[key]).await?;
            return Ok(());
        };
        let columns = schema.data_columns();
        let bind: Vec<(usize, SqlValue)> = image
            .iter()
            .enumerate()
            .filter(|(index, value)| {
                stored
                    .get(*index)
                    .is_none_or(|current| !current.eq_loose(value))
            })
            .map(|(index, value)| (index, value.clone()))
            .collect();
        if bind.is_empty() {
            return Ok(());
        }
        let assignments: Vec<String> = bind
            .iter()
            .map(|(index, _)| format!("`{}` = ?", columns[*index].name))
            .collect();
        let mut params: Vec<SqlValue> = bind.iter().map(|(_, value)| value.clone()).collect();
        params.push(SqlValue::UInt(id));
        let sql = format!(
            "UPDATE `{}` SET {} WHERE `ID` = ?",
            schema.table_name,
            assignments.join(", ")
        );
        self.engine.db(&schema.pool_name)?.exec(&sql, &params).await?;
        let changed: Vec<String> = bind
            .iter()
            .map(|(index, _)| columns[*index].name.clone())
            .collect();
        self.engine
            .invalidate_row_queries(&schema, &changed, Some(&stored), Some(&image))
            .await;
        debug!(target: SOURCE, entity, id, columns = changed.len(), "reconciled");
        Ok(())
    }

    /// Consume `<Type>:<id>` keys from the invalidation queue and drop
    /// them from both cache layers.
    pub async fn drain_invalidations(&mut self) -> Result<usize, StratumError> {
        let bus = self
            .engine
            .registry()
            .default_bus()
            .ok_or(BusError::NotConfigured)?
            .clone();
        let mut consumer = bus.consumer(INVALIDATE_QUEUE, "cache_reconcile").await?;
        consumer.disable_loop();
        let mut dropped = 0;
        while let Some(batch) = consumer.next_batch().await? {
            for body in &batch {
                let Ok(key) = std::str::from_utf8(body) else {
                    continue;
                };
                let Some((entity, _)) = parse_row_key(key) else {
                    continue;
                };
                let Ok(schema) = self.engine.registry().schema(entity) else {
                    continue;
                };
                let schema = schema.clone();
                if let Some(pool) = &schema.local_cache
                    && let Ok(local) = self.engine.registry().local_cache(pool)
                {
                    local.remove(&[key.to_string()]);
                }
                if let Some(pool) = &schema.shared_cache
                    && let Ok(shared) = self.engine.registry().shared_cache(pool)
                {
                    shared.clone().del(&[key.to_string()]).await?;
                }
                dropped += 1;
            }
            consumer.ack().await?;
            break;
        }
        Ok(dropped)
    }
}

impl Engine {
    /// Apply one deserialized lazy mutation through the eager path.
    pub(crate) async fn apply_lazy(&mut self, mutation: LazyMutation) -> Result<(), StratumError> {
        let schema = self.registry().schema(&mutation.entity)?.clone();
        match mutation.action {
            MutationKind::Insert => {
                let row = mutation.row.unwrap_or_default();
                let columns: Vec<String> = schema
                    .data_columns()
                    .iter()
                    .map(|column| format!("`{}`", column.name))
                    .collect();
                let placeholders = vec!["?"; columns.len()].join(",");
                let sql = format!(
                    "INSERT INTO `{}`({}) VALUES ({placeholders})",
                    schema.table_name,
                    columns.join(",")
                );
                let result = self.db(&schema.pool_name)?.exec(&sql, &row).await?;
                let id = if mutation.id != 0 {
                    mutation.id
                } else {
                    result.last_insert_id
                };
                let changed: Vec<String> = schema
                    .data_columns()
                    .iter()
                    .map(|column| column.name.clone())
                    .collect();
                self.apply_row_coherence(&schema, id, Some(&row), None, Some(&row), &changed)
                    .await;
            }
            MutationKind::Update => {
                let bind = mutation.bind.unwrap_or_default();
                if bind.is_empty() {
                    return Ok(());
                }
                let old = self.fetch_row_direct(&schema, mutation.id).await?;
                let mut assignments = Vec::new();
                let mut params = Vec::new();
                for (column, value) in &bind {
                    assignments.push(format!("`{column}` = ?"));
                    params.push(value.clone());
                }
                params.push(SqlValue::UInt(mutation.id));
                let sql = format!(
                    "UPDATE `{}` SET {} WHERE `ID` = ?",
                    schema.table_name,
                    assignments.join(", ")
                );
                self.db(&schema.pool_name)?.exec(&sql, &params).await?;
                let new = old.clone().map(|mut row| {
                    for (column, value) in &bind {
                        if let Some(index) = schema.column_index(column) {
                            row[index] = value.clone();
                        }
                    }
                    row
                });
                let changed: Vec<String> = bind.keys().cloned().collect();
                self.apply_row_coherence(
                    &schema,
                    mutation.id,
                    new.as_deref(),
                    old.as_deref(),
                    new.as_deref(),
                    &changed,
                )
                .await;
            }
            MutationKind::Delete => {
                let old = self.fetch_row_direct(&schema, mutation.id).await?;
                let sql = if schema.has_fake_delete {
                    format!(
                        "UPDATE `{}` SET `FakeDelete` = 1 WHERE `ID` IN (?)",
                        schema.table_name
                    )
                } else {
                    format!("DELETE FROM `{}` WHERE `ID` IN (?)", schema.table_name)
                };
                self.db(&schema.pool_name)?
                    .exec(&sql, &[SqlValue::UInt(mutation.id)])
                    .await?;
                let changed: Vec<String> = schema
                    .data_columns()
                    .iter()
                    .map(|column| column.name.clone())
                    .collect();
                self.apply_row_coherence(&schema, mutation.id, None, old.as_deref(), None, &changed)
                    .await;
            }
        }
        Ok(())
    }

    /// Read a row straight from the store, bypassing both caches.
    pub(crate) async fn fetch_row_direct(
        &mut self,
        schema: &TableSchema,
        id: u64,
    ) -> Result<Option<Vec<SqlValue>>, StratumError> {
        let columns: Vec<String> = schema
            .data_columns()
            .iter()
            .map(|column| format!("`{}`", column.name))
            .collect();
        let sql = format!(
            "SELECT {} FROM `{}` WHERE `ID` = ?",
            columns.join(","),
            schema.table_name
        );
        Ok(self
            .db(&schema.pool_name)?
            .query_row(&sql, &[SqlValue::UInt(id)])
            .await?)
    }

    /// Immediate cache coherence for one mutated row: the post-image
    /// lands in both layers and the affected query pages are dropped.
    pub(crate) async fn apply_row_coherence(
        &mut self,
        schema: &TableSchema,
        id: u64,
        image: Option<&[SqlValue]>,
        old_row: Option<&[SqlValue]>,
        new_row: Option<&[SqlValue]>,
        changed: &[String],
    ) {
        let key = row_key(&schema.entity_name, id);
        let packed = match image {
            Some(row) => pack_row(row),
            None => MISS_MARKER.to_string(),
        };
        if let Some(pool) = &schema.local_cache
            && let Ok(local) = self.registry().local_cache(pool)
        {
            local.set(&key, packed.clone());
        }
        if let Some(pool) = &schema.shared_cache
            && let Ok(shared) = self.registry().shared_cache(pool)
        {
            let shared = shared.clone();
            if let Err(error) = shared.set(&key, &packed, None).await {
                warn!(target: SOURCE, %error, "row image set failed, queueing repair");
                self.queue_repair(vec![key.clone()]).await;
            }
            let keys = super::cached_query::query_invalidation_keys(
                schema, changed, old_row, new_row,
            );
            if !keys.is_empty()
                && let Err(error) = shared.del(&keys).await
            {
                warn!(target: SOURCE, %error, "invalidation failed, queueing repair");
                self.queue_repair(keys).await;
            }
        }
    }

    pub(crate) async fn invalidate_row_queries(
        &mut self,
        schema: &TableSchema,
        changed: &[String],
        old_row: Option<&[SqlValue]>,
        new_row: Option<&[SqlValue]>,
    ) {
        let Some(pool) = &schema.shared_cache else {
            return;
        };
        let Ok(shared) = self.registry().shared_cache(pool) else {
            return;
        };
        let shared = shared.clone();
        let keys =
            super::cached_query::query_invalidation_keys(schema, changed, old_row, new_row);
        if keys.is_empty() {
            return;
        }
        if let Err(error) = shared.del(&keys).await {
            warn!(target: SOURCE, %error, "query invalidation failed, queueing repair");
            self.queue_repair(keys).await;
        }
    }
}
