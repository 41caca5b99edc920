//! The flush pipeline.
//!
//! Tracked entities are diffed against their snapshots, grouped into a
//! minimal set of statements executed in deterministic order, and every
//! mutated row fans out to both cache layers, the dirty queues and the
//! change log. Inside a transaction the cache mutations are buffered and
//! applied only after `COMMIT`.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use metrics::histogram;
use serde_json::json;
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::cached_query::query_invalidation_keys;
use super::Engine;
use crate::bus::BusError;
use crate::cache::keys::{pack_row, row_key, MISS_MARKER};
use crate::cache::lock::{rw_read, rw_write};
use crate::entity::{dirty_bind, OnDuplicateUpdate, SqlValue, TrackedDyn};
use crate::error::StratumError;
use crate::schema::{TableSchema, INVALIDATE_QUEUE, LAZY_QUEUE, LOG_QUEUE};
use std::sync::Arc;

use super::receivers::{DirtyAction, DirtyRecord, LazyMutation, LogRecord, MutationKind};

const SOURCE: &str = "engine::flush";
const METRIC_FLUSH_MS: &str = "stratum_flush_ms";

#[derive(Debug, Clone, Copy, Default)]
pub struct FlushOptions {
    /// Publish the mutations to the lazy queue instead of applying them.
    pub lazy: bool,
    /// Wrap the statements of every touched pool in a transaction.
    pub transaction: bool,
}

impl FlushOptions {
    pub fn lazy() -> Self {
        Self {
            lazy: true,
            transaction: false,
        }
    }

    pub fn transactional() -> Self {
        Self {
            lazy: false,
            transaction: true,
        }
    }
}

/// Accumulates entities up to a limit and flushes them in batches.
///
/// With `auto_flush`, registering past the limit flushes the batch first;
/// without it, overflowing is an error the caller must handle.
pub struct BatchFlusher {
    limit: usize,
    auto_flush: bool,
    lazy: bool,
    entities: Vec<TrackedDyn>,
}

impl BatchFlusher {
    pub fn new(limit: usize, auto_flush: bool) -> Self {
        Self {
            limit: limit.max(1),
            auto_flush,
            lazy: false,
            entities: Vec::new(),
        }
    }

    /// Batches flush through the lazy queue instead of eagerly.
    pub fn new_lazy(limit: usize, auto_flush: bool) -> Self {
        Self {
            lazy: true,
            ..Self::new(limit, auto_flush)
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub async fn register<E: crate::entity::EntityDef>(
        &mut self,
        engine: &mut Engine,
        entity: &crate::entity::Tracked<E>,
    ) -> Result<(), StratumError> {
        if self.entities.len() == self.limit {
            if !self.auto_flush {
                return Err(StratumError::FlusherLimit { limit: self.limit });
            }
            self.flush(engine).await?;
        }
        self.entities.push(entity.as_dyn());
        Ok(())
    }

    /// Flush the accumulated batch through `engine`.
    pub async fn flush(&mut self, engine: &mut Engine) -> Result<(), StratumError> {
        if self.entities.is_empty() {
            return Ok(());
        }
        for handle in self.entities.drain(..) {
            engine.track_dyn(handle);
        }
        let options = if self.lazy {
            FlushOptions::lazy()
        } else {
            FlushOptions::default()
        };
        engine.flush_with(options).await
    }
}

enum Action {
    Insert,
    Update(Vec<(usize, SqlValue)>),
    SoftDelete,
    HardDelete,
}

struct FlushItem {
    handle: usize,
    schema: Arc<TableSchema>,
    action: Action,
    id: u64,
    old_row: Vec<SqlValue>,
    /// Row image as written, filled in during execution.
    new_row: Option<Vec<SqlValue>>,
    on_duplicate: Option<OnDuplicateUpdate>,
    log_meta: Option<serde_json::Value>,
}

impl FlushItem {
    fn changed_columns(&self) -> Vec<String> {
        let columns = self.schema.data_columns();
        match &self.action {
            Action::Update(bind) => bind
                .iter()
                .map(|(index, _)| columns[*index].name.clone())
                .collect(),
            _ => columns.iter().map(|column| column.name.clone()).collect(),
        }
    }

    fn dirty_action(&self) -> DirtyAction {
        match self.action {
            Action::Insert => DirtyAction::Added,
            Action::Update(_) => DirtyAction::Updated,
            Action::SoftDelete | Action::HardDelete => DirtyAction::Deleted,
        }
    }
}

impl Engine {
    /// Flush every tracked entity eagerly, outside a transaction.
    pub async fn flush(&mut self) -> Result<(), StratumError> {
        self.flush_with(FlushOptions::default()).await
    }

    /// Publish the tracked mutations to the lazy queue and return.
    pub async fn flush_lazy(&mut self) -> Result<(), StratumError> {
        self.flush_with(FlushOptions::lazy()).await
    }

    pub async fn flush_with(&mut self, options: FlushOptions) -> Result<(), StratumError> {
        let handles = self.take_tracked();
        if handles.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        let outcome = self.flush_handles(&handles, options).await;
        histogram!(METRIC_FLUSH_MS, "lazy" => if options.lazy { "true" } else { "false" })
            .record(started.elapsed().as_secs_f64() * 1000.0);
        if outcome.is_err() {
            // The caller decides what to do with the still-tracked set.
            self.restore_tracked(handles);
        }
        outcome
    }

    /// Flush under a named distributed lock; the lock is released on every
    /// exit path.
    pub async fn flush_with_lock(
        &mut self,
        locker_name: &str,
        lock_name: &str,
        ttl: Duration,
        wait: Duration,
        options: FlushOptions,
    ) -> Result<(), StratumError> {
        let locker = self.locker(locker_name)?;
        let mut lock = locker
            .obtain(lock_name, ttl, wait)
            .await?
            .ok_or_else(|| super::lock::LockError::WaitTimeout {
                name: lock_name.to_string(),
            })?;
        let outcome = self.flush_with(options).await;
        let released = lock.release().await;
        outcome?;
        released?;
        Ok(())
    }

    /// Write row images of cache-bound entities straight to the shared
    /// cache and defer the row-store write to the reconcile receiver;
    /// entities without a binding (or without an id) take the eager path.
    pub async fn flush_in_cache(&mut self) -> Result<(), StratumError> {
        let handles = self.take_tracked();
        let mut eager: Vec<TrackedDyn> = Vec::new();
        let outcome = async {
            for handle in &handles {
                let (schema, state, id) = {
                    let guard = rw_read!(handle, SOURCE, "flush_in_cache");
                    let schema = self.schema_of_dyn(&*guard)?;
                    let state = dirty_bind(&schema, &*guard);
                    (schema, state, guard.id())
                };
                let Some(pool) = schema.shared_cache.clone() else {
                    eager.push(handle.clone());
                    continue;
                };
                if id == 0 || rw_read!(handle, SOURCE, "flush_in_cache").meta().delete {
                    eager.push(handle.clone());
                    continue;
                }
                if state.bind.is_empty() {
                    continue;
                }
                let cache = self.registry().shared_cache(&pool)?.clone();
                let key = schema.cache_key(id);
                cache.set(&key, &pack_row(&state.row), None).await?;
                cache
                    .sadd(
                        crate::schema::DIRTY_RECONCILE_SET,
                        &[row_key(&schema.entity_name, id)],
                    )
                    .await?;
                let mut guard = rw_write!(handle, SOURCE, "flush_in_cache");
                let row = state.row.clone();
                guard.meta_mut().snapshot(row);
                if let Some(local_pool) = &schema.local_cache {
                    self.registry()
                        .local_cache(local_pool)?
                        .set(key, pack_row(&state.row));
                }
            }
            Ok::<_, StratumError>(())
        }
        .await;
        if let Err(error) = outcome {
            self.restore_tracked(handles);
            return Err(error);
        }
        if !eager.is_empty() {
            self.restore_tracked(eager);
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush_handles(
        &mut self,
        handles: &[TrackedDyn],
        options: FlushOptions,
    ) -> Result<(), StratumError> {
        // Phase A: diff.
        let mut items: Vec<FlushItem> = Vec::new();
        for (index, handle) in handles.iter().enumerate() {
            let guard = rw_read!(handle, SOURCE, "diff");
            let schema = self.schema_of_dyn(&*guard)?;
            let meta = guard.meta();
            if meta.delete {
                // Deleting something that never hit the store is a no-op.
                if guard.id() == 0 {
                    continue;
                }
                let action = if schema.has_fake_delete && !meta.force_delete {
                    Action::SoftDelete
                } else {
                    Action::HardDelete
                };
                items.push(FlushItem {
                    handle: index,
                    schema,
                    action,
                    id: guard.id(),
                    old_row: meta.db_data.clone(),
                    new_row: None,
                    on_duplicate: None,
                    log_meta: meta.log_meta.clone(),
                });
                continue;
            }
            let state = dirty_bind(&schema, &*guard);
            if !meta.loaded {
                items.push(FlushItem {
                    handle: index,
                    schema,
                    action: Action::Insert,
                    id: guard.id(),
                    old_row: Vec::new(),
                    new_row: None,
                    on_duplicate: meta.on_duplicate.clone(),
                    log_meta: meta.log_meta.clone(),
                });
            } else if !state.bind.is_empty() {
                items.push(FlushItem {
                    handle: index,
                    schema,
                    action: Action::Update(state.bind),
                    id: guard.id(),
                    old_row: meta.db_data.clone(),
                    new_row: None,
                    on_duplicate: None,
                    log_meta: meta.log_meta.clone(),
                });
            }
        }
        if items.is_empty() {
            return Ok(());
        }

        if options.lazy {
            return self.publish_lazy(handles, &items).await;
        }

        // Pools written by this flush, deterministic order.
        let mut pools: Vec<String> = items
            .iter()
            .map(|item| item.schema.pool_name.clone())
            .collect();
        pools.sort();
        pools.dedup();

        let mut began: Vec<String> = Vec::new();
        if options.transaction {
            for pool in &pools {
                let db = self.db(pool)?;
                if !db.in_transaction() {
                    db.begin().await?;
                    began.push(pool.clone());
                }
            }
        }

        if let Err(error) = self.execute_items(handles, &mut items).await {
            for pool in &pools {
                if let Ok(db) = self.db(pool)
                    && db.in_transaction()
                    && let Err(rollback_error) = db.rollback().await
                {
                    warn!(target: SOURCE, %pool, %rollback_error, "rollback failed");
                }
            }
            return Err(error);
        }

        // Phase D: cache coherence, buffered while a transaction is open.
        // Row keys carry the post-image into both layers; affected
        // cached-query pages are dropped from the shared cache.
        let mut immediate_local: HashMap<String, Vec<(String, String)>> = HashMap::new();
        let mut immediate_shared_sets: HashMap<String, Vec<(String, String)>> = HashMap::new();
        let mut immediate_shared_dels: HashMap<String, Vec<String>> = HashMap::new();
        let mut invalidation_keys: Vec<String> = Vec::new();
        for item in &items {
            let key = item.schema.cache_key(item.id);
            invalidation_keys.push(key.clone());
            let image = match &item.action {
                Action::SoftDelete | Action::HardDelete => MISS_MARKER.to_string(),
                _ => pack_row(item.new_row.as_deref().unwrap_or_default()),
            };
            let changed = item.changed_columns();
            let page_keys = query_invalidation_keys(
                &item.schema,
                &changed,
                (!item.old_row.is_empty()).then_some(item.old_row.as_slice()),
                item.new_row.as_deref(),
            );
            let in_transaction = self.db(&item.schema.pool_name)?.in_transaction();
            if in_transaction {
                let buffers = self.db(&item.schema.pool_name)?.post_commit_mut();
                if let Some(pool) = &item.schema.local_cache {
                    buffers
                        .local_sets
                        .push((pool.clone(), key.clone(), image.clone()));
                }
                if let Some(pool) = &item.schema.shared_cache {
                    buffers.shared_sets.push((pool.clone(), key.clone(), image));
                    for page_key in page_keys {
                        buffers.shared_deletes.push((pool.clone(), page_key));
                    }
                }
            } else {
                if let Some(pool) = &item.schema.local_cache {
                    immediate_local
                        .entry(pool.clone())
                        .or_default()
                        .push((key.clone(), image.clone()));
                }
                if let Some(pool) = &item.schema.shared_cache {
                    immediate_shared_sets
                        .entry(pool.clone())
                        .or_default()
                        .push((key.clone(), image));
                    immediate_shared_dels
                        .entry(pool.clone())
                        .or_default()
                        .extend(page_keys);
                }
            }
        }

        // Phase E: change log, then dirty notifications.
        self.write_logs(&items).await?;
        self.notify_dirty(&items).await;

        for pool in began {
            let buffered = self.db(&pool)?.commit().await?;
            self.apply_post_commit(buffered).await;
        }

        // Local set first, then the shared layer.
        for (pool, pairs) in immediate_local {
            self.registry().local_cache(&pool)?.mset(&pairs);
        }
        for (pool, pairs) in immediate_shared_sets {
            let cache = self.registry().shared_cache(&pool)?.clone();
            if let Err(error) = cache.mset(&pairs).await {
                warn!(target: SOURCE, %pool, %error, "shared row set failed, queueing repair");
                self.queue_repair(pairs.into_iter().map(|(key, _)| key).collect())
                    .await;
            }
        }
        for (pool, keys) in immediate_shared_dels {
            if keys.is_empty() {
                continue;
            }
            let cache = self.registry().shared_cache(&pool)?.clone();
            if let Err(error) = cache.del(&keys).await {
                warn!(target: SOURCE, %pool, %error, "shared invalidation failed, queueing repair");
                self.queue_repair(keys).await;
            }
        }

        // Cross-process invalidations for lazy consumers.
        if let Some(bus) = self.registry().default_bus() {
            let bus = bus.clone();
            for key in invalidation_keys {
                if let Err(error) = bus.publish(INVALIDATE_QUEUE, key.as_bytes()).await {
                    warn!(target: SOURCE, %key, %error, "invalidation publish failed");
                }
            }
        }

        debug!(target: SOURCE, rows = items.len(), "flush complete");
        Ok(())
    }

    /// Phase B and C: statements in deterministic order, then generated
    /// ids and refreshed snapshots.
    async fn execute_items(
        &mut self,
        handles: &[TrackedDyn],
        items: &mut [FlushItem],
    ) -> Result<(), StratumError> {
        let order = insert_order(items);

        // Inserts: one multi-row statement per (pool, table, duplicate
        // clause), parents before children.
        let mut insert_groups: BTreeMap<(String, usize, String, String), Vec<usize>> =
            BTreeMap::new();
        for (position, item) in items.iter().enumerate() {
            if matches!(item.action, Action::Insert) {
                let rank = order.get(&item.schema.entity_name).copied().unwrap_or(0);
                let clause = item
                    .on_duplicate
                    .as_ref()
                    .map(|dup| dup.assignments.clone())
                    .unwrap_or_default();
                insert_groups
                    .entry((
                        item.schema.pool_name.clone(),
                        rank,
                        item.schema.table_name.clone(),
                        clause,
                    ))
                    .or_default()
                    .push(position);
            }
        }
        for ((pool, _, _, _), members) in &insert_groups {
            let schema = items[members[0]].schema.clone();
            let mut params: Vec<SqlValue> = Vec::new();
            let mut rows: Vec<Vec<SqlValue>> = Vec::new();
            for position in members {
                // Re-read at execution time so references to entities
                // inserted earlier in this flush carry their fresh ids.
                let row = rw_read!(&handles[items[*position].handle], SOURCE, "insert").to_row();
                params.extend(row.iter().cloned());
                rows.push(row);
            }
            let on_duplicate = items[members[0]].on_duplicate.clone();
            if let Some(dup) = &on_duplicate {
                params.extend(dup.params.iter().cloned());
            }
            let sql = insert_sql(&schema, rows.len(), on_duplicate.as_ref());
            let result = self.db(pool)?.exec(&sql, &params).await?;
            let mut next_id = result.last_insert_id;
            for (offset, position) in members.iter().enumerate() {
                let item = &mut items[*position];
                let mut guard = rw_write!(&handles[item.handle], SOURCE, "insert");
                if guard.id() == 0 {
                    guard.set_id(next_id);
                    next_id += 1;
                }
                item.id = guard.id();
                guard.meta_mut().snapshot(rows[offset].clone());
                item.new_row = Some(rows[offset].clone());
            }
        }

        // Updates: one parameterized statement per row.
        let mut update_positions: Vec<usize> = items
            .iter()
            .enumerate()
            .filter(|(_, item)| matches!(item.action, Action::Update(_)))
            .map(|(position, _)| position)
            .collect();
        update_positions.sort_by(|a, b| {
            let left = &items[*a];
            let right = &items[*b];
            (&left.schema.pool_name, &left.schema.table_name, left.id).cmp(&(
                &right.schema.pool_name,
                &right.schema.table_name,
                right.id,
            ))
        });
        for position in update_positions {
            let (sql, params, new_row) = {
                let item = &items[position];
                let Action::Update(bind) = &item.action else {
                    unreachable!()
                };
                let columns: Vec<String> = item
                    .bind_columns()
                    .iter()
                    .map(|column| column.to_string())
                    .collect();
                let mut params: Vec<SqlValue> =
                    bind.iter().map(|(_, value)| value.clone()).collect();
                params.push(SqlValue::UInt(item.id));
                let mut new_row = item.old_row.clone();
                for (index, value) in bind {
                    if *index < new_row.len() {
                        new_row[*index] = value.clone();
                    }
                }
                (update_sql(&item.schema, &columns), params, new_row)
            };
            let pool = items[position].schema.pool_name.clone();
            self.db(&pool)?.exec(&sql, &params).await?;
            let item = &mut items[position];
            let mut guard = rw_write!(&handles[item.handle], SOURCE, "update");
            guard.meta_mut().snapshot(new_row.clone());
            item.new_row = Some(new_row);
        }

        // Deletes: collapsed per table, soft-delete rewritten in place.
        let mut delete_groups: BTreeMap<(String, String, bool), Vec<usize>> = BTreeMap::new();
        for (position, item) in items.iter().enumerate() {
            match item.action {
                Action::SoftDelete => {
                    delete_groups
                        .entry((
                            item.schema.pool_name.clone(),
                            item.schema.table_name.clone(),
                            true,
                        ))
                        .or_default()
                        .push(position);
                }
                Action::HardDelete => {
                    delete_groups
                        .entry((
                            item.schema.pool_name.clone(),
                            item.schema.table_name.clone(),
                            false,
                        ))
                        .or_default()
                        .push(position);
                }
                _ => {}
            }
        }
        for ((pool, _, soft), members) in &delete_groups {
            let schema = items[members[0]].schema.clone();
            let mut ids: Vec<u64> = members.iter().map(|position| items[*position].id).collect();
            ids.sort_unstable();
            let params: Vec<SqlValue> = ids.iter().map(|id| SqlValue::UInt(*id)).collect();
            let sql = if *soft {
                soft_delete_sql(&schema, ids.len())
            } else {
                delete_sql(&schema, ids.len())
            };
            self.db(pool)?.exec(&sql, &params).await?;
            for position in members {
                let item = &items[*position];
                rw_write!(&handles[item.handle], SOURCE, "delete")
                    .meta_mut()
                    .reset();
            }
        }
        Ok(())
    }

    async fn publish_lazy(
        &mut self,
        handles: &[TrackedDyn],
        items: &[FlushItem],
    ) -> Result<(), StratumError> {
        let bus = self
            .registry()
            .default_bus()
            .ok_or(BusError::NotConfigured)?
            .clone();
        for item in items {
            let mutation = match &item.action {
                Action::Insert => LazyMutation {
                    entity: item.schema.entity_name.clone(),
                    id: item.id,
                    action: MutationKind::Insert,
                    row: Some(rw_read!(&handles[item.handle], SOURCE, "lazy").to_row()),
                    bind: None,
                },
                Action::Update(bind) => {
                    let columns = item.schema.data_columns();
                    LazyMutation {
                        entity: item.schema.entity_name.clone(),
                        id: item.id,
                        action: MutationKind::Update,
                        row: None,
                        bind: Some(
                            bind.iter()
                                .map(|(index, value)| {
                                    (columns[*index].name.clone(), value.clone())
                                })
                                .collect(),
                        ),
                    }
                }
                Action::SoftDelete | Action::HardDelete => LazyMutation {
                    entity: item.schema.entity_name.clone(),
                    id: item.id,
                    action: MutationKind::Delete,
                    row: None,
                    bind: None,
                },
            };
            let payload = serde_json::to_vec(&mutation)
                .map_err(|err| BusError::payload(err.to_string()))?;
            bus.publish(LAZY_QUEUE, &payload).await?;
        }
        debug!(target: SOURCE, mutations = items.len(), "lazy flush published");
        Ok(())
    }

    async fn write_logs(&mut self, items: &[FlushItem]) -> Result<(), StratumError> {
        for item in items {
            let Some(log_pool) = item.schema.log_pool.clone() else {
                continue;
            };
            let columns = item.schema.data_columns();
            let data = match &item.action {
                Action::SoftDelete | Action::HardDelete => None,
                Action::Update(bind) => Some(json!(bind
                    .iter()
                    .map(|(index, value)| (columns[*index].name.clone(), value.clone()))
                    .collect::<BTreeMap<_, _>>())),
                Action::Insert => item.new_row.as_ref().map(|row| {
                    json!(columns
                        .iter()
                        .zip(row)
                        .map(|(column, value)| (column.name.clone(), value.clone()))
                        .collect::<BTreeMap<_, _>>())
                }),
            };
            let meta = merge_log_meta(self.log_meta(), item.log_meta.as_ref());
            let record = LogRecord {
                pool: log_pool.clone(),
                table: item.schema.log_table_name(),
                entity_id: item.id,
                added_at: now_datetime(),
                meta,
                data,
            };
            if let Some(bus) = self.registry().default_bus() {
                let bus = bus.clone();
                let payload = serde_json::to_vec(&record)
                    .map_err(|err| BusError::payload(err.to_string()))?;
                bus.publish(LOG_QUEUE, &payload).await?;
            } else {
                self.insert_log_row(&record).await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn insert_log_row(&mut self, record: &LogRecord) -> Result<(), StratumError> {
        let sql = format!(
            "INSERT INTO `{}`(`entity_id`,`added_at`,`meta`,`data`) VALUES (?,?,?,?)",
            record.table
        );
        let params = vec![
            SqlValue::UInt(record.entity_id),
            SqlValue::Str(record.added_at.clone()),
            record
                .meta
                .as_ref()
                .map(|meta| SqlValue::Str(meta.to_string()))
                .unwrap_or(SqlValue::Null),
            record
                .data
                .as_ref()
                .map(|data| SqlValue::Str(data.to_string()))
                .unwrap_or(SqlValue::Null),
        ];
        self.db(&record.pool)?.exec(&sql, &params).await?;
        Ok(())
    }

    async fn notify_dirty(&mut self, items: &[FlushItem]) {
        let Some(bus) = self.registry().default_bus().cloned() else {
            return;
        };
        for item in items {
            for queue in &item.schema.dirty_queues {
                let record = DirtyRecord {
                    entity: item.schema.entity_name.clone(),
                    id: item.id,
                    action: item.dirty_action(),
                };
                let Ok(payload) = serde_json::to_vec(&record) else {
                    continue;
                };
                if let Err(error) = bus.publish(queue, &payload).await {
                    warn!(target: SOURCE, %queue, %error, "dirty notification failed");
                }
            }
        }
    }
}

impl FlushItem {
    fn bind_columns(&self) -> Vec<&str> {
        let columns = self.schema.data_columns();
        match &self.action {
            Action::Update(bind) => bind
                .iter()
                .map(|(index, _)| columns[*index].name.as_str())
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn merge_log_meta(
    engine_meta: Option<&serde_json::Value>,
    entity_meta: Option<&serde_json::Value>,
) -> Option<serde_json::Value> {
    match (engine_meta, entity_meta) {
        (None, None) => None,
        (Some(meta), None) | (None, Some(meta)) => Some(meta.clone()),
        (Some(engine_meta), Some(entity_meta)) => {
            let mut merged = engine_meta.clone();
            if let (Some(base), Some(extra)) = (merged.as_object_mut(), entity_meta.as_object()) {
                for (key, value) in extra {
                    base.insert(key.clone(), value.clone());
                }
                Some(merged)
            } else {
                Some(entity_meta.clone())
            }
        }
    }
}

pub(crate) fn now_datetime() -> String {
    let now = OffsetDateTime::now_utc();
    SqlValue::from_datetime(time::PrimitiveDateTime::new(now.date(), now.time()))
        .as_str()
        .unwrap_or_default()
        .to_string()
}

/// Parent tables insert before children: rank is the longest reference
/// chain to a root among the schemas being inserted.
fn insert_order(items: &[FlushItem]) -> HashMap<String, usize> {
    let mut schemas: HashMap<String, &TableSchema> = HashMap::new();
    for item in items {
        if matches!(item.action, Action::Insert) {
            schemas.insert(item.schema.entity_name.clone(), item.schema.as_ref());
        }
    }
    let mut ranks: HashMap<String, usize> = HashMap::new();
    fn rank_of(
        name: &str,
        schemas: &HashMap<String, &TableSchema>,
        ranks: &mut HashMap<String, usize>,
        in_progress: &mut Vec<String>,
    ) -> usize {
        if let Some(rank) = ranks.get(name) {
            return *rank;
        }
        // Reference cycles insert in declaration order.
        if in_progress.iter().any(|entry| entry == name) {
            return 0;
        }
        let Some(schema) = schemas.get(name) else {
            return 0;
        };
        in_progress.push(name.to_string());
        let rank = schema
            .ref_columns
            .iter()
            .filter(|reference| schemas.contains_key(&reference.target_entity))
            .map(|reference| rank_of(&reference.target_entity, schemas, ranks, in_progress) + 1)
            .max()
            .unwrap_or(0);
        in_progress.pop();
        ranks.insert(name.to_string(), rank);
        rank
    }
    let names: Vec<String> = schemas.keys().cloned().collect();
    for name in names {
        let mut in_progress = Vec::new();
        rank_of(&name, &schemas, &mut ranks, &mut in_progress);
    }
    ranks
}

fn insert_sql(schema: &TableSchema, rows: usize, on_duplicate: Option<&OnDuplicateUpdate>) -> String {
    let columns: Vec<String> = schema
        .data_columns()
        .iter()
        .map(|column| format!("`{}`", column.name))
        .collect();
    let placeholders = vec!["?"; columns.len()].join(",");
    let values = vec![format!("({placeholders})"); rows].join(",");
    let mut sql = format!(
        "INSERT INTO `{}`({}) VALUES {}",
        schema.table_name,
        columns.join(","),
        values
    );
    if let Some(dup) = on_duplicate {
        sql.push_str(" ON DUPLICATE KEY UPDATE ");
        sql.push_str(&dup.assignments);
    }
    sql
}

fn update_sql(schema: &TableSchema, columns: &[String]) -> String {
    let assignments: Vec<String> = columns
        .iter()
        .map(|column| format!("`{column}` = ?"))
        .collect();
    format!(
        "UPDATE `{}` SET {} WHERE `ID` = ?",
        schema.table_name,
        assignments.join(", ")
    )
}

fn delete_sql(schema: &TableSchema, rows: usize) -> String {
    let placeholders = vec!["?"; rows].join(",");
    format!(
        "DELETE FROM `{}` WHERE `ID` IN ({placeholders})",
        schema.table_name
    )
}

fn soft_delete_sql(schema: &TableSchema, rows: usize) -> String {
    let placeholders = vec!["?"; rows].join(",");
    format!(
        "UPDATE `{}` SET `FakeDelete` = 1 WHERE `ID` IN ({placeholders})",
        schema.table_name
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, TableSchema};
    use std::collections::BTreeMap;

    fn schema(name: &str, columns: &[&str]) -> TableSchema {
        let mut all = vec![ColumnDef {
            name: "ID".to_string(),
            definition: "`ID` bigint(20) unsigned NOT NULL".to_string(),
            nullable: false,
        }];
        all.extend(columns.iter().map(|column| ColumnDef {
            name: (*column).to_string(),
            definition: format!("`{column}` varchar(255) DEFAULT NULL"),
            nullable: true,
        }));
        TableSchema {
            entity_name: name.to_string(),
            table_name: name.to_string(),
            pool_name: "default".to_string(),
            columns: all,
            indexes: BTreeMap::new(),
            ref_columns: Vec::new(),
            cached_queries: BTreeMap::new(),
            has_fake_delete: false,
            local_cache: None,
            shared_cache: None,
            log_pool: None,
            dirty_queues: Vec::new(),
        }
    }

    #[test]
    fn insert_collapses_rows() {
        let schema = schema("User", &["Name", "Age"]);
        assert_eq!(
            insert_sql(&schema, 3, None),
            "INSERT INTO `User`(`Name`,`Age`) VALUES (?,?),(?,?),(?,?)"
        );
    }

    #[test]
    fn insert_with_duplicate_clause() {
        let schema = schema("User", &["Name"]);
        let dup = OnDuplicateUpdate {
            assignments: "`Name` = ?".to_string(),
            params: vec![SqlValue::Str("Ada".into())],
        };
        assert_eq!(
            insert_sql(&schema, 1, Some(&dup)),
            "INSERT INTO `User`(`Name`) VALUES (?) ON DUPLICATE KEY UPDATE `Name` = ?"
        );
    }

    #[test]
    fn update_binds_only_changed_columns() {
        let schema = schema("User", &["Name", "Age"]);
        assert_eq!(
            update_sql(&schema, &["Age".to_string()]),
            "UPDATE `User` SET `Age` = ? WHERE `ID` = ?"
        );
    }

    #[test]
    fn delete_statements() {
        let schema = schema("Post", &["Title"]);
        assert_eq!(
            delete_sql(&schema, 2),
            "DELETE FROM `Post` WHERE `ID` IN (?,?)"
        );
        assert_eq!(
            soft_delete_sql(&schema, 1),
            "UPDATE `Post` SET `FakeDelete` = 1 WHERE `ID` IN (?)"
        );
    }
}
