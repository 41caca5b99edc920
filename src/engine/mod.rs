//! Per-request engine handle.
//!
//! An [`Engine`] owns its tracked-entity list and per-pool transaction
//! state while sharing the validated registry, connection pools, caches
//! and bus clients with every other engine in the process. Engines are
//! cheap to create; make one per logical request or worker.

mod cached_query;
mod flush;
mod loader;
mod lock;
mod preload;
mod receivers;

pub use flush::{BatchFlusher, FlushOptions};
pub use lock::{Lock, LockError, Locker};
pub use receivers::{
    CacheReconcileReceiver, DirtyAction, DirtyReceiver, DirtyRecord, LazyFlushReceiver,
    LazyMutation, LogReceiver, LogRecord, MutationKind,
};

use std::collections::HashMap;
use std::sync::Arc;

use crate::db::{Db, PostCommit};
use crate::entity::{dirty_bind, Entity, EntityDef, Tracked, TrackedDyn};
use crate::error::StratumError;
use crate::migrate::{plan_alters, Alter};
use crate::schema::{ValidatedRegistry, INVALIDATE_QUEUE};

const SOURCE: &str = "engine";

pub struct Engine {
    registry: Arc<ValidatedRegistry>,
    dbs: HashMap<String, Db>,
    tracked: Vec<TrackedDyn>,
    log_meta: Option<serde_json::Value>,
}

impl Engine {
    pub(crate) fn new(registry: Arc<ValidatedRegistry>) -> Self {
        Self {
            registry,
            dbs: HashMap::new(),
            tracked: Vec::new(),
            log_meta: None,
        }
    }

    pub fn registry(&self) -> &Arc<ValidatedRegistry> {
        &self.registry
    }

    /// Relational handle for one pool, created on first use.
    pub fn db(&mut self, pool: &str) -> Result<&mut Db, StratumError> {
        if !self.dbs.contains_key(pool) {
            let conn = self.registry.sql_conn(pool)?.clone();
            self.dbs.insert(pool.to_string(), Db::new(pool, conn));
        }
        Ok(self.dbs.get_mut(pool).expect("inserted above"))
    }

    /// Register an entity for the next flush.
    pub fn track<E: EntityDef>(&mut self, entity: &Tracked<E>) {
        self.tracked.push(entity.as_dyn());
    }

    /// Track and mark for deletion in one step.
    pub fn delete<E: EntityDef>(&mut self, entity: &Tracked<E>) {
        entity.write().meta_mut().mark_to_delete();
        self.track(entity);
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Forget everything tracked without flushing.
    pub fn clear_tracked(&mut self) {
        self.tracked.clear();
    }

    pub(crate) fn take_tracked(&mut self) -> Vec<TrackedDyn> {
        std::mem::take(&mut self.tracked)
    }

    pub(crate) fn restore_tracked(&mut self, entities: Vec<TrackedDyn>) {
        self.tracked = entities;
    }

    pub(crate) fn track_dyn(&mut self, entity: TrackedDyn) {
        self.tracked.push(entity);
    }

    /// True when at least one field differs from the persisted snapshot,
    /// the entity was never loaded, or it is marked for deletion.
    pub fn is_dirty<E: EntityDef>(&self, entity: &Tracked<E>) -> Result<bool, StratumError> {
        let guard = entity.read();
        let schema = self.registry.schema(E::NAME)?;
        let state = dirty_bind(schema, &*guard);
        Ok(state.is_dirty(&*guard))
    }

    /// Metadata attached to every change-log row this engine writes.
    pub fn set_log_meta(&mut self, meta: serde_json::Value) {
        self.log_meta = Some(meta);
    }

    pub(crate) fn log_meta(&self) -> Option<&serde_json::Value> {
        self.log_meta.as_ref()
    }

    /// Open a transaction on `pool`.
    pub async fn begin(&mut self, pool: &str) -> Result<(), StratumError> {
        self.db(pool)?.begin().await?;
        Ok(())
    }

    /// Commit `pool` and fan the buffered cache mutations out.
    pub async fn commit(&mut self, pool: &str) -> Result<(), StratumError> {
        let buffered = self.db(pool)?.commit().await?;
        self.apply_post_commit(buffered).await;
        Ok(())
    }

    /// Roll `pool` back, discarding buffered cache mutations.
    pub async fn rollback(&mut self, pool: &str) -> Result<(), StratumError> {
        self.db(pool)?.rollback().await?;
        Ok(())
    }

    /// Apply post-commit cache mutations: local sets first, then shared
    /// deletes. Failures are repair-queued, never surfaced; the
    /// relational state is already committed.
    pub(crate) async fn apply_post_commit(&mut self, buffered: PostCommit) {
        if buffered.is_empty() {
            return;
        }
        let mut repair_keys: Vec<String> = Vec::new();
        let mut by_pool: HashMap<String, Vec<(String, String)>> = HashMap::new();
        for (pool, key, value) in buffered.local_sets {
            by_pool.entry(pool).or_default().push((key, value));
        }
        for (pool, pairs) in by_pool {
            if let Ok(cache) = self.registry.local_cache(&pool) {
                cache.mset(&pairs);
            }
        }
        let mut deletes_by_pool: HashMap<String, Vec<String>> = HashMap::new();
        for (pool, key) in buffered.local_deletes {
            deletes_by_pool.entry(pool).or_default().push(key);
        }
        for (pool, keys) in deletes_by_pool {
            if let Ok(cache) = self.registry.local_cache(&pool) {
                cache.remove(&keys);
            }
        }
        let mut shared_sets_by_pool: HashMap<String, Vec<(String, String)>> = HashMap::new();
        for (pool, key, value) in buffered.shared_sets {
            shared_sets_by_pool
                .entry(pool)
                .or_default()
                .push((key, value));
        }
        for (pool, pairs) in shared_sets_by_pool {
            let Ok(cache) = self.registry.shared_cache(&pool) else {
                continue;
            };
            let cache = cache.clone();
            if let Err(error) = cache.mset(&pairs).await {
                tracing::warn!(
                    target: SOURCE,
                    %pool,
                    keys = pairs.len(),
                    %error,
                    "post-commit shared set failed, queueing repair"
                );
                repair_keys.extend(pairs.into_iter().map(|(key, _)| key));
            }
        }
        let mut shared_by_pool: HashMap<String, Vec<String>> = HashMap::new();
        for (pool, key) in buffered.shared_deletes {
            shared_by_pool.entry(pool).or_default().push(key);
        }
        for (pool, keys) in shared_by_pool {
            let Ok(cache) = self.registry.shared_cache(&pool) else {
                continue;
            };
            if let Err(error) = cache.del(&keys).await {
                tracing::warn!(
                    target: SOURCE,
                    %pool,
                    keys = keys.len(),
                    %error,
                    "post-commit shared delete failed, queueing repair"
                );
                repair_keys.extend(keys);
            }
        }
        if !repair_keys.is_empty() {
            self.queue_repair(repair_keys).await;
        }
    }

    /// Push keys that failed to invalidate onto the bus so a receiver can
    /// repair the drift.
    pub(crate) async fn queue_repair(&self, keys: Vec<String>) {
        let Some(bus) = self.registry.default_bus() else {
            return;
        };
        for key in keys {
            if let Err(error) = bus.publish(INVALIDATE_QUEUE, key.as_bytes()).await {
                tracing::warn!(target: SOURCE, %key, %error, "repair enqueue failed");
            }
        }
    }

    /// Compute the migration plan for every registered schema.
    pub async fn get_alters(&self) -> Result<Vec<Alter>, StratumError> {
        plan_alters(&self.registry).await
    }

    /// Named distributed locker.
    pub fn locker(&self, name: &str) -> Result<Locker, StratumError> {
        let cache = self.registry.locker_cache(name)?.clone();
        Ok(Locker::new(name, cache))
    }

    pub(crate) fn schema_of_dyn(
        &self,
        entity: &dyn Entity,
    ) -> Result<Arc<crate::schema::TableSchema>, StratumError> {
        Ok(self.registry.schema(entity.entity_name())?.clone())
    }
}
