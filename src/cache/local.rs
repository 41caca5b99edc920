//! Process-local LRU cache.
//!
//! One bounded pool per registered name, optional uniform TTL. Values are
//! packed strings (row images, id lists); hash buckets shard a set of
//! fields under one key.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::debug;

use super::lock::mutex_lock;
use super::CacheError;

const SOURCE: &str = "cache::local";

#[derive(Clone)]
enum Slot {
    Value(String),
    Hash(HashMap<String, String>),
}

struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.is_none_or(|at| at > Instant::now())
    }
}

/// A bounded per-pool map with LRU eviction.
///
/// A single internal lock per pool; safe for concurrent readers and
/// writers across engines.
pub struct LocalCache {
    name: String,
    entries: Mutex<LruCache<String, Entry>>,
    ttl: Option<Duration>,
}

impl LocalCache {
    pub fn new(name: impl Into<String>, capacity: usize, ttl: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least one");
        Self {
            name: name.into(),
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn entry(&self, slot: Slot) -> Entry {
        Entry {
            slot,
            expires_at: self.ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = mutex_lock!(&self.entries, SOURCE, "get");
        match entries.get(key) {
            Some(entry) if entry.live() => match &entry.slot {
                Slot::Value(value) => Some(value.clone()),
                Slot::Hash(_) => None,
            },
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn mget(&self, keys: &[String]) -> Vec<Option<String>> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        let entry = self.entry(Slot::Value(value.into()));
        mutex_lock!(&self.entries, SOURCE, "set").put(key.into(), entry);
    }

    pub fn mset(&self, pairs: &[(String, String)]) {
        let mut entries = mutex_lock!(&self.entries, SOURCE, "mset");
        for (key, value) in pairs {
            entries.put(key.clone(), self.entry(Slot::Value(value.clone())));
        }
    }

    /// Read `fields` out of the hash bucket stored under `key`.
    pub fn hmget(&self, key: &str, fields: &[String]) -> Vec<Option<String>> {
        let mut entries = mutex_lock!(&self.entries, SOURCE, "hmget");
        let bucket = match entries.get(key) {
            Some(entry) if entry.live() => match &entry.slot {
                Slot::Hash(bucket) => Some(bucket),
                Slot::Value(_) => None,
            },
            _ => None,
        };
        match bucket {
            Some(bucket) => fields.iter().map(|field| bucket.get(field).cloned()).collect(),
            None => vec![None; fields.len()],
        }
    }

    /// Merge `pairs` into the hash bucket stored under `key`.
    pub fn hmset(&self, key: &str, pairs: &[(String, String)]) {
        let mut entries = mutex_lock!(&self.entries, SOURCE, "hmset");
        let merged = match entries.get(key) {
            Some(entry) if entry.live() => match &entry.slot {
                Slot::Hash(bucket) => {
                    let mut bucket = bucket.clone();
                    bucket.extend(pairs.iter().cloned());
                    bucket
                }
                Slot::Value(_) => pairs.iter().cloned().collect(),
            },
            _ => pairs.iter().cloned().collect(),
        };
        let entry = self.entry(Slot::Hash(merged));
        entries.put(key.to_string(), entry);
    }

    pub fn remove(&self, keys: &[String]) {
        let mut entries = mutex_lock!(&self.entries, SOURCE, "remove");
        for key in keys {
            entries.pop(key);
        }
    }

    pub fn clear(&self) {
        mutex_lock!(&self.entries, SOURCE, "clear").clear();
        debug!(target: SOURCE, pool = %self.name, "cleared");
    }

    pub fn len(&self) -> usize {
        mutex_lock!(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the cached value under `key`, or run `loader`, store its
    /// output and return it.
    pub async fn get_set<F, Fut>(&self, key: &str, loader: F) -> Result<String, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, CacheError>>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }
        let value = loader().await?;
        self.set(key, value.clone());
        Ok(value)
    }
}
