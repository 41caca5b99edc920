//! Typed facade over the shared out-of-process cache.
//!
//! Thin pass-through to the backend with operation logging; the JSON
//! `get_set` helper lives here so every caller gets the same
//! encode-on-miss behavior.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::backend::KvBackend;
use super::CacheError;

const SOURCE: &str = "cache::shared";

#[derive(Clone)]
pub struct SharedCache {
    name: String,
    backend: Arc<dyn KvBackend>,
}

impl SharedCache {
    pub fn new(name: impl Into<String>, backend: Arc<dyn KvBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let value = self.backend.get(key).await?;
        debug!(target: SOURCE, pool = %self.name, key, miss = value.is_none(), "get");
        Ok(value)
    }

    pub async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        debug!(target: SOURCE, pool = %self.name, key, "set");
        self.backend.set(key, value, ttl).await
    }

    pub async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let values = self.backend.mget(keys).await?;
        let misses = values.iter().filter(|value| value.is_none()).count();
        debug!(target: SOURCE, pool = %self.name, keys = keys.len(), misses, "mget");
        Ok(values)
    }

    pub async fn mset(&self, pairs: &[(String, String)]) -> Result<(), CacheError> {
        if pairs.is_empty() {
            return Ok(());
        }
        debug!(target: SOURCE, pool = %self.name, keys = pairs.len(), "mset");
        self.backend.mset(pairs).await
    }

    pub async fn del(&self, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        debug!(target: SOURCE, pool = %self.name, keys = keys.len(), "del");
        self.backend.del(keys).await
    }

    pub async fn hmget(
        &self,
        key: &str,
        fields: &[String],
    ) -> Result<Vec<Option<String>>, CacheError> {
        self.backend.hmget(key, fields).await
    }

    pub async fn hmset(&self, key: &str, pairs: &[(String, String)]) -> Result<(), CacheError> {
        self.backend.hset(key, pairs).await.map(|_| ())
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<u64, CacheError> {
        self.backend
            .hset(key, &[(field.to_string(), value.to_string())])
            .await
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        self.backend.hgetall(key).await
    }

    pub async fn lpush(&self, key: &str, values: &[String]) -> Result<u64, CacheError> {
        self.backend.lpush(key, values).await
    }

    pub async fn rpush(&self, key: &str, values: &[String]) -> Result<u64, CacheError> {
        self.backend.rpush(key, values).await
    }

    pub async fn rpop(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.backend.rpop(key).await
    }

    pub async fn lrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, CacheError> {
        self.backend.lrange(key, start, stop).await
    }

    pub async fn lset(&self, key: &str, index: i64, value: &str) -> Result<(), CacheError> {
        self.backend.lset(key, index, value).await
    }

    pub async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<u64, CacheError> {
        self.backend.lrem(key, count, value).await
    }

    pub async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), CacheError> {
        self.backend.ltrim(key, start, stop).await
    }

    pub async fn llen(&self, key: &str) -> Result<u64, CacheError> {
        self.backend.llen(key).await
    }

    pub async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, CacheError> {
        self.backend.sadd(key, members).await
    }

    pub async fn spop(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.backend.spop(key, 1).await?.pop())
    }

    pub async fn spop_n(&self, key: &str, count: u64) -> Result<Vec<String>, CacheError> {
        self.backend.spop(key, count).await
    }

    pub async fn scard(&self, key: &str) -> Result<u64, CacheError> {
        self.backend.scard(key).await
    }

    pub async fn zadd(&self, key: &str, entries: &[(f64, String)]) -> Result<u64, CacheError> {
        self.backend.zadd(key, entries).await
    }

    pub async fn zcard(&self, key: &str) -> Result<u64, CacheError> {
        self.backend.zcard(key).await
    }

    pub async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64, CacheError> {
        self.backend.zcount(key, min, max).await
    }

    pub async fn flush_db(&self) -> Result<(), CacheError> {
        self.backend.flush_db().await
    }

    /// Return the decoded value under `key`; on a miss, invoke `loader`,
    /// JSON-encode its output, store it with `ttl` and return it.
    pub async fn get_set<T, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        loader: F,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        if let Some(packed) = self.get(key).await? {
            return serde_json::from_str(&packed).map_err(CacheError::from);
        }
        let value = loader().await?;
        let packed = serde_json::to_string(&value)?;
        self.set(key, &packed, ttl).await?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::super::memory::MemoryBackend;
    use super::*;

    fn cache() -> SharedCache {
        SharedCache::new("default", Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn absent_key_is_a_miss_not_an_error() {
        let cache = cache();
        assert!(cache.get("missing").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn get_set_loads_once() {
        let cache = cache();
        let first: u32 = cache
            .get_set("counter", None, || async { Ok(41) })
            .await
            .expect("miss path");
        assert_eq!(first, 41);

        let second: u32 = cache
            .get_set("counter", None, || async {
                panic!("loader must not run on a hit")
            })
            .await
            .expect("hit path");
        assert_eq!(second, 41);
    }

    #[tokio::test]
    async fn list_round_trip() {
        let cache = cache();
        cache
            .rpush("l", &["a".to_string(), "b".to_string()])
            .await
            .expect("rpush");
        cache.lpush("l", &["z".to_string()]).await.expect("lpush");
        assert_eq!(cache.llen("l").await.expect("llen"), 3);
        assert_eq!(
            cache.lrange("l", 0, -1).await.expect("lrange"),
            vec!["z", "a", "b"]
        );
        assert_eq!(cache.rpop("l").await.expect("rpop").as_deref(), Some("b"));
    }
}
