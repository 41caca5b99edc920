//! Raw operation set a shared-cache backend must provide.
//!
//! The engine only ever talks to [`SharedCache`](super::SharedCache);
//! this trait is the wire seam. An absent key is a typed outcome, never
//! an error.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use super::CacheError;

#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError>;

    async fn mset(&self, pairs: &[(String, String)]) -> Result<(), CacheError>;

    async fn del(&self, keys: &[String]) -> Result<(), CacheError>;

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, CacheError>;

    async fn hset(&self, key: &str, pairs: &[(String, String)]) -> Result<u64, CacheError>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, CacheError>;

    async fn lpush(&self, key: &str, values: &[String]) -> Result<u64, CacheError>;

    async fn rpush(&self, key: &str, values: &[String]) -> Result<u64, CacheError>;

    async fn rpop(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, CacheError>;

    async fn lset(&self, key: &str, index: i64, value: &str) -> Result<(), CacheError>;

    async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<u64, CacheError>;

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), CacheError>;

    async fn llen(&self, key: &str) -> Result<u64, CacheError>;

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, CacheError>;

    async fn spop(&self, key: &str, count: u64) -> Result<Vec<String>, CacheError>;

    async fn scard(&self, key: &str) -> Result<u64, CacheError>;

    async fn zadd(&self, key: &str, entries: &[(f64, String)]) -> Result<u64, CacheError>;

    async fn zcard(&self, key: &str) -> Result<u64, CacheError>;

    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64, CacheError>;

    async fn flush_db(&self) -> Result<(), CacheError>;

    // Locker primitives.

    /// Set `key` to `value` only if absent; true when the key was taken.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Remaining lifetime of `key`, `None` when the key is gone.
    async fn pttl(&self, key: &str) -> Result<Option<Duration>, CacheError>;

    /// Delete `key` only while it still holds `value`; true on delete.
    async fn del_if_equal(&self, key: &str, value: &str) -> Result<bool, CacheError>;
}
