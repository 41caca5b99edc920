//! Redis-protocol shared-cache backend.
//!
//! A single auto-reconnecting multiplexed connection serves all engines;
//! it is created lazily on first use.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tokio::sync::OnceCell;

use super::backend::KvBackend;
use super::CacheError;

const RELEASE_SCRIPT: &str = r"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end";

pub struct RedisBackend {
    client: Client,
    manager: OnceCell<ConnectionManager>,
}

impl RedisBackend {
    /// `host:port:db`, the pool address format of the configuration file.
    pub fn from_address(address: &str) -> Result<Self, CacheError> {
        let mut parts = address.split(':');
        let host = parts.next().unwrap_or("localhost");
        let port = parts.next().unwrap_or("6379");
        let db = parts.next().unwrap_or("0");
        Self::from_url(&format!("redis://{host}:{port}/{db}"))
    }

    pub fn from_url(url: &str) -> Result<Self, CacheError> {
        let client = Client::open(url).map_err(|err| CacheError::backend("redis", err.to_string()))?;
        Ok(Self {
            client,
            manager: OnceCell::new(),
        })
    }

    async fn conn(&self) -> Result<ConnectionManager, CacheError> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(|err| CacheError::backend("redis", err.to_string()))
            })
            .await?;
        Ok(manager.clone())
    }
}

fn backend_err(err: redis::RedisError) -> CacheError {
    CacheError::backend("redis", err.to_string())
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn().await?;
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        cmd.query_async::<()>(&mut conn).await.map_err(backend_err)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        let mut conn = self.conn().await?;
        redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn mset(&self, pairs: &[(String, String)]) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        redis::cmd("MSET")
            .arg(pairs)
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn del(&self, keys: &[String]) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        redis::cmd("DEL")
            .arg(keys)
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        let mut conn = self.conn().await?;
        redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn hset(&self, key: &str, pairs: &[(String, String)]) -> Result<u64, CacheError> {
        let mut conn = self.conn().await?;
        redis::cmd("HSET")
            .arg(key)
            .arg(pairs)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        let mut conn = self.conn().await?;
        redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn lpush(&self, key: &str, values: &[String]) -> Result<u64, CacheError> {
        let mut conn = self.conn().await?;
        redis::cmd("LPUSH")
            .arg(key)
            .arg(values)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<u64, CacheError> {
        let mut conn = self.conn().await?;
        redis::cmd("RPUSH")
            .arg(key)
            .arg(values)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn().await?;
        redis::cmd("RPOP")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn().await?;
        redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn lset(&self, key: &str, index: i64, value: &str) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        redis::cmd("LSET")
            .arg(key)
            .arg(index)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<u64, CacheError> {
        let mut conn = self.conn().await?;
        redis::cmd("LREM")
            .arg(key)
            .arg(count)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        redis::cmd("LTRIM")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn llen(&self, key: &str) -> Result<u64, CacheError> {
        let mut conn = self.conn().await?;
        redis::cmd("LLEN")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, CacheError> {
        let mut conn = self.conn().await?;
        redis::cmd("SADD")
            .arg(key)
            .arg(members)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn spop(&self, key: &str, count: u64) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn().await?;
        redis::cmd("SPOP")
            .arg(key)
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn scard(&self, key: &str) -> Result<u64, CacheError> {
        let mut conn = self.conn().await?;
        redis::cmd("SCARD")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn zadd(&self, key: &str, entries: &[(f64, String)]) -> Result<u64, CacheError> {
        let mut conn = self.conn().await?;
        redis::cmd("ZADD")
            .arg(key)
            .arg(entries)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn zcard(&self, key: &str) -> Result<u64, CacheError> {
        let mut conn = self.conn().await?;
        redis::cmd("ZCARD")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64, CacheError> {
        let mut conn = self.conn().await?;
        redis::cmd("ZCOUNT")
            .arg(key)
            .arg(min)
            .arg(max)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn flush_db(&self) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        redis::cmd("FLUSHDB")
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(reply.is_some())
    }

    async fn pttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        let mut conn = self.conn().await?;
        let millis: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(match millis {
            -2 => None,
            -1 => Some(Duration::ZERO),
            millis => Some(Duration::from_millis(millis.max(0) as u64)),
        })
    }

    async fn del_if_equal(&self, key: &str, value: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let deleted: u64 = Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(deleted > 0)
    }
}
