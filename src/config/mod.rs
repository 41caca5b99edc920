//! Configuration layer: one section per pool, loaded from a file with
//! environment overrides, or built programmatically on a [`Registry`].
//!
//! ```yaml
//! default:
//!   mysql: mysql://app@localhost/app
//!   redis: localhost:6379:0
//!   locker: default
//!   localCache: 1000
//!   rabbitMQ:
//!     server: amqp://localhost:5672
//!     queues:
//!       - name: jobs
//!         durable: true
//!         prefetch_count: 50
//!   dirtyQueues:
//!     user_changed: 100
//! ```

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::path::Path;

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;

use crate::bus::{QueueSettings, RouterSettings};
use crate::schema::Registry;

const ENV_PREFIX: &str = "STRATUM";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration could not be loaded: {0}")]
    Load(#[from] config::ConfigError),
}

/// Settings of one connection pool section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PoolSettings {
    pub mysql: Option<String>,
    /// `host:port:db`
    pub redis: Option<String>,
    /// Shared-cache pool backing this pool's distributed locker.
    pub locker: Option<String>,
    #[serde(rename = "localCache")]
    pub local_cache: Option<usize>,
    #[serde(rename = "rabbitMQ")]
    pub rabbitmq: Option<RabbitSettings>,
    #[serde(rename = "dirtyQueues", default)]
    pub dirty_queues: BTreeMap<String, u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RabbitSettings {
    pub server: String,
    #[serde(default)]
    pub queues: Vec<QueueSettings>,
    #[serde(default)]
    pub routers: Vec<RouterSettings>,
}

/// The full pool map of a deployment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct EngineSettings {
    pub pools: BTreeMap<String, PoolSettings>,
}

impl EngineSettings {
    /// Load from a file, with `STRATUM__`-prefixed environment variables
    /// taking precedence.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    /// Register every configured pool on `registry`.
    pub fn apply(self, registry: &mut Registry) {
        for (name, pool) in self.pools {
            if let Some(dsn) = pool.mysql {
                registry.register_mysql_pool(name.clone(), dsn);
            }
            if let Some(address) = pool.redis {
                registry.register_redis(name.clone(), address);
            }
            if let Some(capacity) = pool.local_cache {
                registry.register_local_cache(name.clone(), capacity);
            }
            if let Some(shared_pool) = pool.locker {
                registry.register_locker(name.clone(), shared_pool);
            }
            if let Some(rabbit) = pool.rabbitmq {
                registry.register_rabbitmq(
                    name.clone(),
                    rabbit.server,
                    rabbit.queues,
                    rabbit.routers,
                );
            }
            for (queue, prefetch) in pool.dirty_queues {
                registry.register_dirty_queue(queue, prefetch);
            }
        }
    }
}
