//! Cache tiers.
//!
//! Two layers sit in front of the row store:
//!
//! - **Local**: a bounded in-process LRU per registered pool.
//! - **Shared**: an out-of-process key/value, list, hash, set and
//!   sorted-set store behind the [`KvBackend`] seam (redis-protocol in
//!   production, [`MemoryBackend`] in tests and single-process runs).
//!
//! Row images and cached-query pages follow the key schemes in [`keys`].

mod backend;
pub mod keys;
mod local;
pub(crate) mod lock;
mod memory;
mod redis;
mod shared;

pub use backend::KvBackend;
pub use local::LocalCache;
pub use memory::MemoryBackend;
pub use redis::RedisBackend;
pub use shared::SharedCache;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend `{backend}` failed: {message}")]
    Backend {
        backend: &'static str,
        message: String,
    },
    #[error("cache value could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

impl CacheError {
    pub(crate) fn backend(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            message: message.into(),
        }
    }
}
