//! Distributed locker over the shared cache.
//!
//! A lock is a `SET NX` key holding a unique token with a millisecond
//! TTL; release deletes the key only while it still holds our token, so
//! an expired-and-retaken lock is reported as lost instead of silently
//! releasing someone else's.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{CacheError, SharedCache};

const SOURCE: &str = "engine::lock";
const RETRY_INTERVAL: Duration = Duration::from_millis(50);

static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("ttl must be greater than zero")]
    InvalidTtl,
    #[error("lock `{name}` wait timed out")]
    WaitTimeout { name: String },
    #[error("lock `{name}` expired before release")]
    Lost { name: String },
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Named lock factory bound to one shared-cache pool.
#[derive(Clone)]
pub struct Locker {
    name: String,
    cache: SharedCache,
}

impl Locker {
    pub(crate) fn new(name: impl Into<String>, cache: SharedCache) -> Self {
        Self {
            name: name.into(),
            cache,
        }
    }

    /// Try to take `name` for `ttl`, retrying for up to `wait`.
    /// `Ok(None)` means somebody else holds it past the wait window.
    pub async fn obtain(
        &self,
        name: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Option<Lock>, LockError> {
        if ttl.is_zero() {
            return Err(LockError::InvalidTtl);
        }
        let key = format!("lock:{name}");
        let token = next_token();
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if self.cache.backend().set_nx(&key, &token, ttl).await? {
                debug!(target: SOURCE, locker = %self.name, lock = name, "obtained");
                return Ok(Some(Lock {
                    name: name.to_string(),
                    key,
                    token,
                    cache: self.cache.clone(),
                    released: false,
                }));
            }
            if tokio::time::Instant::now() + RETRY_INTERVAL > deadline {
                return Ok(None);
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }
}

/// A held lock; releasing is idempotent and the drop guard makes a
/// best-effort release if the holder forgot (or panicked).
pub struct Lock {
    name: String,
    key: String,
    token: String,
    cache: SharedCache,
    released: bool,
}

impl Lock {
    /// Remaining lifetime; an already-expired lock reports as lost.
    pub async fn ttl(&self) -> Result<Duration, LockError> {
        match self.cache.backend().pttl(&self.key).await? {
            Some(remaining) => Ok(remaining),
            None => Err(LockError::Lost {
                name: self.name.clone(),
            }),
        }
    }

    pub async fn release(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if self.cache.backend().del_if_equal(&self.key, &self.token).await? {
            debug!(target: SOURCE, lock = %self.name, "released");
            Ok(())
        } else {
            Err(LockError::Lost {
                name: self.name.clone(),
            })
        }
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(target: SOURCE, lock = %self.name, "dropped without release, releasing in background");
        let cache = self.cache.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = cache.backend().del_if_equal(&key, &token).await;
            });
        }
    }
}

fn next_token() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    format!(
        "{}-{}-{}",
        std::process::id(),
        nanos,
        TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::MemoryBackend;

    fn locker() -> Locker {
        Locker::new(
            "default",
            SharedCache::new("default", Arc::new(MemoryBackend::new())),
        )
    }

    #[tokio::test]
    async fn obtain_and_contend() {
        let locker = locker();
        let mut lock = locker
            .obtain("job", Duration::from_secs(10), Duration::ZERO)
            .await
            .expect("obtain")
            .expect("lock granted");

        let second = locker
            .obtain("job", Duration::from_secs(10), Duration::from_millis(120))
            .await
            .expect("obtain");
        assert!(second.is_none());

        assert!(lock.ttl().await.expect("ttl") > Duration::ZERO);
        lock.release().await.expect("release");
        lock.release().await.expect("second release is a no-op");

        let third = locker
            .obtain("job", Duration::from_secs(10), Duration::ZERO)
            .await
            .expect("obtain");
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn zero_ttl_is_rejected() {
        let locker = locker();
        let outcome = locker.obtain("job", Duration::ZERO, Duration::ZERO).await;
        assert!(matches!(outcome, Err(LockError::InvalidTtl)));
    }

    #[tokio::test]
    async fn expired_lock_reports_lost() {
        let locker = locker();
        let mut lock = locker
            .obtain("job", Duration::from_millis(1), Duration::ZERO)
            .await
            .expect("obtain")
            .expect("lock granted");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(lock.ttl().await, Err(LockError::Lost { .. })));
        assert!(matches!(lock.release().await, Err(LockError::Lost { .. })));
    }
}
