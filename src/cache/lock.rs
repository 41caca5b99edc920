// Cache state is reconstructible from the row store, so a lock poisoned
// by a panicking thread is recovered rather than propagated.

macro_rules! rw_read {
    ($lock:expr, $source:expr, $op:expr) => {
        match $lock.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!(target: $source, op = $op, kind = "rwlock.read", "recovered poisoned lock");
                poisoned.into_inner()
            }
        }
    };
}

macro_rules! rw_write {
    ($lock:expr, $source:expr, $op:expr) => {
        match $lock.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!(target: $source, op = $op, kind = "rwlock.write", "recovered poisoned lock");
                poisoned.into_inner()
            }
        }
    };
}

macro_rules! mutex_lock {
    ($lock:expr, $source:expr, $op:expr) => {
        match $lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!(target: $source, op = $op, kind = "mutex", "recovered poisoned lock");
                poisoned.into_inner()
            }
        }
    };
}

pub(crate) use mutex_lock;
pub(crate) use rw_read;
pub(crate) use rw_write;
