use thiserror::Error;

use crate::bus::BusError;
use crate::cache::CacheError;
use crate::db::DbError;
use crate::engine::LockError;
use crate::schema::SchemaError;

/// Top-level error surface of the engine.
///
/// Each variant wraps the typed error of the layer it crossed; low-level
/// I/O failures are wrapped with operation context (pool, table, statement)
/// at the layer where they occurred.
#[derive(Debug, Error)]
pub enum StratumError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("flusher limit {limit} exceeded")]
    FlusherLimit { limit: usize },
}

impl StratumError {
    /// True when the failure is a recoverable relational constraint
    /// violation (duplicate key or foreign key) that the caller may
    /// handle without treating the engine as broken.
    pub fn is_constraint(&self) -> bool {
        matches!(
            self,
            Self::Db(DbError::DuplicateKey { .. }) | Self::Db(DbError::ForeignKey { .. })
        )
    }
}
