//! Driver seam between the engine and a concrete relational backend.
//!
//! Any compatible implementation suffices; the crate ships the sqlx/MySQL
//! one, and tests use a recording stand-in.

use async_trait::async_trait;

use super::DbError;
use crate::entity::SqlValue;

/// One result row, values in select-list order.
pub type SqlRow = Vec<SqlValue>;

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: u64,
}

/// A shared, pool-backed connection.
#[async_trait]
pub trait SqlConn: Send + Sync {
    async fn exec(&self, sql: &str, params: &[SqlValue]) -> Result<ExecResult, DbError>;

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, DbError>;

    async fn begin(&self) -> Result<Box<dyn SqlTx>, DbError>;

    /// Name of the database the pool is connected to; the migration
    /// planner qualifies identifiers with it.
    async fn database_name(&self) -> Result<String, DbError>;
}

/// An open transaction. Dropped without commit, the underlying
/// transaction rolls back.
#[async_trait]
pub trait SqlTx: Send {
    async fn exec(&mut self, sql: &str, params: &[SqlValue]) -> Result<ExecResult, DbError>;

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, DbError>;

    async fn commit(self: Box<Self>) -> Result<(), DbError>;

    async fn rollback(self: Box<Self>) -> Result<(), DbError>;
}
