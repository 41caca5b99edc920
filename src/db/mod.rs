//! Relational access layer.
//!
//! A [`SqlConn`] is a shared, pool-backed connection; a [`Db`] is the
//! per-engine handle that owns the optional current transaction and the
//! post-commit cache mutation buffers. All statements route through the
//! open transaction when one exists.

mod driver;
mod mysql;
mod predicate;
pub mod testing;

pub use driver::{ExecResult, SqlConn, SqlRow, SqlTx};
pub use mysql::MySqlConn;
pub use predicate::{Pager, Predicate, PredicateParam};

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::entity::SqlValue;

const SOURCE: &str = "db";

#[derive(Debug, Error)]
pub enum DbError {
    /// Unique-constraint violation; carries the offending key name.
    #[error("duplicate key on index `{index}`")]
    DuplicateKey { index: String },
    /// Referential-constraint violation; carries the constraint name.
    #[error("foreign key constraint `{constraint}` violated")]
    ForeignKey { constraint: String },
    #[error("statement deadline expired on pool `{pool}`")]
    Timeout { pool: String },
    #[error("transaction already open on pool `{pool}`")]
    TransactionOpen { pool: String },
    #[error("no transaction open on pool `{pool}`")]
    NoTransaction { pool: String },
    #[error("{op} failed on pool `{pool}`: {message} (statement: {statement})")]
    Statement {
        op: &'static str,
        pool: String,
        statement: String,
        message: String,
    },
    #[error("pool `{pool}` unavailable: {message}")]
    Pool { pool: String, message: String },
}

impl DbError {
    pub(crate) fn statement(
        op: &'static str,
        pool: impl Into<String>,
        statement: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Statement {
            op,
            pool: pool.into(),
            statement: statement.into(),
            message: message.into(),
        }
    }
}

/// Buffered cache mutations applied only after a successful `COMMIT`.
#[derive(Debug, Default)]
pub(crate) struct PostCommit {
    /// (local pool, key, packed value)
    pub local_sets: Vec<(String, String, String)>,
    /// (local pool, key)
    pub local_deletes: Vec<(String, String)>,
    /// (shared pool, key, packed row image)
    pub shared_sets: Vec<(String, String, String)>,
    /// (shared pool, cached-query page key)
    pub shared_deletes: Vec<(String, String)>,
}

impl PostCommit {
    pub fn is_empty(&self) -> bool {
        self.local_sets.is_empty()
            && self.local_deletes.is_empty()
            && self.shared_sets.is_empty()
            && self.shared_deletes.is_empty()
    }
}

/// Per-engine relational handle for one pool.
pub struct Db {
    pool_name: String,
    conn: Arc<dyn SqlConn>,
    tx: Option<Box<dyn SqlTx>>,
    post_commit: PostCommit,
}

impl Db {
    pub(crate) fn new(pool_name: impl Into<String>, conn: Arc<dyn SqlConn>) -> Self {
        Self {
            pool_name: pool_name.into(),
            conn,
            tx: None,
            post_commit: PostCommit::default(),
        }
    }

    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    pub(crate) fn post_commit_mut(&mut self) -> &mut PostCommit {
        &mut self.post_commit
    }

    pub async fn exec(&mut self, sql: &str, params: &[SqlValue]) -> Result<ExecResult, DbError> {
        let started = std::time::Instant::now();
        let result = match self.tx.as_mut() {
            Some(tx) => tx.exec(sql, params).await,
            None => self.conn.exec(sql, params).await,
        };
        debug!(
            target: SOURCE,
            pool = %self.pool_name,
            statement = sql,
            microseconds = started.elapsed().as_micros() as u64,
            in_transaction = self.tx.is_some(),
            "exec"
        );
        result
    }

    pub async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, DbError> {
        let started = std::time::Instant::now();
        let result = match self.tx.as_mut() {
            Some(tx) => tx.query(sql, params).await,
            None => self.conn.query(sql, params).await,
        };
        debug!(
            target: SOURCE,
            pool = %self.pool_name,
            statement = sql,
            microseconds = started.elapsed().as_micros() as u64,
            "query"
        );
        result
    }

    /// Single-row query; `no rows` is an `Ok(None)` outcome.
    pub async fn query_row(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Option<SqlRow>, DbError> {
        let mut rows = self.query(sql, params).await?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.swap_remove(0))
        })
    }

    /// Open a transaction; a second `begin` on the same handle is an error.
    pub async fn begin(&mut self) -> Result<(), DbError> {
        if self.tx.is_some() {
            return Err(DbError::TransactionOpen {
                pool: self.pool_name.clone(),
            });
        }
        let tx = self.conn.begin().await?;
        debug!(target: SOURCE, pool = %self.pool_name, "begin transaction");
        self.tx = Some(tx);
        Ok(())
    }

    /// Commit the open transaction and hand the post-commit buffers back
    /// to the caller for fan-out.
    pub(crate) async fn commit(&mut self) -> Result<PostCommit, DbError> {
        let tx = self.tx.take().ok_or_else(|| DbError::NoTransaction {
            pool: self.pool_name.clone(),
        })?;
        tx.commit().await?;
        debug!(target: SOURCE, pool = %self.pool_name, "commit");
        Ok(std::mem::take(&mut self.post_commit))
    }

    /// Roll back the open transaction, discarding any buffered cache
    /// mutations.
    pub async fn rollback(&mut self) -> Result<(), DbError> {
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        self.post_commit = PostCommit::default();
        tx.rollback().await?;
        debug!(target: SOURCE, pool = %self.pool_name, "rollback");
        Ok(())
    }
}
