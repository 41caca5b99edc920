//! Recording relational driver for tests.
//!
//! Captures every statement with its parameters and replays scripted
//! query results, so write-path tests can assert the exact SQL the engine
//! emits without a live server. Inserts hand out sequential ids the way
//! an auto-increment column would.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::driver::{ExecResult, SqlConn, SqlRow, SqlTx};
use super::DbError;
use crate::cache::lock::mutex_lock;
use crate::entity::SqlValue;

const SOURCE: &str = "db::testing";

/// One captured statement.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

#[derive(Default)]
struct Shared {
    calls: Mutex<Vec<RecordedCall>>,
    query_results: Mutex<VecDeque<Vec<SqlRow>>>,
    exec_failures: Mutex<VecDeque<DbError>>,
    next_id: AtomicU64,
}

impl Shared {
    fn record(&self, sql: &str, params: &[SqlValue]) {
        mutex_lock!(&self.calls, SOURCE, "record").push(RecordedCall {
            sql: sql.to_string(),
            params: params.to_vec(),
        });
    }

    fn run_exec(&self, sql: &str, params: &[SqlValue]) -> Result<ExecResult, DbError> {
        self.record(sql, params);
        if let Some(error) = mutex_lock!(&self.exec_failures, SOURCE, "run_exec").pop_front() {
            return Err(error);
        }
        if sql.starts_with("INSERT") {
            // Multi-row inserts report the first generated id.
            let rows = sql.matches("),(").count() as u64 + 1;
            let first = self.next_id.fetch_add(rows, Ordering::SeqCst) + 1;
            return Ok(ExecResult {
                rows_affected: rows,
                last_insert_id: first,
            });
        }
        Ok(ExecResult {
            rows_affected: 1,
            last_insert_id: 0,
        })
    }

    fn run_query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, DbError> {
        self.record(sql, params);
        Ok(mutex_lock!(&self.query_results, SOURCE, "run_query")
            .pop_front()
            .unwrap_or_default())
    }
}

/// A scriptable, recording [`SqlConn`].
pub struct RecordingConn {
    database: String,
    shared: Arc<Shared>,
}

impl RecordingConn {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            shared: Arc::new(Shared::default()),
        }
    }

    /// Queue rows for the next `query` call (FIFO).
    pub fn push_query_result(&self, rows: Vec<SqlRow>) {
        mutex_lock!(&self.shared.query_results, SOURCE, "push_query_result").push_back(rows);
    }

    /// Fail the next `exec` call with `error`.
    pub fn fail_next_exec(&self, error: DbError) {
        mutex_lock!(&self.shared.exec_failures, SOURCE, "fail_next_exec").push_back(error);
    }

    /// Every statement seen so far, transaction markers included.
    pub fn calls(&self) -> Vec<RecordedCall> {
        mutex_lock!(&self.shared.calls, SOURCE, "calls").clone()
    }

    /// Statements matching a SQL prefix.
    pub fn calls_starting_with(&self, prefix: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.sql.starts_with(prefix))
            .collect()
    }
}

#[async_trait]
impl SqlConn for RecordingConn {
    async fn exec(&self, sql: &str, params: &[SqlValue]) -> Result<ExecResult, DbError> {
        self.shared.run_exec(sql, params)
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, DbError> {
        self.shared.run_query(sql, params)
    }

    async fn begin(&self) -> Result<Box<dyn SqlTx>, DbError> {
        self.shared.record("BEGIN", &[]);
        Ok(Box::new(RecordingTx {
            shared: self.shared.clone(),
        }))
    }

    async fn database_name(&self) -> Result<String, DbError> {
        Ok(self.database.clone())
    }
}

struct RecordingTx {
    shared: Arc<Shared>,
}

#[async_trait]
impl SqlTx for RecordingTx {
    async fn exec(&mut self, sql: &str, params: &[SqlValue]) -> Result<ExecResult, DbError> {
        self.shared.run_exec(sql, params)
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, DbError> {
        self.shared.run_query(sql, params)
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        self.shared.record("COMMIT", &[]);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        self.shared.record("ROLLBACK", &[]);
        Ok(())
    }
}
