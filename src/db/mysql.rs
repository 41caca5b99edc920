//! sqlx-backed MySQL driver.
//!
//! Statements are generated at runtime, so binding and row decoding go
//! through the dynamic `sqlx::query` API; column values are mapped onto
//! [`SqlValue`] by the column's reported type.

use async_trait::async_trait;
use sqlx::mysql::{MySqlArguments, MySqlDatabaseError, MySqlPool, MySqlRow};
use sqlx::query::Query;
use sqlx::{Column, MySql, Row, TypeInfo, ValueRef};
use tokio::sync::OnceCell;

use super::driver::{ExecResult, SqlConn, SqlRow, SqlTx};
use super::DbError;
use crate::entity::SqlValue;

pub struct MySqlConn {
    pool_name: String,
    pool: MySqlPool,
    database_name: OnceCell<String>,
}

impl MySqlConn {
    /// Open a lazily-connecting pool for the given DSN.
    pub fn connect_lazy(pool_name: impl Into<String>, dsn: &str) -> Result<Self, DbError> {
        let pool_name = pool_name.into();
        let pool = MySqlPool::connect_lazy(dsn).map_err(|err| DbError::Pool {
            pool: pool_name.clone(),
            message: err.to_string(),
        })?;
        Ok(Self {
            pool_name,
            pool,
            database_name: OnceCell::new(),
        })
    }

    pub fn from_pool(pool_name: impl Into<String>, pool: MySqlPool) -> Self {
        Self {
            pool_name: pool_name.into(),
            pool,
            database_name: OnceCell::new(),
        }
    }
}

#[async_trait]
impl SqlConn for MySqlConn {
    async fn exec(&self, sql: &str, params: &[SqlValue]) -> Result<ExecResult, DbError> {
        let result = bind_params(sqlx::query(sql), params)
            .execute(&self.pool)
            .await
            .map_err(|err| classify("exec", &self.pool_name, sql, err))?;
        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: result.last_insert_id(),
        })
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, DbError> {
        let rows = bind_params(sqlx::query(sql), params)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| classify("query", &self.pool_name, sql, err))?;
        rows.iter()
            .map(|row| decode_row(&self.pool_name, sql, row))
            .collect()
    }

    async fn begin(&self) -> Result<Box<dyn SqlTx>, DbError> {
        let tx = self.pool.begin().await.map_err(|err| DbError::Pool {
            pool: self.pool_name.clone(),
            message: err.to_string(),
        })?;
        Ok(Box::new(MySqlTxn {
            pool_name: self.pool_name.clone(),
            tx,
        }))
    }

    async fn database_name(&self) -> Result<String, DbError> {
        let name = self
            .database_name
            .get_or_try_init(|| async {
                let rows = self.query("SELECT DATABASE()", &[]).await?;
                let name = rows
                    .first()
                    .and_then(|row| row.first())
                    .and_then(|value| value.as_str().map(str::to_string))
                    .ok_or_else(|| DbError::Pool {
                        pool: self.pool_name.clone(),
                        message: "connection has no default database".to_string(),
                    })?;
                Ok::<_, DbError>(name)
            })
            .await?;
        Ok(name.clone())
    }
}

struct MySqlTxn {
    pool_name: String,
    tx: sqlx::Transaction<'static, MySql>,
}

#[async_trait]
impl SqlTx for MySqlTxn {
    async fn exec(&mut self, sql: &str, params: &[SqlValue]) -> Result<ExecResult, DbError> {
        let result = bind_params(sqlx::query(sql), params)
            .execute(&mut *self.tx)
            .await
            .map_err(|err| classify("exec", &self.pool_name, sql, err))?;
        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: result.last_insert_id(),
        })
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, DbError> {
        let rows = bind_params(sqlx::query(sql), params)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|err| classify("query", &self.pool_name, sql, err))?;
        rows.iter()
            .map(|row| decode_row(&self.pool_name, sql, row))
            .collect()
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        self.tx.commit().await.map_err(|err| DbError::Pool {
            pool: self.pool_name.clone(),
            message: err.to_string(),
        })
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        self.tx.rollback().await.map_err(|err| DbError::Pool {
            pool: self.pool_name.clone(),
            message: err.to_string(),
        })
    }
}

fn bind_params<'q>(
    mut query: Query<'q, MySql, MySqlArguments>,
    params: &'q [SqlValue],
) -> Query<'q, MySql, MySqlArguments> {
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(Option::<String>::None),
            SqlValue::UInt(v) => query.bind(*v),
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::Float(v) => query.bind(*v),
            SqlValue::Str(v) => query.bind(v.as_str()),
            SqlValue::Bytes(v) => query.bind(v.as_slice()),
        };
    }
    query
}

fn decode_row(pool: &str, sql: &str, row: &MySqlRow) -> Result<SqlRow, DbError> {
    let mut values = Vec::with_capacity(row.columns().len());
    for (index, column) in row.columns().iter().enumerate() {
        let raw = row
            .try_get_raw(index)
            .map_err(|err| DbError::statement("decode", pool, sql, err.to_string()))?;
        if raw.is_null() {
            values.push(SqlValue::Null);
            continue;
        }
        let type_name = column.type_info().name();
        let value = decode_column(row, index, type_name)
            .map_err(|err| DbError::statement("decode", pool, sql, err.to_string()))?;
        values.push(value);
    }
    Ok(values)
}

fn decode_column(row: &MySqlRow, index: usize, type_name: &str) -> Result<SqlValue, sqlx::Error> {
    let value = match type_name {
        name if name.ends_with("UNSIGNED") || name == "YEAR" => {
            SqlValue::UInt(row.try_get_unchecked::<u64, _>(index)?)
        }
        "BOOLEAN" | "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            SqlValue::Int(row.try_get_unchecked::<i64, _>(index)?)
        }
        "FLOAT" => SqlValue::Float(f64::from(row.try_get_unchecked::<f32, _>(index)?)),
        "DOUBLE" => SqlValue::Float(row.try_get_unchecked::<f64, _>(index)?),
        "DATE" => SqlValue::from_date(row.try_get_unchecked::<time::Date, _>(index)?),
        "DATETIME" => {
            SqlValue::from_datetime(row.try_get_unchecked::<time::PrimitiveDateTime, _>(index)?)
        }
        "TIMESTAMP" => {
            let stamp = row.try_get_unchecked::<time::OffsetDateTime, _>(index)?;
            let utc = stamp.to_offset(time::UtcOffset::UTC);
            SqlValue::from_datetime(time::PrimitiveDateTime::new(utc.date(), utc.time()))
        }
        "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY" => {
            SqlValue::Bytes(row.try_get_unchecked::<Vec<u8>, _>(index)?)
        }
        // CHAR/VARCHAR/TEXT variants, ENUM, SET, JSON and DECIMAL all
        // arrive as text.
        _ => SqlValue::Str(row.try_get_unchecked::<String, _>(index)?),
    };
    Ok(value)
}

fn classify(op: &'static str, pool: &str, sql: &str, err: sqlx::Error) -> DbError {
    match &err {
        sqlx::Error::Database(db) => {
            if let Some(mysql) = db.try_downcast_ref::<MySqlDatabaseError>() {
                match mysql.number() {
                    // ER_DUP_ENTRY, ER_DUP_ENTRY_WITH_KEY_NAME
                    1062 | 1586 => {
                        return DbError::DuplicateKey {
                            index: duplicate_key_name(mysql.message()),
                        };
                    }
                    // FK violations on parent and child side.
                    1216 | 1217 | 1451 | 1452 => {
                        return DbError::ForeignKey {
                            constraint: constraint_name(mysql.message()),
                        };
                    }
                    _ => {}
                }
            }
            DbError::statement(op, pool, sql, db.message())
        }
        sqlx::Error::PoolTimedOut => DbError::Timeout {
            pool: pool.to_string(),
        },
        other => DbError::statement(op, pool, sql, other.to_string()),
    }
}

/// Extract the index name from `Duplicate entry '…' for key '…'`.
/// MySQL 8 qualifies the key with the table name.
fn duplicate_key_name(message: &str) -> String {
    message
        .rsplit_once("for key '")
        .map(|(_, tail)| tail.trim_end_matches('\''))
        .map(|key| key.rsplit('.').next().unwrap_or(key))
        .unwrap_or("unknown")
        .to_string()
}

/// Extract the constraint name from a foreign-key violation message.
fn constraint_name(message: &str) -> String {
    message
        .split_once("CONSTRAINT `")
        .and_then(|(_, tail)| tail.split('`').next())
        .unwrap_or("unknown")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_key_extraction() {
        assert_eq!(
            duplicate_key_name("Duplicate entry 'Ada' for key 'Name'"),
            "Name"
        );
        assert_eq!(
            duplicate_key_name("Duplicate entry 'Ada' for key 'User.Name'"),
            "Name"
        );
        assert_eq!(duplicate_key_name("nonsense"), "unknown");
    }

    #[test]
    fn constraint_extraction() {
        let message = "Cannot delete or update a parent row: a foreign key constraint fails \
                       (`app`.`Post`, CONSTRAINT `app:Post:Author` FOREIGN KEY (`Author`) \
                       REFERENCES `User` (`ID`))";
        assert_eq!(constraint_name(message), "app:Post:Author");
    }
}
