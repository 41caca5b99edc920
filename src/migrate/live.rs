//! Live catalog introspection.
//!
//! Reads the current shape of a table out of the row store: columns in
//! order from `SHOW CREATE TABLE`, indexes from `SHOW INDEXES`, foreign
//! keys from the information schema with `ON DELETE` recovered from the
//! create statement.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::db::{DbError, SqlConn};
use crate::entity::SqlValue;
use crate::schema::IndexDef;

/// A foreign key as it exists in the catalog.
#[derive(Debug, Clone)]
pub(crate) struct LiveForeignKey {
    pub column: String,
    pub table: String,
    pub database: String,
    pub on_delete: String,
}

/// Current shape of one table.
#[derive(Debug, Default)]
pub(crate) struct LiveTable {
    /// `(name, definition)` in catalog order.
    pub columns: Vec<(String, String)>,
    pub indexes: BTreeMap<String, IndexDef>,
    pub foreign_keys: BTreeMap<String, LiveForeignKey>,
    pub create_sql: String,
}

/// Collapse whitespace runs so formatting differences between the
/// renderer and the server never produce spurious alters.
pub(crate) fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub(crate) async fn show_tables(conn: &Arc<dyn SqlConn>) -> Result<Vec<String>, DbError> {
    let rows = conn.query("SHOW TABLES", &[]).await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| row.into_iter().next())
        .filter_map(|value| value.as_str().map(str::to_string))
        .collect())
}

pub(crate) async fn show_create_table(
    conn: &Arc<dyn SqlConn>,
    table: &str,
) -> Result<String, DbError> {
    let rows = conn
        .query(&format!("SHOW CREATE TABLE `{table}`"), &[])
        .await?;
    Ok(rows
        .first()
        .and_then(|row| row.get(1))
        .and_then(|value| value.as_str())
        .unwrap_or_default()
        .to_string())
}

/// A table is treated as empty when it has no first row.
pub(crate) async fn is_table_empty(
    conn: &Arc<dyn SqlConn>,
    table: &str,
) -> Result<bool, DbError> {
    let rows = conn
        .query(&format!("SELECT `ID` FROM `{table}` LIMIT 1"), &[])
        .await?;
    Ok(rows.is_empty())
}

pub(crate) async fn fetch_live_table(
    conn: &Arc<dyn SqlConn>,
    database: &str,
    table: &str,
) -> Result<LiveTable, DbError> {
    let create_sql = show_create_table(conn, table).await?;
    let columns = parse_columns(&create_sql);

    let mut indexes: BTreeMap<String, IndexDef> = BTreeMap::new();
    let rows = conn
        .query(&format!("SHOW INDEXES FROM `{table}`"), &[])
        .await?;
    for row in rows {
        let non_unique = row.get(1).and_then(SqlValue::as_u64).unwrap_or(1);
        let Some(key_name) = row.get(2).and_then(|v| v.as_str()) else {
            continue;
        };
        let seq = row.get(3).and_then(SqlValue::as_u64).unwrap_or(1) as u16;
        let Some(column) = row.get(4).and_then(|v| v.as_str()) else {
            continue;
        };
        indexes
            .entry(key_name.to_string())
            .and_modify(|index| {
                index.columns.insert(seq, column.to_string());
            })
            .or_insert_with(|| IndexDef {
                unique: non_unique == 0,
                columns: BTreeMap::from([(seq, column.to_string())]),
            });
    }

    let mut foreign_keys = BTreeMap::new();
    let fk_rows = conn
        .query(
            "SELECT CONSTRAINT_NAME, COLUMN_NAME, REFERENCED_TABLE_NAME, REFERENCED_TABLE_SCHEMA \
             FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE WHERE REFERENCED_TABLE_SCHEMA IS NOT NULL \
             AND TABLE_SCHEMA = ? AND TABLE_NAME = ?",
            &[
                SqlValue::Str(database.to_string()),
                SqlValue::Str(table.to_string()),
            ],
        )
        .await?;
    for row in fk_rows {
        let name = row.first().and_then(|v| v.as_str()).unwrap_or_default();
        let column = row.get(1).and_then(|v| v.as_str()).unwrap_or_default();
        let ref_table = row.get(2).and_then(|v| v.as_str()).unwrap_or_default();
        let ref_schema = row.get(3).and_then(|v| v.as_str()).unwrap_or_default();
        foreign_keys.insert(
            name.to_string(),
            LiveForeignKey {
                column: column.to_string(),
                table: ref_table.to_string(),
                database: ref_schema.to_string(),
                on_delete: parse_on_delete(&create_sql, name),
            },
        );
    }

    Ok(LiveTable {
        columns,
        indexes,
        foreign_keys,
        create_sql,
    })
}

/// Column lines out of a `SHOW CREATE TABLE` statement, in order.
pub(crate) fn parse_columns(create_sql: &str) -> Vec<(String, String)> {
    let mut columns = Vec::new();
    for line in create_sql.lines().skip(1) {
        let line = line.trim().trim_end_matches(',');
        if !line.starts_with('`') {
            continue;
        }
        let Some(name) = line.split('`').nth(1) else {
            continue;
        };
        columns.push((name.to_string(), line.to_string()));
    }
    columns
}

/// Recover a constraint's `ON DELETE` policy from the create statement;
/// the catalog view omits it.
pub(crate) fn parse_on_delete(create_sql: &str, constraint: &str) -> String {
    let marker = format!("CONSTRAINT `{constraint}`");
    for line in create_sql.lines() {
        let line = line.trim().trim_end_matches(',');
        if !line.starts_with(&marker) {
            continue;
        }
        let words: Vec<&str> = line.split(' ').collect();
        if words.len() >= 2 && words[words.len() - 2].eq_ignore_ascii_case("DELETE") {
            return words[words.len() - 1].to_uppercase();
        }
    }
    "RESTRICT".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CREATE: &str = "CREATE TABLE `Post` (\n\
        `ID` int(10) unsigned NOT NULL AUTO_INCREMENT,\n\
        `Title` varchar(100) DEFAULT NULL,\n\
        `Author` bigint(20) unsigned DEFAULT NULL,\n\
        PRIMARY KEY (`ID`),\n\
        KEY `Author` (`Author`),\n\
        CONSTRAINT `app:Post:Author` FOREIGN KEY (`Author`) REFERENCES `User` (`ID`) ON DELETE CASCADE\n\
        ) ENGINE=InnoDB";

    #[test]
    fn columns_in_order() {
        let columns = parse_columns(CREATE);
        assert_eq!(columns.len(), 3);
        assert_eq!(columns[0].0, "ID");
        assert_eq!(columns[1].1, "`Title` varchar(100) DEFAULT NULL");
        assert_eq!(columns[2].0, "Author");
    }

    #[test]
    fn on_delete_recovered() {
        assert_eq!(parse_on_delete(CREATE, "app:Post:Author"), "CASCADE");
        assert_eq!(parse_on_delete(CREATE, "missing"), "RESTRICT");
    }

    #[test]
    fn whitespace_normalization() {
        assert_eq!(
            normalize_sql("  `Age`   int(11)\n NOT NULL "),
            normalize_sql("`Age` int(11) NOT NULL")
        );
    }
}
