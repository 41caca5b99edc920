//! Expected-vs-live table diff.
//!
//! Renders the canonical DDL for a schema and diffs it, order-sensitive,
//! against the live table shape. Produces at most three statements per
//! table: the normal alter, a `DROP FOREIGN KEY` alter and an
//! `ADD CONSTRAINT` alter, so referential integrity never blocks a step.

use std::collections::BTreeMap;

use super::live::{normalize_sql, LiveForeignKey, LiveTable};
use super::Alter;
use crate::schema::{IndexDef, TableSchema};

/// Constraint name scheme: `<database>:<table>:<column>`.
pub(crate) fn foreign_key_name(database: &str, table: &str, column: &str) -> String {
    format!("{database}:{table}:{column}")
}

pub(crate) fn build_index_sql(name: &str, index: &IndexDef) -> String {
    let columns: Vec<String> = index
        .columns
        .values()
        .map(|column| format!("`{column}`"))
        .collect();
    let kind = if index.unique { "UNIQUE INDEX" } else { "INDEX" };
    format!("ADD {kind} `{name}` ({})", columns.join(","))
}

fn build_foreign_key_sql(name: &str, key: &LiveForeignKey) -> String {
    format!(
        "ADD CONSTRAINT `{name}` FOREIGN KEY (`{}`) REFERENCES `{}`.`{}` (`ID`) ON DELETE {}",
        key.column, key.database, key.table, key.on_delete
    )
}

/// Foreign keys a schema expects, keyed by constraint name.
pub(crate) fn expected_foreign_keys(
    schema: &TableSchema,
    db_name: &str,
) -> BTreeMap<String, LiveForeignKey> {
    schema
        .ref_columns
        .iter()
        .filter_map(|reference| {
            let on_delete = reference.foreign_key?;
            let name = foreign_key_name(db_name, &schema.table_name, &reference.column);
            Some((
                name,
                LiveForeignKey {
                    column: reference.column.clone(),
                    table: reference.target_table.clone(),
                    database: db_name.to_string(),
                    on_delete: on_delete.as_sql().to_string(),
                },
            ))
        })
        .collect()
}

/// Canonical `CREATE TABLE` for a schema.
pub(crate) fn create_table_sql(schema: &TableSchema, db_name: &str) -> String {
    let mut sql = format!("CREATE TABLE `{db_name}`.`{}` (\n", schema.table_name);
    for (position, column) in schema.columns.iter().enumerate() {
        if position == 0 {
            sql.push_str(&format!("  {} AUTO_INCREMENT,\n", column.definition));
        } else {
            sql.push_str(&format!("  {},\n", column.definition));
        }
    }
    let mut index_lines: Vec<String> = schema
        .indexes
        .iter()
        .map(|(name, index)| build_index_sql(name, index))
        .collect();
    index_lines.sort();
    for line in index_lines {
        // Strip the `ADD ` prefix inside a create statement.
        sql.push_str(&format!("  {},\n", &line[4..]));
    }
    sql.push_str("  PRIMARY KEY (`ID`)\n");
    sql.push_str(") ENGINE=InnoDB DEFAULT CHARSET=utf8;");
    sql
}

/// `ALTER TABLE … ADD CONSTRAINT …` for every expected foreign key.
pub(crate) fn add_foreign_keys_sql(schema: &TableSchema, db_name: &str) -> Option<String> {
    let keys = expected_foreign_keys(schema, db_name);
    if keys.is_empty() {
        return None;
    }
    let mut lines: Vec<String> = keys
        .iter()
        .map(|(name, key)| build_foreign_key_sql(name, key))
        .collect();
    lines.sort();
    let mut sql = format!("ALTER TABLE `{db_name}`.`{}`\n", schema.table_name);
    sql.push_str(
        &lines
            .iter()
            .map(|line| format!("  {line}"))
            .collect::<Vec<_>>()
            .join(",\n"),
    );
    sql.push(';');
    Some(sql)
}

/// Diff one schema against the live catalog.
///
/// `live` is `None` when the table does not exist; `table_empty` reports
/// whether the existing table held any row when the plan was computed.
pub(crate) fn diff_table(
    schema: &TableSchema,
    db_name: &str,
    live: Option<&LiveTable>,
    table_empty: bool,
) -> Vec<Alter> {
    let pool = schema.pool_name.clone();
    let Some(live) = live else {
        let mut alters = vec![Alter {
            sql: create_table_sql(schema, db_name),
            safe: true,
            pool: pool.clone(),
        }];
        if let Some(sql) = add_foreign_keys_sql(schema, db_name) {
            alters.push(Alter {
                sql,
                safe: true,
                pool,
            });
        }
        return alters;
    };

    let expected_fks = expected_foreign_keys(schema, db_name);

    let mut new_columns = Vec::new();
    let mut changed_columns: Vec<(String, String)> = Vec::new();
    for (position, column) in schema.columns.iter().enumerate() {
        let live_here = live
            .columns
            .get(position)
            .map(|(_, definition)| definition.as_str())
            .unwrap_or("");
        let mut expected_definition = column.definition.clone();
        if position == 0 {
            expected_definition.push_str(" AUTO_INCREMENT");
        }
        if normalize_sql(live_here) == normalize_sql(&expected_definition) {
            continue;
        }
        let by_name = live.columns.iter().position(|(name, _)| *name == column.name);
        let by_definition = live
            .columns
            .iter()
            .position(|(_, definition)| normalize_sql(definition) == normalize_sql(&expected_definition));
        let anchor = if position > 0 {
            format!(" AFTER `{}`", schema.columns[position - 1].name)
        } else {
            String::new()
        };
        match by_name {
            None => new_columns.push(format!("ADD COLUMN {expected_definition}{anchor}")),
            Some(found) if by_definition.is_none() => changed_columns.push((
                format!("CHANGE COLUMN `{}` {expected_definition}{anchor}", column.name),
                format!("CHANGED FROM {}", live.columns[found].1),
            )),
            Some(_) => changed_columns.push((
                format!("CHANGE COLUMN `{}` {expected_definition}{anchor}", column.name),
                "CHANGED ORDER".to_string(),
            )),
        }
    }
    let dropped_columns: Vec<String> = live
        .columns
        .iter()
        .filter(|(name, _)| !schema.columns.iter().any(|column| column.name == *name))
        .map(|(name, _)| format!("DROP COLUMN `{name}`"))
        .collect();

    let mut new_indexes = Vec::new();
    let mut dropped_indexes = Vec::new();
    for (name, index) in &schema.indexes {
        match live.indexes.get(name) {
            None => new_indexes.push(build_index_sql(name, index)),
            Some(live_index) => {
                if build_index_sql(name, index) != build_index_sql(name, live_index) {
                    dropped_indexes.push(format!("DROP INDEX `{name}`"));
                    new_indexes.push(build_index_sql(name, index));
                }
            }
        }
    }
    for name in live.indexes.keys() {
        if name != "PRIMARY"
            && !schema.indexes.contains_key(name)
            && !expected_fks.contains_key(name)
        {
            dropped_indexes.push(format!("DROP INDEX `{name}`"));
        }
    }

    let mut new_fks = Vec::new();
    let mut dropped_fks = Vec::new();
    for (name, expected) in &expected_fks {
        match live.foreign_keys.get(name) {
            None => new_fks.push(build_foreign_key_sql(name, expected)),
            Some(live_fk) => {
                if build_foreign_key_sql(name, expected) != build_foreign_key_sql(name, live_fk) {
                    dropped_fks.push(format!("DROP FOREIGN KEY `{name}`"));
                    new_fks.push(build_foreign_key_sql(name, expected));
                }
            }
        }
    }
    for name in live.foreign_keys.keys() {
        if !expected_fks.contains_key(name) {
            dropped_fks.push(format!("DROP FOREIGN KEY `{name}`"));
        }
    }

    let mut alters = Vec::new();

    let mut lines: Vec<(String, String)> = Vec::new();
    for entry in &dropped_columns {
        lines.push((entry.clone(), String::new()));
    }
    for entry in &new_columns {
        lines.push((entry.clone(), String::new()));
    }
    for (entry, comment) in &changed_columns {
        lines.push((entry.clone(), comment.clone()));
    }
    dropped_indexes.sort();
    for entry in &dropped_indexes {
        lines.push((entry.clone(), String::new()));
    }
    new_indexes.sort();
    for entry in &new_indexes {
        lines.push((entry.clone(), String::new()));
    }
    if !lines.is_empty() {
        let mut sql = format!("ALTER TABLE `{db_name}`.`{}`\n", schema.table_name);
        let last = lines.len() - 1;
        for (position, (entry, comment)) in lines.iter().enumerate() {
            sql.push_str(&format!("    {entry}"));
            sql.push(if position == last { ';' } else { ',' });
            if !comment.is_empty() {
                sql.push_str(&format!("/*{comment}*/"));
            }
            if position != last {
                sql.push('\n');
            }
        }
        let safe = (dropped_columns.is_empty() && changed_columns.is_empty()) || table_empty;
        alters.push(Alter {
            sql,
            safe,
            pool: pool.clone(),
        });
    }

    if !dropped_fks.is_empty() {
        dropped_fks.sort();
        let mut sql = format!("ALTER TABLE `{db_name}`.`{}`\n", schema.table_name);
        sql.push_str(
            &dropped_fks
                .iter()
                .map(|line| format!("    {line}"))
                .collect::<Vec<_>>()
                .join(",\n"),
        );
        sql.push(';');
        alters.push(Alter {
            sql,
            safe: true,
            pool: pool.clone(),
        });
    }

    if !new_fks.is_empty() {
        new_fks.sort();
        let mut sql = format!("ALTER TABLE `{db_name}`.`{}`\n", schema.table_name);
        sql.push_str(
            &new_fks
                .iter()
                .map(|line| format!("    {line}"))
                .collect::<Vec<_>>()
                .join(",\n"),
        );
        sql.push(';');
        alters.push(Alter {
            sql,
            safe: true,
            pool,
        });
    }

    alters
}
