//! Migration planner.
//!
//! Diffs every registered schema against the live catalog and emits an
//! ordered, safety-classified list of DDL statements. Applying the plan
//! and re-planning yields an empty list.

mod diff;
mod live;

pub(crate) use diff::{create_table_sql, diff_table};
pub(crate) use live::{fetch_live_table, is_table_empty, normalize_sql, show_tables, LiveTable};

use std::collections::{BTreeMap, BTreeSet};

use tracing::info;

use crate::error::StratumError;
use crate::schema::ValidatedRegistry;

const SOURCE: &str = "migrate";

/// One planned DDL statement.
///
/// `safe` statements only add things or touch empty tables; everything
/// destructive on live data is flagged for a human decision.
#[derive(Debug, Clone)]
pub struct Alter {
    pub sql: String,
    pub safe: bool,
    pub pool: String,
}

/// Compute the full migration plan for the registry.
pub async fn plan_alters(registry: &ValidatedRegistry) -> Result<Vec<Alter>, StratumError> {
    let mut alters: Vec<Alter> = Vec::new();

    let mut tables_in_db: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut tables_expected: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for pool in registry.sql_pool_names() {
        let conn = registry.sql_conn(pool)?;
        tables_in_db.insert(pool.to_string(), show_tables(conn).await?);
        tables_expected.insert(pool.to_string(), BTreeSet::new());
    }

    for schema in registry.schemas() {
        let conn = registry.sql_conn(&schema.pool_name)?;
        let db_name = conn.database_name().await?;
        tables_expected
            .get_mut(&schema.pool_name)
            .expect("pool checked during validate")
            .insert(schema.table_name.clone());

        let exists = tables_in_db
            .get(&schema.pool_name)
            .is_some_and(|tables| tables.contains(&schema.table_name));
        let (live, empty) = if exists {
            let live = fetch_live_table(conn, &db_name, &schema.table_name).await?;
            let empty = is_table_empty(conn, &schema.table_name).await?;
            (Some(live), empty)
        } else {
            (None, true)
        };
        alters.extend(diff_table(schema, &db_name, live.as_ref(), empty));

        if let Some(log_pool) = &schema.log_pool {
            let log_conn = registry.sql_conn(log_pool)?;
            let log_db = log_conn.database_name().await?;
            let log_table = schema.log_table_name();
            tables_expected
                .get_mut(log_pool)
                .expect("pool checked during validate")
                .insert(log_table.clone());
            let canonical = log_table_sql(&log_db, &log_table);
            let log_exists = tables_in_db
                .get(log_pool)
                .is_some_and(|tables| tables.contains(&log_table));
            if !log_exists {
                alters.push(Alter {
                    sql: canonical,
                    safe: true,
                    pool: log_pool.clone(),
                });
            } else {
                let current = live::show_create_table(log_conn, &log_table).await?;
                let current =
                    current.replacen("CREATE TABLE ", &format!("CREATE TABLE `{log_db}`."), 1) + ";";
                // The log table has no migration path; a shape change is a
                // drop and re-create.
                if normalize_sql(&current) != normalize_sql(&canonical) {
                    let empty = is_table_empty(log_conn, &log_table).await.unwrap_or(false);
                    alters.push(Alter {
                        sql: format!("DROP TABLE `{log_db}`.`{log_table}`;"),
                        safe: empty,
                        pool: log_pool.clone(),
                    });
                    alters.push(Alter {
                        sql: canonical,
                        safe: true,
                        pool: log_pool.clone(),
                    });
                }
            }
        }
    }

    // Tables nothing declares any more: drop their foreign keys, then the
    // table itself.
    for (pool, tables) in &tables_in_db {
        let expected = &tables_expected[pool];
        let conn = registry.sql_conn(pool)?;
        let db_name = conn.database_name().await?;
        for table in tables {
            if expected.contains(table) {
                continue;
            }
            let live = fetch_live_table(conn, &db_name, table).await?;
            if !live.foreign_keys.is_empty() {
                let mut drops: Vec<String> = live
                    .foreign_keys
                    .keys()
                    .map(|name| format!("DROP FOREIGN KEY `{name}`"))
                    .collect();
                drops.sort();
                alters.push(Alter {
                    sql: format!(
                        "ALTER TABLE `{db_name}`.`{table}`\n    {};",
                        drops.join(",\n    ")
                    ),
                    safe: true,
                    pool: pool.clone(),
                });
            }
            let empty = is_table_empty(conn, table).await?;
            alters.push(Alter {
                sql: format!("DROP TABLE IF EXISTS `{db_name}`.`{table}`;"),
                safe: empty,
                pool: pool.clone(),
            });
        }
    }

    let ordered = order_alters(alters);
    info!(target: SOURCE, statements = ordered.len(), "migration plan computed");
    Ok(ordered)
}

/// Ordering contract: every `DROP FOREIGN KEY` first, then the rest by
/// statement length, then every `ADD CONSTRAINT` last. Shorter statements
/// run earlier within each band.
pub(crate) fn order_alters(alters: Vec<Alter>) -> Vec<Alter> {
    let mut drops_fk = Vec::new();
    let mut normal = Vec::new();
    let mut adds_fk = Vec::new();
    for alter in alters {
        if alter.sql.contains("DROP FOREIGN KEY") {
            drops_fk.push(alter);
        } else if alter.sql.contains("ADD CONSTRAINT") {
            adds_fk.push(alter);
        } else {
            normal.push(alter);
        }
    }
    drops_fk.sort_by_key(|alter| alter.sql.len());
    normal.sort_by_key(|alter| alter.sql.len());
    let mut ordered = drops_fk;
    ordered.append(&mut normal);
    ordered.append(&mut adds_fk);
    ordered
}

fn log_table_sql(database: &str, table: &str) -> String {
    format!(
        "CREATE TABLE `{database}`.`{table}` (\n  \
         `id` bigint(11) unsigned NOT NULL AUTO_INCREMENT,\n  \
         `entity_id` int(10) unsigned NOT NULL,\n  \
         `added_at` datetime NOT NULL,\n  \
         `meta` json DEFAULT NULL,\n  \
         `data` json DEFAULT NULL,\n  \
         PRIMARY KEY (`id`),\n  \
         KEY `entity_id` (`entity_id`)\n\
         ) ENGINE=InnoDB DEFAULT CHARSET=utf8 ROW_FORMAT=COMPRESSED KEY_BLOCK_SIZE=8;"
    )
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::diff::{build_index_sql, expected_foreign_keys};
    use super::live::parse_columns;
    use super::*;
    use crate::schema::{
        EntityDeclaration, FieldDecl, FieldKind, IndexDef, Registry, TableSchema,
    };
    use crate::entity::{Entity, EntityMeta, SqlValue};

    #[derive(Default)]
    struct Author {
        meta: EntityMeta,
        id: u64,
        name: String,
    }

    impl Entity for Author {
        fn entity_name(&self) -> &'static str {
            "Author"
        }
        fn meta(&self) -> &EntityMeta {
            &self.meta
        }
        fn meta_mut(&mut self) -> &mut EntityMeta {
            &mut self.meta
        }
        fn id(&self) -> u64 {
            self.id
        }
        fn set_id(&mut self, id: u64) {
            self.id = id;
        }
        fn to_row(&self) -> Vec<SqlValue> {
            vec![self.name.clone().into()]
        }
        fn apply_row(&mut self, row: &[SqlValue]) -> Result<(), crate::schema::SchemaError> {
            self.name = row[0].as_str().unwrap_or_default().to_string();
            Ok(())
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
        fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
            self
        }
    }

    impl crate::entity::EntityDef for Author {
        const NAME: &'static str = "Author";
        fn declaration() -> EntityDeclaration {
            EntityDeclaration {
                name: "Author",
                meta_tags: "",
                fields: vec![
                    FieldDecl::new("ID", FieldKind::U64),
                    FieldDecl::new("Name", FieldKind::Str).tags("length=40;unique=Name"),
                ],
                queries: Vec::new(),
            }
        }
    }

    fn author_schema() -> TableSchema {
        let mut registry = Registry::new();
        registry.register_sql_conn("default", test_conn());
        registry.register_entity::<Author>();
        let validated = registry.validate().expect("validate");
        validated.schema("Author").expect("schema").as_ref().clone()
    }

    fn test_conn() -> std::sync::Arc<dyn crate::db::SqlConn> {
        std::sync::Arc::new(crate::db::testing::RecordingConn::new("app"))
    }

    /// Live shape assembled from the schema's own rendering: what the
    /// catalog looks like right after the plan has been applied.
    fn live_from(schema: &TableSchema, db_name: &str) -> LiveTable {
        let create = create_table_sql(schema, db_name);
        let mut indexes: BTreeMap<String, IndexDef> = schema.indexes.clone();
        indexes.insert(
            "PRIMARY".to_string(),
            IndexDef {
                unique: true,
                columns: BTreeMap::from([(1, "ID".to_string())]),
            },
        );
        LiveTable {
            columns: parse_columns(&create),
            indexes,
            foreign_keys: expected_foreign_keys(schema, db_name),
            create_sql: create,
        }
    }

    #[test]
    fn missing_table_creates_it() {
        let schema = author_schema();
        let alters = diff_table(&schema, "app", None, true);
        assert_eq!(alters.len(), 1);
        assert!(alters[0].safe);
        assert!(alters[0].sql.starts_with("CREATE TABLE `app`.`Author`"));
        assert!(alters[0].sql.contains("`ID` bigint(20) unsigned NOT NULL AUTO_INCREMENT"));
        assert!(alters[0].sql.contains("UNIQUE INDEX `Name`"));
        assert!(alters[0].sql.contains("PRIMARY KEY (`ID`)"));
    }

    #[test]
    fn applied_plan_rediffs_to_nothing() {
        let schema = author_schema();
        let live = live_from(&schema, "app");
        let alters = diff_table(&schema, "app", Some(&live), true);
        assert!(alters.is_empty(), "unexpected alters: {alters:?}");
    }

    #[test]
    fn added_column_anchors_after_predecessor() {
        let schema = author_schema();
        let mut live = live_from(&schema, "app");
        live.columns.retain(|(name, _)| name != "Name");
        live.indexes.remove("Name");
        let alters = diff_table(&schema, "app", Some(&live), false);
        assert_eq!(alters.len(), 1);
        assert!(alters[0].safe);
        assert!(alters[0].sql.contains("ADD COLUMN `Name` varchar(40) DEFAULT NULL AFTER `ID`"));
        assert!(alters[0].sql.contains("ADD UNIQUE INDEX `Name` (`Name`)"));
    }

    #[test]
    fn dropped_column_is_unsafe_on_populated_table() {
        let schema = author_schema();
        let mut live = live_from(&schema, "app");
        live.columns.push((
            "Legacy".to_string(),
            "`Legacy` int(11) DEFAULT NULL".to_string(),
        ));
        let populated = diff_table(&schema, "app", Some(&live), false);
        assert_eq!(populated.len(), 1);
        assert!(!populated[0].safe);
        assert!(populated[0].sql.contains("DROP COLUMN `Legacy`"));

        let empty = diff_table(&schema, "app", Some(&live), true);
        assert!(empty[0].safe);
    }

    #[test]
    fn changed_definition_carries_comment() {
        let schema = author_schema();
        let mut live = live_from(&schema, "app");
        live.columns[1].1 = "`Name` varchar(80) DEFAULT NULL".to_string();
        let alters = diff_table(&schema, "app", Some(&live), false);
        assert!(alters[0]
            .sql
            .contains("CHANGE COLUMN `Name` `Name` varchar(40) DEFAULT NULL AFTER `ID`"));
        assert!(alters[0].sql.contains("/*CHANGED FROM `Name` varchar(80) DEFAULT NULL*/"));
        assert!(!alters[0].safe);
    }

    #[test]
    fn ordering_bands() {
        let alters = vec![
            Alter {
                sql: "ALTER TABLE `a`.`t`\n    ADD CONSTRAINT `x` FOREIGN KEY (`C`) REFERENCES `a`.`p` (`ID`) ON DELETE RESTRICT;".into(),
                safe: true,
                pool: "default".into(),
            },
            Alter {
                sql: "CREATE TABLE `a`.`t2` (`ID` int(10) unsigned NOT NULL);".into(),
                safe: true,
                pool: "default".into(),
            },
            Alter {
                sql: "ALTER TABLE `a`.`old`\n    DROP FOREIGN KEY `y`;".into(),
                safe: true,
                pool: "default".into(),
            },
            Alter {
                sql: "DROP TABLE IF EXISTS `a`.`old`;".into(),
                safe: false,
                pool: "default".into(),
            },
        ];
        let ordered = order_alters(alters);
        assert!(ordered[0].sql.contains("DROP FOREIGN KEY"));
        assert_eq!(ordered[1].sql, "DROP TABLE IF EXISTS `a`.`old`;");
        assert!(ordered[2].sql.starts_with("CREATE TABLE"));
        assert!(ordered[3].sql.contains("ADD CONSTRAINT"));
    }

    #[test]
    fn index_sql_rendering() {
        let index = IndexDef {
            unique: false,
            columns: BTreeMap::from([(1, "A".to_string()), (2, "B".to_string())]),
        };
        assert_eq!(build_index_sql("pair", &index), "ADD INDEX `pair` (`A`,`B`)");
    }
}
