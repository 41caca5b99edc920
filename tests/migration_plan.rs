//! Migration planning against a synthetic live catalog.

mod support;

use support::fixture;

#[tokio::test]
async fn empty_catalog_plans_creates_with_constraints_last() {
    let fx = fixture();
    let engine = fx.registry.create_engine();

    // SHOW TABLES on the only pool: nothing exists yet.
    fx.conn.push_query_result(Vec::new());
    let alters = engine.get_alters().await.expect("plan");

    // Two creates (Post references User, same pool) plus the log table
    // and one ADD CONSTRAINT alter.
    assert_eq!(alters.len(), 4);
    assert!(alters.iter().all(|alter| alter.safe));
    assert!(alters
        .iter()
        .take(3)
        .all(|alter| alter.sql.starts_with("CREATE TABLE")));
    let last = alters.last().expect("constraint alter");
    assert!(last.sql.contains("ADD CONSTRAINT `app:Post:Author` FOREIGN KEY (`Author`)"));
    assert!(last.sql.contains("REFERENCES `app`.`User` (`ID`) ON DELETE RESTRICT"));

    let post_create = alters
        .iter()
        .find(|alter| alter.sql.starts_with("CREATE TABLE `app`.`Post`"))
        .expect("post create");
    assert!(post_create.sql.contains("`Title` varchar(100) NOT NULL DEFAULT ''"));
    assert!(post_create.sql.contains("`Author` bigint(20) unsigned DEFAULT NULL"));
    assert!(post_create.sql.contains("`FakeDelete` bigint(20) unsigned NOT NULL DEFAULT '0'"));
    assert!(post_create.sql.contains("INDEX `Author` (`Author`)"));

    let log_create = alters
        .iter()
        .find(|alter| alter.sql.contains("`_log_Post`"))
        .expect("log table create");
    assert!(log_create.sql.contains("`entity_id` int(10) unsigned NOT NULL"));
    assert!(log_create.sql.contains("KEY_BLOCK_SIZE=8"));
}

#[tokio::test]
async fn unknown_table_is_dropped_unsafely_when_populated() {
    let fx = fixture();
    let engine = fx.registry.create_engine();

    // SHOW TABLES reports a leftover table nothing declares.
    fx.conn
        .push_query_result(vec![vec!["Legacy".to_string().into()]]);
    // User: SHOW CREATE TABLE / SHOW INDEXES / FK query / emptiness.
    // Neither User nor Post exist, so only the leftover table is probed:
    // SHOW CREATE TABLE, SHOW INDEXES is skipped (fetch reads the create
    // first), information-schema FKs, then the emptiness probe.
    fx.conn.push_query_result(vec![vec![
        "Legacy".to_string().into(),
        "CREATE TABLE `Legacy` (\n  `ID` int(10) unsigned NOT NULL AUTO_INCREMENT,\n  PRIMARY KEY (`ID`)\n) ENGINE=InnoDB".to_string().into(),
    ]]);
    fx.conn.push_query_result(Vec::new()); // SHOW INDEXES
    fx.conn.push_query_result(Vec::new()); // information schema FKs
    fx.conn
        .push_query_result(vec![vec![stratum::SqlValue::UInt(9)]]); // SELECT ID LIMIT 1

    let alters = engine.get_alters().await.expect("plan");
    let drop = alters
        .iter()
        .find(|alter| alter.sql.starts_with("DROP TABLE IF EXISTS `app`.`Legacy`"))
        .expect("drop for unknown table");
    assert!(!drop.safe);
}
