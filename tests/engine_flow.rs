//! End-to-end write/read flows over the recording driver and in-memory
//! cache/bus backends.

mod support;

use std::time::Duration;

use stratum::bus::HandlerError;
use stratum::cache::keys::{arg_hash, pack_row, query_page_key};
use stratum::cache::KvBackend;
use stratum::db::DbError;
use stratum::engine::{
    CacheReconcileReceiver, DirtyAction, DirtyRecord, LazyFlushReceiver, LogReceiver,
};
use stratum::entity::{Ref, SqlValue};
use stratum::schema::LAZY_QUEUE;
use stratum::{Entity, Pager, Predicate, StratumError, Tracked};

use support::{fixture, Post, User};

fn ada() -> User {
    User {
        name: "Ada".to_string(),
        age: 36,
        ..Default::default()
    }
}

#[tokio::test]
async fn insert_then_load_populates_both_caches() {
    let fx = fixture();
    let mut engine = fx.registry.create_engine();

    let user = Tracked::new(ada());
    engine.track(&user);
    engine.flush().await.expect("flush");

    assert_eq!(user.id(), 1);
    let inserts = fx.conn.calls_starting_with("INSERT");
    assert_eq!(inserts.len(), 1);
    assert_eq!(
        inserts[0].sql,
        "INSERT INTO `User`(`Name`,`Age`) VALUES (?,?)"
    );
    assert_eq!(inserts[0].params[0], SqlValue::Str("Ada".to_string()));
    assert_eq!(inserts[0].params[1], SqlValue::Int(36));

    let image = pack_row(&[SqlValue::Str("Ada".to_string()), SqlValue::Int(36)]);
    let local = fx.registry.local_cache("default").expect("local pool");
    assert_eq!(local.get("User:1"), Some(image.clone()));
    assert_eq!(fx.kv.get("User:1").await.expect("kv get"), Some(image));

    // Round trip entirely out of the caches.
    let selects_before = fx.conn.calls_starting_with("SELECT").len();
    let mut loaded = User::default();
    let found = engine
        .load_by_id(1, &mut loaded, &[])
        .await
        .expect("load_by_id");
    assert!(found);
    assert_eq!(loaded.name, "Ada");
    assert_eq!(loaded.age, 36);
    assert!(loaded.meta.is_loaded());
    assert_eq!(fx.conn.calls_starting_with("SELECT").len(), selects_before);
}

#[tokio::test]
async fn update_touches_only_changed_columns() {
    let fx = fixture();
    let mut engine = fx.registry.create_engine();

    let user = Tracked::new(ada());
    engine.track(&user);
    engine.flush().await.expect("insert");

    user.write().age = 37;
    assert!(engine.is_dirty(&user).expect("is_dirty"));
    engine.track(&user);
    engine.flush().await.expect("update");

    let updates = fx.conn.calls_starting_with("UPDATE");
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].sql, "UPDATE `User` SET `Age` = ? WHERE `ID` = ?");
    assert_eq!(updates[0].params, vec![SqlValue::Int(37), SqlValue::UInt(1)]);

    let image = pack_row(&[SqlValue::Str("Ada".to_string()), SqlValue::Int(37)]);
    assert_eq!(fx.kv.get("User:1").await.expect("kv"), Some(image.clone()));
    let local = fx.registry.local_cache("default").expect("local pool");
    assert_eq!(local.get("User:1"), Some(image));
}

#[tokio::test]
async fn unmodified_entity_flushes_nothing() {
    let fx = fixture();
    let mut engine = fx.registry.create_engine();

    let user = Tracked::new(ada());
    engine.track(&user);
    engine.flush().await.expect("insert");

    assert!(!engine.is_dirty(&user).expect("is_dirty"));
    engine.track(&user);
    engine.flush().await.expect("second flush");
    assert!(fx.conn.calls_starting_with("UPDATE").is_empty());
}

#[tokio::test]
async fn duplicate_key_rolls_back_and_preserves_tracking() {
    let fx = fixture();
    let mut engine = fx.registry.create_engine();

    let user = Tracked::new(ada());
    engine.track(&user);
    user.write().age = 37;
    engine.flush().await.expect("insert");
    let image_before = fx.kv.get("User:1").await.expect("kv");

    engine.begin("default").await.expect("begin");
    user.write().age = 99;
    engine.track(&user);
    let twin = Tracked::new(ada());
    engine.track(&twin);
    fx.conn.fail_next_exec(DbError::DuplicateKey {
        index: "Name".to_string(),
    });

    let error = engine.flush().await.expect_err("duplicate key");
    assert!(error.is_constraint());
    match error {
        StratumError::Db(DbError::DuplicateKey { index }) => assert_eq!(index, "Name"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(engine.tracked_count(), 2);

    let markers: Vec<String> = fx
        .conn
        .calls()
        .iter()
        .map(|call| call.sql.clone())
        .filter(|sql| sql == "BEGIN" || sql == "ROLLBACK" || sql == "COMMIT")
        .collect();
    assert_eq!(markers, vec!["BEGIN", "ROLLBACK"]);

    // Caches still show the pre-transaction image.
    assert_eq!(fx.kv.get("User:1").await.expect("kv"), image_before);
}

#[tokio::test]
async fn transaction_gates_cache_population() {
    let fx = fixture();
    let mut engine = fx.registry.create_engine();

    engine.begin("default").await.expect("begin");
    let user = Tracked::new(ada());
    engine.track(&user);
    engine.flush().await.expect("flush in transaction");

    assert_eq!(user.id(), 1);
    assert!(fx.kv.get("User:1").await.expect("kv").is_none());
    let local = fx.registry.local_cache("default").expect("local pool");
    assert!(local.get("User:1").is_none());

    engine.commit("default").await.expect("commit");
    assert!(fx.kv.get("User:1").await.expect("kv").is_some());
    assert!(local.get("User:1").is_some());
}

#[tokio::test]
async fn soft_delete_rewrites_to_fake_delete_update() {
    let fx = fixture();
    let mut engine = fx.registry.create_engine();

    let post = Tracked::new(Post {
        title: "Hello".to_string(),
        ..Default::default()
    });
    engine.track(&post);
    engine.flush().await.expect("insert");
    assert_eq!(post.id(), 1);

    engine.delete(&post);
    engine.flush().await.expect("soft delete");
    let updates = fx.conn.calls_starting_with("UPDATE `Post`");
    assert_eq!(
        updates.last().expect("soft delete update").sql,
        "UPDATE `Post` SET `FakeDelete` = 1 WHERE `ID` IN (?)"
    );
    assert_eq!(updates.last().unwrap().params, vec![SqlValue::UInt(1)]);

    // Search filters soft-deleted rows out.
    fx.conn.push_query_result(Vec::new());
    let mut posts: Vec<Post> = Vec::new();
    engine
        .search(&Predicate::all(), None, &mut posts, &[])
        .await
        .expect("search");
    assert!(posts.is_empty());
    let select = fx.conn.calls_starting_with("SELECT `ID`,");
    assert!(select.last().expect("search select").sql.contains("AND `FakeDelete` = 0"));

    // Forced deletion issues a real DELETE.
    let other = Tracked::new(Post {
        title: "Gone".to_string(),
        ..Default::default()
    });
    engine.track(&other);
    engine.flush().await.expect("insert");
    other.write().meta_mut().force_mark_to_delete();
    engine.track(&other);
    engine.flush().await.expect("hard delete");
    let deletes = fx.conn.calls_starting_with("DELETE");
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].sql, "DELETE FROM `Post` WHERE `ID` IN (?)");
}

#[tokio::test]
async fn cached_query_pages_invalidate_on_tracked_field_change() {
    let fx = fixture();
    let mut engine = fx.registry.create_engine();

    let user = Tracked::new(User {
        age: 37,
        ..ada()
    });
    engine.track(&user);
    engine.flush().await.expect("insert");

    fx.conn.push_query_result(vec![vec![SqlValue::UInt(1)]]);
    let mut out: Vec<User> = Vec::new();
    let total = engine
        .cached_search(&mut out, "IndexAge", &Pager::new(1, 10), vec![37.into()])
        .await
        .expect("cached search");
    assert_eq!(total, 1);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].id, 1);

    let warm_key = query_page_key("User", "IndexAge", arg_hash(&[SqlValue::Int(37)]), 0);
    assert!(fx.kv.get(&warm_key).await.expect("kv").is_some());

    // A second call serves ids straight from the cached page.
    let selects = fx.conn.calls_starting_with("SELECT `ID` FROM").len();
    let mut again: Vec<User> = Vec::new();
    engine
        .cached_search(&mut again, "IndexAge", &Pager::new(1, 10), vec![37.into()])
        .await
        .expect("cached search hit");
    assert_eq!(fx.conn.calls_starting_with("SELECT `ID` FROM").len(), selects);

    user.write().age = 38;
    engine.track(&user);
    engine.flush().await.expect("update");

    assert!(fx.kv.get(&warm_key).await.expect("kv").is_none());
    let new_key = query_page_key("User", "IndexAge", arg_hash(&[SqlValue::Int(38)]), 0);
    assert!(fx.kv.get(&new_key).await.expect("kv").is_none());
}

#[tokio::test]
async fn cached_search_one_and_clear_round_trip() {
    let fx = fixture();
    let mut engine = fx.registry.create_engine();

    let user = Tracked::new(ada());
    engine.track(&user);
    engine.flush().await.expect("insert");

    // Warming the single-row index runs the id select once.
    fx.conn.push_query_result(vec![vec![SqlValue::UInt(1)]]);
    let mut found = User::default();
    let hit = engine
        .cached_search_one(&mut found, "ByName", vec!["Ada".into()])
        .await
        .expect("cached search one");
    assert!(hit);
    assert_eq!(found.id, 1);
    assert_eq!(found.name, "Ada");

    let name_page = query_page_key(
        "User",
        "ByName",
        arg_hash(&[SqlValue::Str("Ada".to_string())]),
        0,
    );
    assert!(fx.kv.get(&name_page).await.expect("kv").is_some());

    // A second call serves the id straight from the cached page.
    let selects = fx.conn.calls_starting_with("SELECT `ID` FROM").len();
    let mut again = User::default();
    assert!(engine
        .cached_search_one(&mut again, "ByName", vec!["Ada".into()])
        .await
        .expect("cached hit"));
    assert_eq!(fx.conn.calls_starting_with("SELECT `ID` FROM").len(), selects);

    // Clearing drops the page; the next call recomputes it.
    engine
        .clear_cached_search_one::<User>("ByName", vec!["Ada".into()])
        .await
        .expect("clear one");
    assert!(fx.kv.get(&name_page).await.expect("kv").is_none());

    fx.conn.push_query_result(vec![vec![SqlValue::UInt(1)]]);
    let mut third = User::default();
    assert!(engine
        .cached_search_one(&mut third, "ByName", vec!["Ada".into()])
        .await
        .expect("recompute"));
    assert_eq!(
        fx.conn.calls_starting_with("SELECT `ID` FROM").len(),
        selects + 1
    );

    // The multi-row variant clears its pages the same way.
    fx.conn.push_query_result(vec![vec![SqlValue::UInt(1)]]);
    let mut out: Vec<User> = Vec::new();
    engine
        .cached_search(&mut out, "IndexAge", &Pager::new(1, 10), vec![36.into()])
        .await
        .expect("warm index");
    let age_page = query_page_key("User", "IndexAge", arg_hash(&[SqlValue::Int(36)]), 0);
    assert!(fx.kv.get(&age_page).await.expect("kv").is_some());
    engine
        .clear_cached_search::<User>("IndexAge", vec![36.into()])
        .await
        .expect("clear index");
    assert!(fx.kv.get(&age_page).await.expect("kv").is_none());
}

#[tokio::test]
async fn lazy_flush_defers_to_receiver() {
    let fx = fixture();
    let mut engine = fx.registry.create_engine();

    let user = Tracked::new(ada());
    engine.track(&user);
    engine.flush().await.expect("insert");

    user.write().age = 37;
    engine.track(&user);
    engine.flush_lazy().await.expect("lazy flush");
    assert_eq!(fx.bus.pending(LAZY_QUEUE), 1);
    assert!(fx.conn.calls_starting_with("UPDATE").is_empty());

    // The receiver reads the pre-image for invalidation, then updates.
    fx.conn.push_query_result(vec![vec![
        SqlValue::Str("Ada".to_string()),
        SqlValue::Int(36),
    ]]);
    let mut receiver = LazyFlushReceiver::new(fx.registry.create_engine());
    let applied = receiver.digest().await.expect("digest");
    assert_eq!(applied, 1);

    let updates = fx.conn.calls_starting_with("UPDATE");
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].sql, "UPDATE `User` SET `Age` = ? WHERE `ID` = ?");
    let image = pack_row(&[SqlValue::Str("Ada".to_string()), SqlValue::Int(37)]);
    assert_eq!(fx.kv.get("User:1").await.expect("kv"), Some(image));
    assert_eq!(fx.bus.pending(LAZY_QUEUE), 0);
}

#[tokio::test]
async fn preload_hydrates_references() {
    let fx = fixture();
    let mut engine = fx.registry.create_engine();

    let user = Tracked::new(ada());
    engine.track(&user);
    engine.flush().await.expect("insert user");

    let post = Tracked::new(Post {
        title: "Hello".to_string(),
        author: Ref::to(1),
        ..Default::default()
    });
    engine.track(&post);
    engine.flush().await.expect("insert post");

    // Post rows come back from the store; the author comes out of cache.
    fx.conn.push_query_result(vec![vec![
        SqlValue::UInt(1),
        SqlValue::Str("Hello".to_string()),
        SqlValue::UInt(1),
        SqlValue::UInt(0),
    ]]);
    let mut posts: Vec<Post> = Vec::new();
    engine
        .search(&Predicate::all(), None, &mut posts, &["Author"])
        .await
        .expect("search with preload");
    assert_eq!(posts.len(), 1);
    let author = &posts[0].author;
    assert!(author.loaded());
    assert_eq!(author.entity().expect("hydrated").name, "Ada");
}

#[tokio::test]
async fn load_by_ids_reports_and_negative_caches_misses() {
    let fx = fixture();
    let mut engine = fx.registry.create_engine();

    let user = Tracked::new(ada());
    engine.track(&user);
    engine.flush().await.expect("insert");

    fx.conn.push_query_result(Vec::new());
    let mut users: Vec<User> = Vec::new();
    let missing = engine
        .load_by_ids(&[1, 5], &mut users, &[])
        .await
        .expect("load_by_ids");
    assert_eq!(users.len(), 1);
    assert_eq!(missing, vec![5]);

    // The miss is negative-cached; no further statement is issued.
    let selects = fx.conn.calls_starting_with("SELECT").len();
    let missing = engine
        .load_by_ids(&[1, 5], &mut users, &[])
        .await
        .expect("load_by_ids again");
    assert_eq!(missing, vec![5]);
    assert_eq!(fx.conn.calls_starting_with("SELECT").len(), selects);
}

#[tokio::test]
async fn flush_in_cache_defers_store_write_until_reconcile() {
    let fx = fixture();
    let mut engine = fx.registry.create_engine();

    let user = Tracked::new(ada());
    engine.track(&user);
    engine.flush().await.expect("insert");

    user.write().age = 40;
    engine.track(&user);
    engine.flush_in_cache().await.expect("flush in cache");

    let image = pack_row(&[SqlValue::Str("Ada".to_string()), SqlValue::Int(40)]);
    assert_eq!(fx.kv.get("User:1").await.expect("kv"), Some(image));
    assert!(fx.conn.calls_starting_with("UPDATE").is_empty());

    let mut receiver = CacheReconcileReceiver::new(fx.registry.create_engine(), "default");
    assert_eq!(receiver.backlog().await.expect("backlog"), 1);
    // The store still holds the old row.
    fx.conn.push_query_result(vec![vec![
        SqlValue::Str("Ada".to_string()),
        SqlValue::Int(36),
    ]]);
    let reconciled = receiver.digest().await.expect("digest");
    assert_eq!(reconciled, 1);

    let updates = fx.conn.calls_starting_with("UPDATE");
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].sql, "UPDATE `User` SET `Age` = ? WHERE `ID` = ?");
    assert_eq!(updates[0].params, vec![SqlValue::Int(40), SqlValue::UInt(1)]);
}

#[tokio::test]
async fn change_log_rides_the_log_queue() {
    let fx = fixture();
    let mut engine = fx.registry.create_engine();

    let post = Tracked::new(Post {
        title: "Hello".to_string(),
        ..Default::default()
    });
    engine.track(&post);
    engine.flush().await.expect("insert");

    let mut receiver = LogReceiver::new(fx.registry.create_engine());
    let written = receiver.digest().await.expect("digest");
    assert_eq!(written, 1);

    let inserts = fx.conn.calls_starting_with("INSERT INTO `_log_Post`");
    assert_eq!(inserts.len(), 1);
    assert_eq!(
        inserts[0].sql,
        "INSERT INTO `_log_Post`(`entity_id`,`added_at`,`meta`,`data`) VALUES (?,?,?,?)"
    );
    assert_eq!(inserts[0].params[0], SqlValue::UInt(1));
}

#[tokio::test]
async fn dirty_queue_delivers_change_notifications() {
    let fx = fixture();
    let mut engine = fx.registry.create_engine();

    let user = Tracked::new(ada());
    engine.track(&user);
    engine.flush().await.expect("insert");

    let mut seen: Vec<DirtyRecord> = Vec::new();
    let mut receiver = stratum::engine::DirtyReceiver::new(&engine, "user_changed")
        .expect("dirty receiver");
    receiver
        .digest(|records| {
            seen.extend(records);
            Ok::<(), HandlerError>(())
        })
        .await
        .expect("digest");

    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].entity, "User");
    assert_eq!(seen[0].id, 1);
    assert_eq!(seen[0].action, DirtyAction::Added);
}

#[tokio::test]
async fn batch_flusher_collapses_and_respects_limit() {
    let fx = fixture();
    let mut engine = fx.registry.create_engine();

    let mut flusher = stratum::BatchFlusher::new(2, true);
    let users: Vec<_> = ["Ada", "Grace", "Edsger"]
        .iter()
        .map(|name| {
            Tracked::new(User {
                name: (*name).to_string(),
                age: 36,
                ..Default::default()
            })
        })
        .collect();
    for user in &users {
        flusher.register(&mut engine, user).await.expect("register");
    }
    flusher.flush(&mut engine).await.expect("final flush");

    let inserts = fx.conn.calls_starting_with("INSERT INTO `User`");
    assert_eq!(inserts.len(), 2);
    assert_eq!(
        inserts[0].sql,
        "INSERT INTO `User`(`Name`,`Age`) VALUES (?,?),(?,?)"
    );
    assert_eq!(
        inserts[1].sql,
        "INSERT INTO `User`(`Name`,`Age`) VALUES (?,?)"
    );
    assert_eq!(users[2].id(), 3);

    // Without auto-flush the limit is an error.
    let mut strict = stratum::BatchFlusher::new(1, false);
    strict
        .register(&mut engine, &users[0])
        .await
        .expect("first fits");
    let error = strict
        .register(&mut engine, &users[1])
        .await
        .expect_err("limit exceeded");
    assert!(matches!(error, StratumError::FlusherLimit { limit: 1 }));
}

#[tokio::test]
async fn flush_with_lock_releases_on_success() {
    let fx = fixture();
    let mut engine = fx.registry.create_engine();

    let user = Tracked::new(ada());
    engine.track(&user);
    engine
        .flush_with_lock(
            "default",
            "users",
            Duration::from_secs(5),
            Duration::ZERO,
            Default::default(),
        )
        .await
        .expect("locked flush");
    assert_eq!(user.id(), 1);

    // The lock is free again.
    let locker = engine.locker("default").expect("locker");
    let lock = locker
        .obtain("users", Duration::from_secs(5), Duration::ZERO)
        .await
        .expect("obtain");
    assert!(lock.is_some());
}
