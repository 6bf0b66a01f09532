//! End-to-end coverage against the bundled SQLite driver.

use std::collections::BTreeMap;

use sqlgate::{Config, Context, DbOptions, DbType, TxOptions, Value, DB};

async fn memory_db(opts: DbOptions) -> DB {
    DB::new(
        Config {
            db_type: DbType::Sqlite,
            database: ":memory:".to_string(),
            ..Config::default()
        },
        opts,
    )
    .await
    .expect("open in-memory database")
}

#[tokio::test]
async fn exec_insert_select_roundtrip() {
    let db = memory_db(DbOptions::new().with_default_options()).await;
    let ctx = Context::background();

    db.exec(&ctx, "CREATE TABLE t (id INT, s TEXT)", &[])
        .await
        .unwrap();
    let res = db
        .exec(
            &ctx,
            "INSERT INTO t (id, s) VALUES (?, ?)",
            &[Value::from(1i64), Value::from("a")],
        )
        .await
        .unwrap();
    assert_eq!(res.rows_affected, 1);

    let rows = db.select(&ctx, "SELECT id, s FROM t", &[]).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].try_get::<i64>("id").unwrap(), 1);
    assert_eq!(rows[0].try_get::<String>("s").unwrap(), "a");

    db.close().await.unwrap();
}

#[tokio::test]
async fn ping_and_stats() {
    let db = memory_db(DbOptions::new()).await;
    let ctx = Context::background();

    db.ping(&ctx).await.unwrap();

    let stats = db.stats();
    assert_eq!(stats.active_current, 1);
    assert_eq!(stats.nodes.len(), 1);
    assert_eq!(stats.nodes[0].active_requests, 0);

    db.close().await.unwrap();
}

#[tokio::test]
async fn get_returns_no_rows_error_on_empty_set() {
    let db = memory_db(DbOptions::new()).await;
    let ctx = Context::background();

    db.exec(&ctx, "CREATE TABLE t (id INT)", &[]).await.unwrap();

    let err = db
        .get(&ctx, "SELECT id FROM t WHERE id = ?", &[Value::from(404i64)])
        .await
        .unwrap_err();
    assert!(err.is_no_rows());

    let row = db.get(&ctx, "SELECT 'qwerty' AS v", &[]).await.unwrap();
    assert_eq!(row.try_get::<String>("v").unwrap(), "qwerty");

    db.close().await.unwrap();
}

#[tokio::test]
async fn named_parameters() {
    let db = memory_db(DbOptions::new()).await;
    let ctx = Context::background();

    db.exec(&ctx, "CREATE TABLE users (id INT, name TEXT)", &[])
        .await
        .unwrap();

    let mut args = BTreeMap::new();
    args.insert("id".to_string(), Value::from(1i64));
    args.insert("name".to_string(), Value::from("test"));

    db.named_exec(
        &ctx,
        "INSERT INTO users (id, name) VALUES (:id, :name)",
        &args,
    )
    .await
    .unwrap();

    let rows = db
        .named_query(
            &ctx,
            "SELECT id, name FROM users WHERE id = :id AND name = :name",
            &args,
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);

    let (bound, values) = db
        .bind_named(&ctx, "SELECT * FROM users WHERE id = :id", &args)
        .await
        .unwrap();
    assert_eq!(bound, "SELECT * FROM users WHERE id = ?");
    assert_eq!(values, vec![Value::from(1i64)]);

    // Missing name surfaces as an error.
    let err = db
        .bind_named(&ctx, "SELECT * FROM users WHERE status = :status", &args)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("could not find name status"));

    db.close().await.unwrap();
}

#[tokio::test]
async fn prepared_statements() {
    let db = memory_db(DbOptions::new()).await;
    let ctx = Context::background();

    db.exec(&ctx, "CREATE TABLE t (id INT)", &[]).await.unwrap();

    let insert = db
        .prepare(&ctx, "INSERT INTO t (id) VALUES (?)")
        .await
        .unwrap();
    insert.exec(&[Value::from(1i64)]).await.unwrap();
    insert.exec(&[Value::from(2i64)]).await.unwrap();

    let select = db
        .prepare_named(&ctx, "SELECT id FROM t WHERE id = :id")
        .await
        .unwrap();
    let mut args = BTreeMap::new();
    args.insert("id".to_string(), Value::from(2i64));
    let row = select.get(&args).await.unwrap();
    assert_eq!(row.try_get::<i64>("id").unwrap(), 2);

    // Preparing a broken statement fails up front.
    assert!(db.prepare(&ctx, "SELECT * FROM missing").await.is_err());

    db.close().await.unwrap();
}

#[tokio::test]
async fn run_tx_commits_and_data_is_visible() {
    let db = memory_db(DbOptions::new().with_default_options()).await;
    let ctx = Context::background();

    db.exec(&ctx, "CREATE TABLE t (id INT)", &[]).await.unwrap();

    db.run_tx(&ctx, |_ctx, tx| {
        Box::pin(async move {
            tx.exec("INSERT INTO t (id) VALUES (1)", &[]).await?;
            tx.exec("INSERT INTO t (id) VALUES (2)", &[]).await?;

            let rows = tx.select("SELECT id FROM t ORDER BY id", &[]).await?;
            assert_eq!(rows.len(), 2);

            Ok(())
        })
    })
    .await
    .unwrap();

    let rows = db
        .select(&ctx, "SELECT id FROM t ORDER BY id", &[])
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].try_get::<i64>("id").unwrap(), 1);
    assert_eq!(rows[1].try_get::<i64>("id").unwrap(), 2);

    db.close().await.unwrap();
}

#[tokio::test]
async fn run_tx_rolls_back_on_callback_error() {
    let db = memory_db(DbOptions::new()).await;
    let ctx = Context::background();

    db.exec(&ctx, "CREATE TABLE t (id INT)", &[]).await.unwrap();

    let err = db
        .run_tx(&ctx, |_ctx, tx| {
            Box::pin(async move {
                tx.exec("INSERT INTO t (id) VALUES (1)", &[]).await?;
                // A broken statement aborts the transaction.
                tx.exec("bad_query", &[]).await?;
                Ok(())
            })
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("syntax error"));

    let rows = db.select(&ctx, "SELECT id FROM t", &[]).await.unwrap();
    assert!(rows.is_empty(), "rolled-back insert must not be visible");

    db.close().await.unwrap();
}

#[tokio::test]
async fn run_read_tx_selects_but_rejects_writes() {
    let db = memory_db(DbOptions::new()).await;
    let ctx = Context::background();

    db.exec(&ctx, "CREATE TABLE t (id INT)", &[]).await.unwrap();
    db.exec(&ctx, "INSERT INTO t (id) VALUES (7)", &[])
        .await
        .unwrap();

    db.run_read_tx(&ctx, |_ctx, tx| {
        Box::pin(async move {
            let row = tx.get("SELECT id FROM t", &[]).await?;
            assert_eq!(row.try_get::<i64>("id").unwrap(), 7);
            Ok(())
        })
    })
    .await
    .unwrap();

    let err = db
        .run_read_tx(&ctx, |_ctx, tx| {
            Box::pin(async move {
                tx.exec("INSERT INTO t (id) VALUES (8)", &[]).await?;
                Ok(())
            })
        })
        .await
        .unwrap_err();
    assert!(!err.to_string().is_empty());

    // Writes work again outside the read-only transaction.
    db.exec(&ctx, "INSERT INTO t (id) VALUES (9)", &[])
        .await
        .unwrap();

    db.close().await.unwrap();
}

#[tokio::test]
async fn begin_tx_manual_commit() {
    let db = memory_db(DbOptions::new()).await;
    let ctx = Context::background();

    db.exec(&ctx, "CREATE TABLE t (id INT)", &[]).await.unwrap();

    let tx = db.begin_tx(&ctx, TxOptions::default()).await.unwrap();
    tx.exec("INSERT INTO t (id) VALUES (1)", &[]).await.unwrap();
    tx.commit().await.unwrap();

    let tx = db.begin_tx(&ctx, TxOptions::default()).await.unwrap();
    tx.exec("INSERT INTO t (id) VALUES (2)", &[]).await.unwrap();
    tx.rollback().await.unwrap();

    let rows = db.select(&ctx, "SELECT id FROM t", &[]).await.unwrap();
    assert_eq!(rows.len(), 1);

    db.close().await.unwrap();
}

#[tokio::test]
async fn file_backed_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.db");

    let db = DB::new(
        Config {
            db_type: DbType::Sqlite,
            database: path.to_string_lossy().into_owned(),
            ..Config::default()
        },
        DbOptions::new(),
    )
    .await
    .unwrap();

    let ctx = Context::background();
    db.exec(&ctx, "CREATE TABLE t (id INT)", &[]).await.unwrap();
    db.exec(&ctx, "INSERT INTO t (id) VALUES (1)", &[])
        .await
        .unwrap();
    db.close().await.unwrap();

    // The data survives a fresh handle.
    let db = DB::new(
        Config {
            db_type: DbType::Sqlite,
            database: path.to_string_lossy().into_owned(),
            ..Config::default()
        },
        DbOptions::new(),
    )
    .await
    .unwrap();

    let rows = db.select(&ctx, "SELECT id FROM t", &[]).await.unwrap();
    assert_eq!(rows.len(), 1);
    db.close().await.unwrap();
}

#[tokio::test]
async fn new_rejects_missing_driver_and_bad_config() {
    // Non-sqlite types need a caller-supplied driver.
    let err = DB::new(
        Config {
            db_type: DbType::Postgres,
            addr: "127.0.0.1:5432".to_string(),
            user: "svc".to_string(),
            database: "app".to_string(),
            ..Config::default()
        },
        DbOptions::new(),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("no driver registered"));

    // Missing database for sqlite.
    let err = DB::new(
        Config {
            db_type: DbType::Sqlite,
            ..Config::default()
        },
        DbOptions::new(),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("invalid config"));
}
