//! Bundled SQLite driver backed by rusqlite.
//!
//! rusqlite is synchronous, so every call runs on the blocking thread pool.
//! One handle owns one `rusqlite::Connection`; SQLite is always serializable,
//! so `TxOptions::isolation` is ignored and `read_only` maps onto
//! `PRAGMA query_only`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{
    Connection, Driver, DriverError, DriverTx, ExecResult, Row, Rows, TxOptions, Value,
};

pub struct SqliteDriver;

impl SqliteDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    async fn open(&self, dsn: &str) -> Result<Arc<dyn Connection>, DriverError> {
        // The DSN is the database path, optionally suffixed with `?key=value`
        // params that SQLite itself has no use for.
        let path = dsn.split('?').next().unwrap_or(dsn).to_string();

        let conn = tokio::task::spawn_blocking(move || {
            rusqlite::Connection::open(path).map_err(map_err)
        })
        .await
        .map_err(join_err)??;

        Ok(Arc::new(SqliteConnection {
            conn: Arc::new(Mutex::new(Some(conn))),
        }))
    }
}

type SharedConn = Arc<Mutex<Option<rusqlite::Connection>>>;

struct SqliteConnection {
    conn: SharedConn,
}

impl SqliteConnection {
    async fn with_conn<T, F>(&self, f: F) -> Result<T, DriverError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T, DriverError> + Send + 'static,
    {
        with_shared(&self.conn, f).await
    }
}

async fn with_shared<T, F>(conn: &SharedConn, f: F) -> Result<T, DriverError>
where
    T: Send + 'static,
    F: FnOnce(&rusqlite::Connection) -> Result<T, DriverError> + Send + 'static,
{
    let conn = conn.clone();

    tokio::task::spawn_blocking(move || {
        let guard = conn.lock().unwrap_or_else(|e| e.into_inner());
        let c = guard
            .as_ref()
            .ok_or_else(|| DriverError::connection("database handle is closed"))?;
        f(c)
    })
    .await
    .map_err(join_err)?
}

#[async_trait]
impl Connection for SqliteConnection {
    async fn ping(&self) -> Result<(), DriverError> {
        self.with_conn(|c| c.query_row("SELECT 1", [], |_| Ok(())).map_err(map_err))
            .await
    }

    async fn exec(&self, query: &str, args: &[Value]) -> Result<ExecResult, DriverError> {
        let query = query.to_string();
        let args: Vec<rusqlite::types::Value> = args.iter().map(to_sqlite).collect();

        self.with_conn(move |c| {
            let changed = {
                let mut stmt = c.prepare(&query).map_err(map_err)?;
                stmt.execute(rusqlite::params_from_iter(args)).map_err(map_err)?
            };

            Ok(ExecResult {
                rows_affected: changed as u64,
                last_insert_id: Some(c.last_insert_rowid()),
            })
        })
        .await
    }

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows, DriverError> {
        let query = query.to_string();
        let args: Vec<rusqlite::types::Value> = args.iter().map(to_sqlite).collect();

        self.with_conn(move |c| run_query(c, &query, args)).await
    }

    async fn prepare(&self, query: &str) -> Result<(), DriverError> {
        let query = query.to_string();
        self.with_conn(move |c| c.prepare(&query).map(|_| ()).map_err(map_err))
            .await
    }

    async fn begin(&self, opts: &TxOptions) -> Result<Box<dyn DriverTx>, DriverError> {
        let read_only = opts.read_only;
        let conn = self.conn.clone();

        with_shared(&self.conn, move |c| {
            c.execute_batch("BEGIN DEFERRED").map_err(map_err)?;
            if read_only {
                c.execute_batch("PRAGMA query_only = ON").map_err(map_err)?;
            }
            Ok(())
        })
        .await?;

        Ok(Box::new(SqliteTx {
            conn,
            read_only,
            finished: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), DriverError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            guard.take();
            Ok(())
        })
        .await
        .map_err(join_err)?
    }
}

struct SqliteTx {
    conn: SharedConn,
    read_only: bool,
    finished: AtomicBool,
}

impl SqliteTx {
    async fn finish(&self, statement: &'static str) -> Result<(), DriverError> {
        self.finished.store(true, Ordering::Relaxed);
        let read_only = self.read_only;

        with_shared(&self.conn, move |c| {
            let res = c.execute_batch(statement).map_err(map_err);
            if read_only {
                let _ = c.execute_batch("PRAGMA query_only = OFF");
            }
            res
        })
        .await
    }
}

#[async_trait]
impl DriverTx for SqliteTx {
    async fn exec(&self, query: &str, args: &[Value]) -> Result<ExecResult, DriverError> {
        let query = query.to_string();
        let args: Vec<rusqlite::types::Value> = args.iter().map(to_sqlite).collect();

        with_shared(&self.conn, move |c| {
            let changed = {
                let mut stmt = c.prepare(&query).map_err(map_err)?;
                stmt.execute(rusqlite::params_from_iter(args)).map_err(map_err)?
            };

            Ok(ExecResult {
                rows_affected: changed as u64,
                last_insert_id: Some(c.last_insert_rowid()),
            })
        })
        .await
    }

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows, DriverError> {
        let query = query.to_string();
        let args: Vec<rusqlite::types::Value> = args.iter().map(to_sqlite).collect();

        with_shared(&self.conn, move |c| run_query(c, &query, args)).await
    }

    async fn commit(&self) -> Result<(), DriverError> {
        self.finish("COMMIT").await
    }

    async fn rollback(&self) -> Result<(), DriverError> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for SqliteTx {
    fn drop(&mut self) {
        // Leaving a transaction open would wedge the connection for every
        // later caller, so roll back synchronously if nobody finished it.
        if self.finished.load(Ordering::Relaxed) {
            return;
        }

        if let Ok(guard) = self.conn.lock() {
            if let Some(c) = guard.as_ref() {
                let _ = c.execute_batch("ROLLBACK");
                if self.read_only {
                    let _ = c.execute_batch("PRAGMA query_only = OFF");
                }
            }
        }
    }
}

fn run_query(
    c: &rusqlite::Connection,
    query: &str,
    args: Vec<rusqlite::types::Value>,
) -> Result<Rows, DriverError> {
    let mut stmt = c.prepare(query).map_err(map_err)?;
    let columns: Arc<Vec<String>> =
        Arc::new(stmt.column_names().iter().map(|s| s.to_string()).collect());
    let count = columns.len();

    let mut rows = stmt.query(rusqlite::params_from_iter(args)).map_err(map_err)?;
    let mut out = Vec::new();

    while let Some(row) = rows.next().map_err(map_err)? {
        let mut values = Vec::with_capacity(count);
        for i in 0..count {
            let v: rusqlite::types::Value = row.get(i).map_err(map_err)?;
            values.push(from_sqlite(v));
        }
        out.push(Row::new(columns.clone(), values));
    }

    Ok(Rows::new(columns, out))
}

fn to_sqlite(v: &Value) -> rusqlite::types::Value {
    match v {
        Value::Null => rusqlite::types::Value::Null,
        Value::Integer(i) => rusqlite::types::Value::Integer(*i),
        Value::Real(f) => rusqlite::types::Value::Real(*f),
        Value::Text(s) => rusqlite::types::Value::Text(s.clone()),
        Value::Blob(b) => rusqlite::types::Value::Blob(b.clone()),
    }
}

fn from_sqlite(v: rusqlite::types::Value) -> Value {
    match v {
        rusqlite::types::Value::Null => Value::Null,
        rusqlite::types::Value::Integer(i) => Value::Integer(i),
        rusqlite::types::Value::Real(f) => Value::Real(f),
        rusqlite::types::Value::Text(s) => Value::Text(s),
        rusqlite::types::Value::Blob(b) => Value::Blob(b),
    }
}

fn map_err(err: rusqlite::Error) -> DriverError {
    match err {
        rusqlite::Error::QueryReturnedNoRows => DriverError::no_rows(),
        other => DriverError::other(other.to_string()),
    }
}

fn join_err(err: tokio::task::JoinError) -> DriverError {
    DriverError::other(format!("blocking task failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exec_and_query_roundtrip() {
        let driver = SqliteDriver::new();
        let conn = driver.open(":memory:").await.unwrap();

        conn.exec("CREATE TABLE t (id INTEGER, s TEXT)", &[])
            .await
            .unwrap();

        let res = conn
            .exec(
                "INSERT INTO t (id, s) VALUES (?, ?)",
                &[Value::Integer(1), Value::from("a")],
            )
            .await
            .unwrap();
        assert_eq!(res.rows_affected, 1);
        assert_eq!(res.last_insert_id, Some(1));

        let rows = conn.query("SELECT id, s FROM t", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.rows()[0].try_get::<i64>("id").unwrap(), 1);
        assert_eq!(rows.rows()[0].try_get::<String>("s").unwrap(), "a");
    }

    #[tokio::test]
    async fn missing_table_message() {
        let driver = SqliteDriver::new();
        let conn = driver.open(":memory:").await.unwrap();

        let err = conn.query("SELECT * FROM missing", &[]).await.unwrap_err();
        assert!(err.to_string().contains("no such table: missing"));
    }

    #[tokio::test]
    async fn transaction_commit_and_rollback() {
        let driver = SqliteDriver::new();
        let conn = driver.open(":memory:").await.unwrap();
        conn.exec("CREATE TABLE t (id INTEGER)", &[]).await.unwrap();

        let tx = conn.begin(&TxOptions::default()).await.unwrap();
        tx.exec("INSERT INTO t (id) VALUES (1)", &[]).await.unwrap();
        tx.commit().await.unwrap();

        let tx = conn.begin(&TxOptions::default()).await.unwrap();
        tx.exec("INSERT INTO t (id) VALUES (2)", &[]).await.unwrap();
        tx.rollback().await.unwrap();

        let rows = conn.query("SELECT id FROM t", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.rows()[0].try_get::<i64>("id").unwrap(), 1);
    }

    #[tokio::test]
    async fn read_only_transaction_rejects_writes() {
        let driver = SqliteDriver::new();
        let conn = driver.open(":memory:").await.unwrap();
        conn.exec("CREATE TABLE t (id INTEGER)", &[]).await.unwrap();

        let tx = conn.begin(&TxOptions::read_only()).await.unwrap();
        let err = tx.exec("INSERT INTO t (id) VALUES (1)", &[]).await;
        assert!(err.is_err());
        tx.rollback().await.unwrap();

        // Writes work again once the read-only transaction is done.
        conn.exec("INSERT INTO t (id) VALUES (1)", &[]).await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let driver = SqliteDriver::new();
        let conn = driver.open(":memory:").await.unwrap();
        conn.close().await.unwrap();
        conn.close().await.unwrap();

        let err = conn.ping().await.unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let driver = SqliteDriver::new();
        let conn = driver.open(":memory:").await.unwrap();
        conn.exec("CREATE TABLE t (id INTEGER)", &[]).await.unwrap();

        {
            let tx = conn.begin(&TxOptions::default()).await.unwrap();
            tx.exec("INSERT INTO t (id) VALUES (1)", &[]).await.unwrap();
            drop(tx);
        }

        // A new transaction can begin, and the insert is gone.
        let tx = conn.begin(&TxOptions::default()).await.unwrap();
        let rows = tx.query("SELECT id FROM t", &[]).await.unwrap();
        assert!(rows.is_empty());
        tx.rollback().await.unwrap();
    }
}
