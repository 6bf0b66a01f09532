//! sqlgate: client-side cluster connection manager for SQL databases.
//!
//! Sits between application code and one or more SQL nodes (PostgreSQL,
//! CockroachDB, ClickHouse, SQLite) and provides:
//!
//! - a weighted, priority-ordered node pool with a live / pending / dead
//!   lifecycle maintained by background workers;
//! - automatic reconnection on transient transport failures;
//! - retry with exponential backoff and jitter for classified errors;
//! - transparent transaction retry for serialization conflicts
//!   (SQLSTATE 40001);
//! - a hook chain around every driver call carrying tracing spans, metrics,
//!   reconnect handling and error-code enrichment.
//!
//! The underlying driver is a trait seam ([`driver::Driver`]); SQLite ships
//! in-tree, other engines are supplied by the application.
//!
//! # Example
//!
//! ```no_run
//! use sqlgate::{Config, Context, DbOptions, DbType, Value, DB};
//!
//! # async fn demo() -> sqlgate::Result<()> {
//! let db = DB::new(
//!     Config {
//!         db_type: DbType::Sqlite,
//!         database: ":memory:".to_string(),
//!         ..Config::default()
//!     },
//!     DbOptions::new().with_default_options(),
//! )
//! .await?;
//!
//! let ctx = Context::background();
//! db.exec(&ctx, "CREATE TABLE users (id INTEGER, name TEXT)", &[]).await?;
//! db.exec(
//!     &ctx,
//!     "INSERT INTO users (id, name) VALUES (?, ?)",
//!     &[Value::from(1i64), Value::from("ada")],
//! )
//! .await?;
//!
//! let rows = db.select(&ctx, "SELECT id, name FROM users", &[]).await?;
//! assert_eq!(rows.len(), 1);
//!
//! db.run_tx(&ctx, |_ctx, tx| {
//!     Box::pin(async move {
//!         tx.exec("INSERT INTO users (id, name) VALUES (?, ?)", &[2i64.into(), "lin".into()])
//!             .await?;
//!         Ok(())
//!     })
//! })
//! .await?;
//!
//! db.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod driver;
pub mod hooks;

mod classify;
mod context;
mod db;
mod error;
mod options;
mod parser;
mod pool;
mod retry;
mod signal;
mod tx;

pub use classify::{is_reconnect_error, is_serialization_failure};
pub use config::{decode_params, encode_params, Config, DbType, NodeConfig};
pub use context::{Context, NodeMeta};
pub use db::{NamedStatement, Statement, DB};
pub use driver::{
    ExecResult, FromValue, IsolationLevel, NamedArgs, PoolLimits, Row, Rows, SqliteDriver,
    TxOptions, Value,
};
pub use error::{Code, Error, Result};
pub use options::DbOptions;
pub use parser::{Operation, OperationKind, Parser};
pub use pool::{NodeStats, NodeStatus, PoolStats};
pub use retry::{
    RetryPolicy, DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_BACKOFF_MULTIPLIER,
    DEFAULT_RETRY_INITIAL_BACKOFF, DEFAULT_RETRY_MAX_BACKOFF,
};
pub use tx::{TransactionFn, Tx};
