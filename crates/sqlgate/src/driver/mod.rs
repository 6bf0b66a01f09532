//! Driver seam: the traits a database engine implements to be managed by the
//! pool, plus the small value/row model shared across them.
//!
//! The crate ships one reference implementation, [`sqlite::SqliteDriver`].
//! Other engines (PostgreSQL, CockroachDB, ClickHouse) are supplied by the
//! application through `DbOptions::with_driver`; everything above this module
//! only talks to the trait objects.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod sqlite;

pub use sqlite::SqliteDriver;

/// A single SQL parameter or result cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

/// Conversion out of a result cell. Implemented for the handful of primitive
/// types the examples and tests need; full struct binding is the caller's
/// business.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Real(v) => Some(*v),
            Value::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(v) => Some(*v != 0),
            _ => None,
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Text(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Blob(v) => Some(v.clone()),
            Value::Text(v) => Some(v.clone().into_bytes()),
            _ => None,
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// One result row: shared column names plus the cell values.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<Vec<String>>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<Vec<String>>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Cell by column name.
    pub fn get(&self, column: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.values.get(idx)
    }

    /// Cell by position.
    pub fn get_at(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Typed cell by column name.
    pub fn try_get<T: FromValue>(&self, column: &str) -> Result<T, DriverError> {
        let value = self
            .get(column)
            .ok_or_else(|| DriverError::other(format!("no such column: {column}")))?;
        T::from_value(value)
            .ok_or_else(|| DriverError::other(format!("cannot decode column {column}: {value:?}")))
    }

    /// Typed cell by position.
    pub fn try_get_at<T: FromValue>(&self, idx: usize) -> Result<T, DriverError> {
        let value = self
            .get_at(idx)
            .ok_or_else(|| DriverError::other(format!("no such column index: {idx}")))?;
        T::from_value(value)
            .ok_or_else(|| DriverError::other(format!("cannot decode column {idx}: {value:?}")))
    }
}

/// A complete result set.
#[derive(Debug, Clone, Default)]
pub struct Rows {
    columns: Arc<Vec<String>>,
    rows: Vec<Row>,
}

impl Rows {
    pub fn new(columns: Arc<Vec<String>>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }
}

impl IntoIterator for Rows {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

/// Outcome of a statement that returns no rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

/// Transaction isolation, forwarded to drivers that support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Options for `begin`; the zero value is the driver default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub isolation: Option<IsolationLevel>,
    pub read_only: bool,
}

impl TxOptions {
    pub fn read_only() -> Self {
        Self {
            isolation: None,
            read_only: true,
        }
    }
}

/// Connection-pool limits forwarded to driver handles that pool internally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolLimits {
    /// 0 means unlimited.
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    pub conn_max_idle_time: Option<Duration>,
}

/// Named parameters for `:name` placeholders.
pub type NamedArgs = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Empty result set where one row was required.
    NoRows,
    /// Transport-level failure.
    Connection,
    Other,
}

/// An error reported by the underlying driver.
///
/// `Display` is the raw driver message: the reconnect classifier matches on
/// substrings of it, so implementations must not prefix or rewrite messages.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
    pub sqlstate: Option<String>,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            sqlstate: None,
        }
    }

    pub fn no_rows() -> Self {
        Self::new(DriverErrorKind::NoRows, "no rows in result set")
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Connection, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Other, message)
    }

    pub fn with_sqlstate(mut self, sqlstate: impl Into<String>) -> Self {
        self.sqlstate = Some(sqlstate.into());
        self
    }

    pub fn is_no_rows(&self) -> bool {
        self.kind == DriverErrorKind::NoRows
    }
}

/// Placeholder style used when rewriting named parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindVar {
    /// `$1`, `$2`, … (PostgreSQL wire protocol).
    Dollar,
    /// `?` (SQLite, ClickHouse).
    Question,
}

impl BindVar {
    fn placeholder(self, n: usize) -> String {
        match self {
            BindVar::Dollar => format!("${n}"),
            BindVar::Question => "?".to_string(),
        }
    }
}

/// Rewrites `:name` placeholders into the driver's positional style and
/// returns the placeholder names in binding order.
///
/// `::type` casts and quoted literals are left untouched.
pub fn parse_named(query: &str, bindvar: BindVar) -> (String, Vec<String>) {
    let mut bound = String::with_capacity(query.len());
    let mut names: Vec<String> = Vec::new();
    let mut chars = query.char_indices().peekable();
    let mut in_quote = false;

    while let Some((idx, ch)) = chars.next() {
        if ch == '\'' {
            in_quote = !in_quote;
            bound.push(ch);
            continue;
        }

        if in_quote || ch != ':' {
            bound.push(ch);
            continue;
        }

        // `::` is a cast, not a placeholder.
        if matches!(chars.peek(), Some((_, ':'))) {
            bound.push(ch);
            let (_, next) = chars.next().unwrap_or((idx, ':'));
            bound.push(next);
            continue;
        }

        let mut name = String::new();
        while let Some((_, c)) = chars.peek() {
            if c.is_ascii_alphanumeric() || *c == '_' {
                name.push(*c);
                chars.next();
            } else {
                break;
            }
        }

        if name.is_empty() {
            bound.push(ch);
            continue;
        }

        names.push(name);
        bound.push_str(&bindvar.placeholder(names.len()));
    }

    (bound, names)
}

/// Rewrites `:name` placeholders and collects the matching values in order.
/// A placeholder with no matching entry in `args` is an error.
pub fn bind_named(
    query: &str,
    bindvar: BindVar,
    args: &NamedArgs,
) -> Result<(String, Vec<Value>), DriverError> {
    let (bound, names) = parse_named(query, bindvar);

    let values = names
        .iter()
        .map(|name| {
            args.get(name)
                .cloned()
                .ok_or_else(|| DriverError::other(format!("could not find name {name} in bind args")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok((bound, values))
}

/// Opens driver handles from a DSN.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    async fn open(&self, dsn: &str) -> Result<Arc<dyn Connection>, DriverError>;
}

/// One open handle to a database endpoint.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn ping(&self) -> Result<(), DriverError>;

    async fn exec(&self, query: &str, args: &[Value]) -> Result<ExecResult, DriverError>;

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows, DriverError>;

    /// Validates a statement without running it.
    async fn prepare(&self, query: &str) -> Result<(), DriverError>;

    async fn begin(&self, opts: &TxOptions) -> Result<Box<dyn DriverTx>, DriverError>;

    /// Closing twice is fine.
    async fn close(&self) -> Result<(), DriverError>;

    /// Engine-specific instance identifier, e.g. CockroachDB's `SHOW node_id`.
    async fn instance_id(&self) -> Option<String> {
        None
    }

    /// Forwarded pool limits; a no-op for drivers without internal pooling.
    fn apply_limits(&self, _limits: &PoolLimits) {}
}

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Connection")
    }
}

/// An open transaction, pinned to the connection that began it.
#[async_trait]
pub trait DriverTx: Send + Sync {
    async fn exec(&self, query: &str, args: &[Value]) -> Result<ExecResult, DriverError>;

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows, DriverError>;

    async fn commit(&self) -> Result<(), DriverError>;

    async fn rollback(&self) -> Result<(), DriverError>;
}
