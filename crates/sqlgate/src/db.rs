//! The facade: query methods composing the pool, the retry engine and the
//! hook chain.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, DbType};
use crate::context::Context;
use crate::driver::{
    self, BindVar, Driver, DriverError, ExecResult, NamedArgs, Row, Rows, SqliteDriver, Value,
};
use crate::error::{Error, Result};
use crate::hooks::{Caller, HookChain, HooksConfig};
use crate::options::DbOptions;
use crate::pool::{ClusterPool, Node, NodeHold, PoolStats};
use crate::retry::{self, RetryPolicy};

pub(crate) struct DbInner {
    pool: ClusterPool,
    chain: HookChain,
    retry_policy: Option<RetryPolicy>,
    db_type: DbType,
}

/// A cluster-aware database handle.
///
/// Cheap to clone; all clones share the same pool and background workers.
#[derive(Clone)]
pub struct DB {
    inner: Arc<DbInner>,
}

impl std::fmt::Debug for DB {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DB").finish_non_exhaustive()
    }
}

impl DB {
    /// Validates the configuration and options, eagerly connects the pool up
    /// to its live target, and starts the background workers.
    ///
    /// SQLite uses the bundled driver; every other engine needs a driver
    /// supplied through [`DbOptions::with_driver`].
    pub async fn new(cfg: Config, opts: DbOptions) -> Result<DB> {
        let node_configs = cfg.build_node_configs()?;
        let hooks_cfg = Arc::new(HooksConfig::from_config(&cfg));
        let built = opts.build(&hooks_cfg)?;

        let driver = match built.driver {
            Some(driver) => driver,
            None => match cfg.db_type {
                DbType::Sqlite => Arc::new(SqliteDriver::new()) as Arc<dyn Driver>,
                other => {
                    return Err(Error::InvalidConfig(format!(
                        "no driver registered for {other}; supply one with DbOptions::with_driver",
                    )))
                }
            },
        };

        let pool = ClusterPool::new(
            driver,
            node_configs,
            cfg.active_count,
            cfg.use_lower_priority,
        )
        .await?;

        let inner = Arc::new(DbInner {
            pool,
            chain: built.chain,
            retry_policy: built.retry_policy,
            db_type: cfg.db_type,
        });

        // Late binding breaks the hook ↔ pool cycle: the reconnect hook only
        // sees the config, and the config learns the reconnect function here.
        let weak = Arc::downgrade(&inner);
        hooks_cfg.set_reconnect_fn(Arc::new(move |ctx: Context| {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(inner) => inner.pool.reconnect_node(&ctx).await,
                    None => Err(Error::from(DriverError::connection("database is closed"))),
                }
            })
        }));

        Ok(DB { inner })
    }

    pub(crate) fn pool(&self) -> &ClusterPool {
        &self.inner.pool
    }

    pub(crate) fn chain(&self) -> &HookChain {
        &self.inner.chain
    }

    pub(crate) fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.inner.retry_policy.as_ref()
    }

    /// Verifies a pooled node is reachable.
    pub async fn ping(&self, ctx: &Context) -> Result<()> {
        self.inner
            .pool
            .do_query(ctx, |_node_ctx, node| async move { node.ping().await })
            .await
    }

    /// Executes a statement that returns no rows.
    pub async fn exec(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<ExecResult> {
        retry::with_retry(self.retry_policy(), ctx, || {
            self.inner.pool.do_query(ctx, |node_ctx, node| {
                let chain = self.inner.chain.clone();
                async move {
                    chain
                        .run(&node_ctx, Caller::Exec, query, || async {
                            node.exec(query, args).await
                        })
                        .await
                }
            })
        })
        .await
    }

    /// Runs a query and returns the full result set.
    pub async fn query(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<Rows> {
        retry::with_retry(self.retry_policy(), ctx, || {
            self.inner.pool.do_query(ctx, |node_ctx, node| {
                let chain = self.inner.chain.clone();
                async move {
                    chain
                        .run(&node_ctx, Caller::Query, query, || async {
                            node.query(query, args).await
                        })
                        .await
                }
            })
        })
        .await
    }

    /// Runs a query and returns all rows.
    pub async fn select(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<Vec<Row>> {
        Ok(self.query(ctx, query, args).await?.into_rows())
    }

    /// Runs a query expected to return one row; an empty result set is a
    /// no-rows error.
    pub async fn get(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<Row> {
        retry::with_retry(self.retry_policy(), ctx, || {
            self.inner.pool.do_query(ctx, |node_ctx, node| {
                let chain = self.inner.chain.clone();
                async move {
                    chain
                        .run(&node_ctx, Caller::Query, query, || async {
                            let rows = node.query(query, args).await?;
                            rows.rows()
                                .first()
                                .cloned()
                                .ok_or_else(|| Error::from(DriverError::no_rows()))
                        })
                        .await
                }
            })
        })
        .await
    }

    /// Executes a statement with `:name` parameters.
    pub async fn named_exec(
        &self,
        ctx: &Context,
        query: &str,
        args: &NamedArgs,
    ) -> Result<ExecResult> {
        let (bound, values) = driver::bind_named(query, self.bind_var(), args)?;
        self.exec(ctx, &bound, &values).await
    }

    /// Runs a query with `:name` parameters.
    pub async fn named_query(&self, ctx: &Context, query: &str, args: &NamedArgs) -> Result<Rows> {
        let (bound, values) = driver::bind_named(query, self.bind_var(), args)?;
        self.query(ctx, &bound, &values).await
    }

    /// Rewrites `:name` placeholders into the driver's positional style and
    /// returns the bound query with its argument list.
    pub async fn bind_named(
        &self,
        ctx: &Context,
        query: &str,
        args: &NamedArgs,
    ) -> Result<(String, Vec<Value>)> {
        let bindvar = self.bind_var();

        self.inner
            .chain
            .run(ctx, Caller::BindNamed, query, || async move {
                Ok(driver::bind_named(query, bindvar, args)?)
            })
            .await
    }

    /// Validates a statement on a pooled node and returns a handle bound to
    /// that node.
    pub async fn prepare(&self, ctx: &Context, query: &str) -> Result<Statement> {
        retry::with_retry(self.retry_policy(), ctx, || {
            self.inner.pool.do_query(ctx, |node_ctx, node| {
                let chain = self.inner.chain.clone();
                async move {
                    chain
                        .run(&node_ctx, Caller::Prepare, query, || async {
                            node.prepare(query).await
                        })
                        .await?;

                    let hold = NodeHold::new(node.clone());
                    Ok(Statement {
                        node,
                        _hold: hold,
                        chain,
                        ctx: node_ctx,
                        query: query.to_string(),
                    })
                }
            })
        })
        .await
    }

    /// Prepares a statement with `:name` parameters; values are supplied per
    /// call.
    pub async fn prepare_named(&self, ctx: &Context, query: &str) -> Result<NamedStatement> {
        let (bound, names) = driver::parse_named(query, self.bind_var());

        let stmt = retry::with_retry(self.retry_policy(), ctx, || {
            self.inner.pool.do_query(ctx, |node_ctx, node| {
                let chain = self.inner.chain.clone();
                let bound = bound.clone();
                async move {
                    chain
                        .run(&node_ctx, Caller::PrepareNamed, &bound, || async {
                            node.prepare(&bound).await
                        })
                        .await?;

                    let hold = NodeHold::new(node.clone());
                    Ok(Statement {
                        node,
                        _hold: hold,
                        chain,
                        ctx: node_ctx,
                        query: bound,
                    })
                }
            })
        })
        .await?;

        Ok(NamedStatement { stmt, names })
    }

    /// Forwarded to every pooled driver handle, now and on future connects.
    pub fn set_max_open_conns(&self, n: u32) {
        self.inner.pool.set_limits(|l| l.max_open_conns = n);
    }

    /// Forwarded to every pooled driver handle, now and on future connects.
    pub fn set_max_idle_conns(&self, n: u32) {
        self.inner.pool.set_limits(|l| l.max_idle_conns = n);
    }

    /// Forwarded to every pooled driver handle, now and on future connects.
    pub fn set_conn_max_idle_time(&self, d: Duration) {
        self.inner.pool.set_limits(|l| l.conn_max_idle_time = Some(d));
    }

    /// Point-in-time view of the pool.
    pub fn stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Stops the background workers and closes every node.
    pub async fn close(&self) -> Result<()> {
        self.inner.pool.close().await
    }

    fn bind_var(&self) -> BindVar {
        self.inner.db_type.bind_var()
    }
}

/// A prepared statement bound to one pooled node.
pub struct Statement {
    node: Arc<Node>,
    _hold: NodeHold,
    chain: HookChain,
    ctx: Context,
    query: String,
}

impl Statement {
    pub fn query_string(&self) -> &str {
        &self.query
    }

    pub async fn exec(&self, args: &[Value]) -> Result<ExecResult> {
        self.chain
            .run(&self.ctx, Caller::Exec, &self.query, || async {
                self.node.exec(&self.query, args).await
            })
            .await
    }

    pub async fn query(&self, args: &[Value]) -> Result<Rows> {
        self.chain
            .run(&self.ctx, Caller::Query, &self.query, || async {
                self.node.query(&self.query, args).await
            })
            .await
    }

    pub async fn get(&self, args: &[Value]) -> Result<Row> {
        self.chain
            .run(&self.ctx, Caller::Query, &self.query, || async {
                let rows = self.node.query(&self.query, args).await?;
                rows.rows()
                    .first()
                    .cloned()
                    .ok_or_else(|| Error::from(DriverError::no_rows()))
            })
            .await
    }
}

/// A prepared statement taking `:name` parameters per call.
pub struct NamedStatement {
    stmt: Statement,
    names: Vec<String>,
}

impl NamedStatement {
    pub fn query_string(&self) -> &str {
        self.stmt.query_string()
    }

    fn bind(&self, args: &NamedArgs) -> Result<Vec<Value>> {
        self.names
            .iter()
            .map(|name| {
                args.get(name).cloned().ok_or_else(|| {
                    Error::from(DriverError::other(format!(
                        "could not find name {name} in bind args",
                    )))
                })
            })
            .collect()
    }

    pub async fn exec(&self, args: &NamedArgs) -> Result<ExecResult> {
        let values = self.bind(args)?;
        self.stmt.exec(&values).await
    }

    pub async fn query(&self, args: &NamedArgs) -> Result<Rows> {
        let values = self.bind(args)?;
        self.stmt.query(&values).await
    }

    pub async fn get(&self, args: &NamedArgs) -> Result<Row> {
        let values = self.bind(args)?;
        self.stmt.get(&values).await
    }
}
