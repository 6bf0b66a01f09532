//! Transaction runner: BEGIN/COMMIT/ROLLBACK with retry semantics.
//!
//! A transaction is pinned to one pooled node for its whole lifetime. The
//! retry engine re-enters the callback from its first statement when an
//! attempt fails with a retryable error (serialization conflicts under the
//! default policy).

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::Instrument;

use crate::context::Context;
use crate::db::DB;
use crate::driver::{DriverError, DriverTx, ExecResult, Row, Rows, TxOptions, Value};
use crate::error::{Error, Result};
use crate::hooks::{Caller, HookChain};
use crate::pool::{Node, NodeHold};
use crate::retry;

/// An open transaction. Statements run on the node that began it, through
/// the same hook chain as top-level queries.
pub struct Tx {
    node: Arc<Node>,
    inner: Box<dyn DriverTx>,
    chain: HookChain,
    ctx: Context,
    _hold: Option<NodeHold>,
}

impl Tx {
    pub(crate) fn new(
        node: Arc<Node>,
        inner: Box<dyn DriverTx>,
        chain: HookChain,
        ctx: Context,
        hold: Option<NodeHold>,
    ) -> Self {
        Self {
            node,
            inner,
            chain,
            ctx,
            _hold: hold,
        }
    }

    pub async fn exec(&self, query: &str, args: &[Value]) -> Result<ExecResult> {
        let _hold = NodeHold::new(self.node.clone());

        self.chain
            .run(&self.ctx, Caller::Exec, query, || async {
                Ok(self.inner.exec(query, args).await?)
            })
            .await
    }

    pub async fn query(&self, query: &str, args: &[Value]) -> Result<Rows> {
        let _hold = NodeHold::new(self.node.clone());

        self.chain
            .run(&self.ctx, Caller::Query, query, || async {
                Ok(self.inner.query(query, args).await?)
            })
            .await
    }

    /// One row; an empty result set is a no-rows error.
    pub async fn get(&self, query: &str, args: &[Value]) -> Result<Row> {
        let _hold = NodeHold::new(self.node.clone());

        self.chain
            .run(&self.ctx, Caller::Query, query, || async {
                let rows = self.inner.query(query, args).await?;
                rows.rows()
                    .first()
                    .cloned()
                    .ok_or_else(|| Error::from(DriverError::no_rows()))
            })
            .await
    }

    pub async fn select(&self, query: &str, args: &[Value]) -> Result<Vec<Row>> {
        Ok(self.query(query, args).await?.into_rows())
    }

    pub async fn commit(self) -> Result<()> {
        self.chain
            .run(&self.ctx, Caller::Commit, "COMMIT", || async {
                Ok(self.inner.commit().await?)
            })
            .await
    }

    pub async fn rollback(self) -> Result<()> {
        self.chain
            .run(&self.ctx, Caller::Rollback, "ROLLBACK", || async {
                Ok(self.inner.rollback().await?)
            })
            .await
    }

    /// Rolls back because of `cause` and reports the cause through the hook
    /// chain's rollback phase, so the metrics hook sees the failed attempt.
    /// Returns the (possibly hook-enriched) cause; a rollback failure itself
    /// is only logged, since the caller's error is the interesting one.
    pub(crate) async fn rollback_with_cause(self, cause: Error) -> Error {
        let result: Result<()> = self
            .chain
            .run(&self.ctx, Caller::Rollback, "ROLLBACK", || async {
                if let Err(err) = self.inner.rollback().await {
                    tracing::error!(error = %err, "rollback failed");
                }
                Err(cause)
            })
            .await;

        match result {
            Err(err) => err,
            Ok(()) => Error::from(DriverError::other("rollback hook cleared the error")),
        }
    }
}

/// The transaction callback: gets the node-bound context and the open
/// transaction.
pub type TransactionFn =
    dyn for<'a> Fn(Context, &'a Tx) -> BoxFuture<'a, Result<()>> + Send + Sync;

impl DB {
    /// Runs `f` in a transaction with default options, retrying the whole
    /// transaction under the configured retry policy.
    pub async fn run_tx<F>(&self, ctx: &Context, f: F) -> Result<()>
    where
        F: for<'a> Fn(Context, &'a Tx) -> BoxFuture<'a, Result<()>> + Send + Sync,
    {
        self.run_tx_with_options(ctx, TxOptions::default(), f).await
    }

    /// Runs `f` in a read-only transaction.
    pub async fn run_read_tx<F>(&self, ctx: &Context, f: F) -> Result<()>
    where
        F: for<'a> Fn(Context, &'a Tx) -> BoxFuture<'a, Result<()>> + Send + Sync,
    {
        self.run_tx_with_options(ctx, TxOptions::read_only(), f).await
    }

    /// Runs `f` in a transaction with the given options.
    ///
    /// Each attempt begins on a pooled node, runs the callback, then commits;
    /// a callback or commit error rolls the attempt back and is handed to the
    /// retry engine, which decides whether to start over from the callback's
    /// first statement. The begin itself is node acquisition, not a hooked
    /// call; commit and rollback go through the hook chain carrying the
    /// attempt's outcome.
    pub async fn run_tx_with_options<F>(&self, ctx: &Context, opts: TxOptions, f: F) -> Result<()>
    where
        F: for<'a> Fn(Context, &'a Tx) -> BoxFuture<'a, Result<()>> + Send + Sync,
    {
        let span = if tracing::Span::current().is_none() {
            None
        } else {
            Some(tracing::info_span!("SQL Tx"))
        };

        let run = async {
            retry::with_retry(self.retry_policy(), ctx, || {
                self.pool().do_query(ctx, |node_ctx, node| {
                    let f = &f;
                    let opts = &opts;
                    let chain = self.chain().clone();

                    async move {
                        let driver_tx = node.begin(opts).await?;
                        let tx = Tx::new(node, driver_tx, chain, node_ctx.clone(), None);

                        match f(node_ctx.clone(), &tx).await {
                            Ok(()) => tx.commit().await,
                            Err(err) => Err(tx.rollback_with_cause(err).await),
                        }
                    }
                })
            })
            .await
        };

        match span {
            Some(span) => run.instrument(span).await,
            None => run.await,
        }
    }

    /// Begins a transaction the caller drives manually. The returned [`Tx`]
    /// pins its node (and keeps it counted as in use) until committed,
    /// rolled back, or dropped.
    pub async fn begin_tx(&self, ctx: &Context, opts: TxOptions) -> Result<Tx> {
        retry::with_retry(self.retry_policy(), ctx, || {
            self.pool().do_query(ctx, |node_ctx, node| {
                let chain = self.chain().clone();
                let opts = opts;

                async move {
                    let driver_tx = chain
                        .run(&node_ctx, Caller::Begin, "BEGIN", || async {
                            node.begin(&opts).await
                        })
                        .await?;

                    let hold = NodeHold::new(node.clone());
                    Ok(Tx::new(node, driver_tx, chain, node_ctx.clone(), Some(hold)))
                }
            })
        })
        .await
    }
}
