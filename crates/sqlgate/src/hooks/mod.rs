//! Hook chain around every driver call.
//!
//! A hook implements any subset of `before` / `after` / `on_error`. For one
//! driver call the chain runs: all `before` hooks in registration order, the
//! call itself, then either all `after` hooks (success) or all `on_error`
//! hooks (failure). Hooks share a [`HookContext`] and may transform the error
//! slot; that is how the reconnect hook turns a broken pipe into
//! [`Error::CanRetry`] after re-establishing the handle.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::config::Config;
use crate::context::Context;
use crate::driver::DriverError;
use crate::error::{Error, Result};

mod codes;
mod metrics;
mod reconnect;
mod tracing_hook;

pub use codes::ErrorCodesHook;
pub use metrics::{MetricCollector, MetricsHook, QueryLabels};
pub use reconnect::ReconnectHook;
pub use tracing_hook::TracingHook;

/// Which facade operation drove the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Caller {
    Query,
    Exec,
    Begin,
    Commit,
    Rollback,
    Prepare,
    PrepareNamed,
    BindNamed,
}

impl Caller {
    pub fn as_str(&self) -> &'static str {
        match self {
            Caller::Query => "query",
            Caller::Exec => "exec",
            Caller::Begin => "begin",
            Caller::Commit => "commit",
            Caller::Rollback => "rollback",
            Caller::Prepare => "prepare",
            Caller::PrepareNamed => "prepare_named",
            Caller::BindNamed => "bind_named",
        }
    }

    pub fn is_tx_control(&self) -> bool {
        matches!(self, Caller::Begin | Caller::Commit | Caller::Rollback)
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared input of one chain invocation. Hooks may rewrite `error`.
#[derive(Debug)]
pub struct HookInput<'a> {
    pub caller: Caller,
    pub query: &'a str,
    pub error: Option<Error>,
}

/// Typed, heterogeneous storage letting independent hooks stash per-call
/// state (start instants, spans) without knowing about each other.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) {
        self.map.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref())
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast().ok())
            .map(|v| *v)
    }
}

/// Ambient state of one chain invocation.
pub struct HookContext<'a> {
    pub ctx: &'a Context,
    pub ext: Extensions,
}

#[async_trait]
pub trait Hook: Send + Sync {
    async fn before(
        &self,
        _ctx: &mut HookContext<'_>,
        _input: &mut HookInput<'_>,
    ) -> Result<()> {
        Ok(())
    }

    async fn after(&self, _ctx: &mut HookContext<'_>, _input: &mut HookInput<'_>) {}

    async fn on_error(&self, _ctx: &mut HookContext<'_>, _input: &mut HookInput<'_>) {}
}

/// The assembled chain; built once at construction time.
#[derive(Clone, Default)]
pub struct HookChain {
    hooks: Arc<Vec<Arc<dyn Hook>>>,
}

impl HookChain {
    pub fn new(hooks: Vec<Arc<dyn Hook>>) -> Self {
        Self {
            hooks: Arc::new(hooks),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Runs `call` inside the chain and returns its result, with the error
    /// slot possibly rewritten by `on_error` hooks.
    pub(crate) async fn run<T, F, Fut>(
        &self,
        ctx: &Context,
        caller: Caller,
        query: &str,
        call: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.hooks.is_empty() {
            return call().await;
        }

        let mut hook_ctx = HookContext {
            ctx,
            ext: Extensions::default(),
        };
        let mut input = HookInput {
            caller,
            query,
            error: None,
        };

        for hook in self.hooks.iter() {
            if let Err(err) = hook.before(&mut hook_ctx, &mut input).await {
                input.error = Some(err);
                return self.finish_error(&mut hook_ctx, &mut input).await;
            }
        }

        match call().await {
            Ok(value) => {
                for hook in self.hooks.iter() {
                    hook.after(&mut hook_ctx, &mut input).await;
                }

                match input.error.take() {
                    None => Ok(value),
                    Some(err) => Err(err),
                }
            }
            Err(err) => {
                input.error = Some(err);
                self.finish_error(&mut hook_ctx, &mut input).await
            }
        }
    }

    async fn finish_error<T>(
        &self,
        hook_ctx: &mut HookContext<'_>,
        input: &mut HookInput<'_>,
    ) -> Result<T> {
        for hook in self.hooks.iter() {
            hook.on_error(hook_ctx, input).await;
        }

        Err(input
            .error
            .take()
            .unwrap_or_else(|| Error::from(DriverError::other("error consumed by hook"))))
    }
}

/// Re-establishes a node's driver handle; installed late, after the pool
/// exists.
pub type ReconnectFn = Arc<dyn Fn(Context) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Connection identity shared by the bundled hooks, plus the late-bound
/// reconnect function.
///
/// The reconnect hook needs the pool and the pool's facade installs the hook:
/// the cycle is broken by populating `reconnect` on this config once the
/// facade is constructed, not by wiring the two together directly.
pub struct HooksConfig {
    pub db_type: String,
    pub addr: String,
    pub database: String,
    pub user: String,
    reconnect: OnceLock<ReconnectFn>,
}

impl HooksConfig {
    pub(crate) fn from_config(cfg: &Config) -> Self {
        let addr = cfg
            .addr
            .split(',')
            .next()
            .unwrap_or("")
            .split('?')
            .next()
            .unwrap_or("")
            .trim()
            .to_string();

        Self {
            db_type: cfg.db_type.to_string(),
            addr: if addr.is_empty() {
                cfg.database.clone()
            } else {
                addr
            },
            database: cfg.database.clone(),
            user: cfg.user.clone(),
            reconnect: OnceLock::new(),
        }
    }

    /// First setter wins; later calls are ignored.
    pub fn set_reconnect_fn(&self, f: ReconnectFn) {
        let _ = self.reconnect.set(f);
    }

    pub(crate) fn reconnect_fn(&self) -> Option<ReconnectFn> {
        self.reconnect.get().cloned()
    }

    /// Label values for the current call, preferring the per-node metadata
    /// the pool attached to the context.
    pub(crate) fn call_labels<'a>(&'a self, ctx: &'a Context) -> CallLabels<'a> {
        match ctx.node_meta() {
            Some(meta) => CallLabels {
                db_type: &meta.db_type,
                addr: &meta.addr,
                database: &meta.database,
                user: &meta.user,
                instance: meta.instance.as_deref(),
            },
            None => CallLabels {
                db_type: &self.db_type,
                addr: &self.addr,
                database: &self.database,
                user: &self.user,
                instance: None,
            },
        }
    }
}

pub(crate) struct CallLabels<'a> {
    pub db_type: &'a str,
    pub addr: &'a str,
    pub database: &'a str,
    pub user: &'a str,
    pub instance: Option<&'a str>,
}
