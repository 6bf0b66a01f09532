//! Construction options: hooks, retry policy, custom driver.

use std::sync::Arc;

use crate::driver::Driver;
use crate::error::Result;
use crate::hooks::{
    ErrorCodesHook, Hook, HookChain, HooksConfig, MetricCollector, MetricsHook, ReconnectHook,
    TracingHook,
};
use crate::parser::Parser;
use crate::retry::{RetryPolicy, DEFAULT_RETRY_ATTEMPTS};

/// Options for [`DB::new`](crate::DB::new), applied in a builder style.
///
/// Bundled hooks always run in a fixed order (tracing, metrics, custom
/// hooks, reconnect, error codes), so metrics observe the raw error before
/// the reconnect hook rewrites it and the codes hook wraps it.
#[derive(Default)]
pub struct DbOptions {
    custom_hooks: Vec<Arc<dyn Hook>>,
    tracing: bool,
    reconnect: bool,
    error_codes: bool,
    collector: Option<Arc<dyn MetricCollector>>,
    retry_policy: Option<RetryPolicy>,
    driver: Option<Arc<dyn Driver>>,
}

pub(crate) struct BuiltOptions {
    pub(crate) chain: HookChain,
    pub(crate) retry_policy: Option<RetryPolicy>,
    pub(crate) driver: Option<Arc<dyn Driver>>,
}

impl std::fmt::Debug for BuiltOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltOptions").finish_non_exhaustive()
    }
}

impl DbOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an arbitrary hook, run between the bundled metrics and
    /// reconnect hooks.
    pub fn with_custom_hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.custom_hooks.push(hook);
        self
    }

    /// A span per driver call, child of the caller's current span.
    pub fn with_tracing_hook(mut self) -> Self {
        self.tracing = true;
        self
    }

    /// Rewrite lost-transport errors to the retry sentinel after
    /// re-establishing the node's handle.
    pub fn with_reconnect_hook(mut self) -> Self {
        self.reconnect = true;
        self
    }

    /// Attach domain codes to errors leaving the chain.
    pub fn with_error_codes_hook(mut self) -> Self {
        self.error_codes = true;
        self
    }

    /// Observe per-call durations and serialization failures through the
    /// given collector.
    pub fn with_metrics_hook(mut self, collector: Arc<dyn MetricCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    /// Observe metrics through the process-wide registry
    /// ([`sqlgate_metrics::SqlMetrics::global`]); idempotent across handles.
    pub fn with_prometheus_metrics(mut self) -> Self {
        self.collector = Some(sqlgate_metrics::SqlMetrics::global());
        self
    }

    /// Retry failed calls under `policy` (validated in [`DB::new`](crate::DB::new)).
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Convenience policy retrying serialization failures (SQLSTATE 40001)
    /// and reconnect-salvaged calls.
    pub fn with_serialization_retry(self, max_attempts: u32) -> Self {
        self.with_retry_policy(RetryPolicy::serialization_failures(max_attempts))
    }

    /// Tracing + reconnect + error codes + serialization retry + the
    /// process-wide metrics registry.
    pub fn with_default_options(self) -> Self {
        self.with_tracing_hook()
            .with_reconnect_hook()
            .with_error_codes_hook()
            .with_serialization_retry(DEFAULT_RETRY_ATTEMPTS)
            .with_prometheus_metrics()
    }

    /// Use a custom driver instead of the bundled per-type default.
    pub fn with_driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub(crate) fn build(self, hooks_cfg: &Arc<HooksConfig>) -> Result<BuiltOptions> {
        if let Some(policy) = &self.retry_policy {
            policy.validate()?;
        }

        let mut hooks: Vec<Arc<dyn Hook>> = Vec::new();

        if self.tracing {
            hooks.push(Arc::new(TracingHook::new(hooks_cfg.clone())));
        }

        if let Some(collector) = &self.collector {
            hooks.push(Arc::new(MetricsHook::new(
                hooks_cfg.clone(),
                collector.clone(),
                Arc::new(Parser::new()),
            )));
        }

        hooks.extend(self.custom_hooks);

        if self.reconnect {
            hooks.push(Arc::new(ReconnectHook::new(hooks_cfg.clone())));
        }

        if self.error_codes {
            hooks.push(Arc::new(ErrorCodesHook::new()));
        }

        Ok(BuiltOptions {
            chain: HookChain::new(hooks),
            retry_policy: self.retry_policy,
            driver: self.driver,
        })
    }
}
