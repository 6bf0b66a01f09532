//! Metrics hook: observes per-call duration and counts serialization
//! failures.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{Hook, HookContext, HookInput, HooksConfig};
use crate::parser::Parser;

/// Sink for query metrics. Implemented by `sqlgate_metrics::SqlMetrics` and
/// by test doubles.
pub trait MetricCollector: Send + Sync {
    fn serialization_failure_inc(&self, db_type: &str, db_addr: &str, db_name: &str);

    fn query_duration_observe(&self, labels: &QueryLabels<'_>, elapsed: Duration);
}

/// Labels of one duration observation.
#[derive(Debug, Clone, Copy)]
pub struct QueryLabels<'a> {
    pub db_type: &'a str,
    pub db_addr: &'a str,
    pub db_name: &'a str,
    pub operation: &'a str,
    pub table: &'a str,
    pub is_error: bool,
}

pub struct MetricsHook {
    config: Arc<HooksConfig>,
    collector: Arc<dyn MetricCollector>,
    parser: Arc<Parser>,
}

struct StartedAt(Instant);

impl MetricsHook {
    pub fn new(
        config: Arc<HooksConfig>,
        collector: Arc<dyn MetricCollector>,
        parser: Arc<Parser>,
    ) -> Self {
        Self {
            config,
            collector,
            parser,
        }
    }

    fn finish(&self, ctx: &mut HookContext<'_>, input: &HookInput<'_>) {
        let Some(StartedAt(started_at)) = ctx.ext.remove::<StartedAt>() else {
            return;
        };

        let labels = self.config.call_labels(ctx.ctx);

        // Transaction control statements are labeled by caller, everything
        // else by the parsed statement.
        let (operation, table) = if input.caller.is_tx_control() {
            (format!("tx.{}", input.caller), String::new())
        } else {
            let op = self.parser.parse(input.query);
            (op.kind.as_str().to_string(), op.table)
        };

        let is_error = input
            .error
            .as_ref()
            .is_some_and(|e| !e.is_no_rows() && !e.is_serialization_failure());

        self.collector.query_duration_observe(
            &QueryLabels {
                db_type: labels.db_type,
                db_addr: labels.addr,
                db_name: labels.database,
                operation: &operation,
                table: &table,
                is_error,
            },
            started_at.elapsed(),
        );
    }
}

#[async_trait]
impl Hook for MetricsHook {
    async fn before(
        &self,
        ctx: &mut HookContext<'_>,
        _input: &mut HookInput<'_>,
    ) -> crate::error::Result<()> {
        ctx.ext.insert(StartedAt(Instant::now()));
        Ok(())
    }

    async fn after(&self, ctx: &mut HookContext<'_>, input: &mut HookInput<'_>) {
        self.finish(ctx, input);
    }

    async fn on_error(&self, ctx: &mut HookContext<'_>, input: &mut HookInput<'_>) {
        if input
            .error
            .as_ref()
            .is_some_and(|e| e.is_serialization_failure())
        {
            let labels = self.config.call_labels(ctx.ctx);
            self.collector
                .serialization_failure_inc(labels.db_type, labels.addr, labels.database);
        }

        self.finish(ctx, input);
    }
}

impl MetricCollector for sqlgate_metrics::SqlMetrics {
    fn serialization_failure_inc(&self, db_type: &str, db_addr: &str, db_name: &str) {
        self.inc_serialization_failure(db_type, db_addr, db_name);
    }

    fn query_duration_observe(&self, labels: &QueryLabels<'_>, elapsed: Duration) {
        self.observe_query_duration(
            &sqlgate_metrics::QueryDurationLabels {
                db_type: labels.db_type,
                db_addr: labels.db_addr,
                db_name: labels.db_name,
                is_error: labels.is_error,
                operation: labels.operation,
                table: labels.table,
            },
            elapsed.as_secs_f64() * 1000.0,
        );
    }
}
