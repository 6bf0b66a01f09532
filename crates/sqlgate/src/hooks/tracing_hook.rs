//! Tracing hook: a span per driver call, child of whatever span the caller
//! is already in. Without a current span the hook stays out of the way.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::field::Empty;
use tracing::Span;

use super::{Hook, HookContext, HookInput, HooksConfig};

pub struct TracingHook {
    config: Arc<HooksConfig>,
}

struct CallSpan(Span);

impl TracingHook {
    pub fn new(config: Arc<HooksConfig>) -> Self {
        Self { config }
    }

    fn finish(&self, ctx: &mut HookContext<'_>, input: &HookInput<'_>) {
        let Some(CallSpan(span)) = ctx.ext.remove::<CallSpan>() else {
            return;
        };

        // A canceled context is the caller's doing, not a database failure.
        if ctx.ctx.is_canceled() {
            return;
        }

        match &input.error {
            None => {}
            Some(err) if err.is_no_rows() => {}
            Some(err) => {
                span.record("error", true);
                span.record("error.message", tracing::field::display(err));
                span.record("otel.status_code", "ERROR");
            }
        }
    }
}

#[async_trait]
impl Hook for TracingHook {
    async fn before(
        &self,
        ctx: &mut HookContext<'_>,
        input: &mut HookInput<'_>,
    ) -> crate::error::Result<()> {
        if Span::current().is_none() {
            return Ok(());
        }

        let labels = self.config.call_labels(ctx.ctx);

        let span = tracing::info_span!(
            "sql.call",
            otel.name = %format_args!("SQL {}", input.caller),
            otel.kind = "internal",
            db.user = labels.user,
            db.system = labels.db_type,
            db.name = labels.database,
            db.statement = input.query,
            host.id = labels.instance.unwrap_or(""),
            host.name = labels.addr,
            otel.status_code = Empty,
            error = Empty,
            error.message = Empty,
        );

        ctx.ext.insert(CallSpan(span));
        Ok(())
    }

    async fn after(&self, ctx: &mut HookContext<'_>, input: &mut HookInput<'_>) {
        self.finish(ctx, input);
    }

    async fn on_error(&self, ctx: &mut HookContext<'_>, input: &mut HookInput<'_>) {
        self.finish(ctx, input);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::Context;
    use crate::driver::DriverError;
    use crate::error::Error;
    use crate::hooks::{Caller, HookChain};

    fn test_chain() -> HookChain {
        let cfg = Arc::new(HooksConfig::from_config(&Config {
            addr: "127.0.0.1:5432".to_string(),
            user: "test".to_string(),
            database: "postgresdb".to_string(),
            ..Config::default()
        }));

        HookChain::new(vec![Arc::new(TracingHook::new(cfg))])
    }

    #[tokio::test]
    async fn no_current_span_is_a_noop() {
        let chain = test_chain();
        let ctx = Context::background();

        chain
            .run(&ctx, Caller::Query, "SELECT 1", || async { Ok(()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn errors_pass_through_unchanged() {
        let chain = test_chain();
        let ctx = Context::background();

        let err = chain
            .run(&ctx, Caller::Query, "SELECT 1", || async {
                Err::<(), _>(Error::from(DriverError::other("boom")))
            })
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "boom");
    }
}
