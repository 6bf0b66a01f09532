//! Reconnect hook: when a call fails with a lost-transport error, try to
//! re-establish the node's driver handle and rewrite the error to the
//! `CanRetry` sentinel so the retry engine makes a fresh attempt.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Hook, HookContext, HookInput, HooksConfig};
use crate::classify::is_reconnect_error;
use crate::error::Error;

pub struct ReconnectHook {
    config: Arc<HooksConfig>,
}

impl ReconnectHook {
    pub fn new(config: Arc<HooksConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Hook for ReconnectHook {
    async fn on_error(&self, ctx: &mut HookContext<'_>, input: &mut HookInput<'_>) {
        let reconnect_worthy = input
            .error
            .as_ref()
            .is_some_and(|e| !e.is_can_retry() && is_reconnect_error(e));
        if !reconnect_worthy {
            return;
        }

        let Some(reconnect) = self.config.reconnect_fn() else {
            return;
        };

        match reconnect(ctx.ctx.clone()).await {
            Ok(()) => {
                if let Some(original) = input.error.take() {
                    input.error = Some(Error::CanRetry(Box::new(original)));
                }
            }
            Err(err) => {
                // Keep the original error; the pool will demote the node.
                tracing::warn!(error = %err, "reconnect failed");
            }
        }
    }
}
