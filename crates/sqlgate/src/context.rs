use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Identity of the node serving the current call; attached to the context by
/// the pool so hooks can label spans and metrics per endpoint.
#[derive(Debug, Clone)]
pub struct NodeMeta {
    pub addr: String,
    pub db_type: String,
    pub database: String,
    pub user: String,
    /// Engine-reported instance id (e.g. a CockroachDB node id).
    pub instance: Option<String>,
}

/// Call context: an optional cancellation token plus per-node metadata.
///
/// Cloning is cheap. `Context::background()` never cancels.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: Option<CancellationToken>,
    node: Option<Arc<NodeMeta>>,
}

impl Context {
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancel: Some(token),
            node: None,
        }
    }

    pub(crate) fn with_node(&self, node: Arc<NodeMeta>) -> Self {
        Self {
            cancel: self.cancel.clone(),
            node: Some(node),
        }
    }

    pub fn node_meta(&self) -> Option<&Arc<NodeMeta>> {
        self.node.as_ref()
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }

    /// Resolves when the context is canceled; pends forever for
    /// `Context::background()`.
    pub async fn cancelled(&self) {
        match &self.cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    }

    /// `Err(Error::Canceled)` once the context has been canceled.
    pub fn err(&self) -> Result<()> {
        if self.is_canceled() {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }
}
