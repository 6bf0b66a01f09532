//! Error-codes hook: attaches domain codes so services can map database
//! failures onto transport status codes without string matching.

use async_trait::async_trait;

use super::{Hook, HookContext, HookInput};
use crate::error::{Code, Error};

pub struct ErrorCodesHook;

impl ErrorCodesHook {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ErrorCodesHook {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hook for ErrorCodesHook {
    async fn on_error(&self, _ctx: &mut HookContext<'_>, input: &mut HookInput<'_>) {
        let Some(err) = input.error.take() else {
            return;
        };

        // Already coded errors pass through untouched.
        if err.code().is_some() {
            input.error = Some(err);
            return;
        }

        let coded = if err.is_can_retry() {
            Error::Coded {
                code: Code::Reconnected,
                message: "reconnected, try again",
                source: Box::new(err),
            }
        } else {
            let msg = err.to_string();

            if msg.ends_with("connection refused")
                || msg.ends_with("server is not accepting clients")
            {
                Error::Coded {
                    code: Code::BadConnection,
                    message: "connection refused, try later",
                    source: Box::new(err),
                }
            } else {
                Error::Coded {
                    code: Code::DatabaseError,
                    message: "database error",
                    source: Box::new(err),
                }
            }
        };

        input.error = Some(coded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::driver::DriverError;
    use crate::hooks::{Caller, HookChain};
    use std::sync::Arc;

    async fn run_with_error(err: Error) -> Error {
        let chain = HookChain::new(vec![Arc::new(ErrorCodesHook::new())]);
        let ctx = Context::background();

        chain
            .run(&ctx, Caller::Query, "SELECT 1", || async { Err::<(), _>(err) })
            .await
            .unwrap_err()
    }

    #[tokio::test]
    async fn can_retry_becomes_reconnected() {
        let err = run_with_error(Error::CanRetry(Box::new(Error::from(
            DriverError::connection("broken pipe"),
        ))))
        .await;

        assert_eq!(err.code(), Some(Code::Reconnected));
        assert!(err.to_string().contains("reconnected, try again"));
        assert!(err.to_string().contains("broken pipe"));
    }

    #[tokio::test]
    async fn connection_refused_becomes_bad_connection() {
        let err = run_with_error(Error::from(DriverError::connection(
            "dial tcp 127.0.0.1:5432: connection refused",
        )))
        .await;
        assert_eq!(err.code(), Some(Code::BadConnection));

        let err = run_with_error(Error::from(DriverError::connection(
            "pq: the database system is shutting down; server is not accepting clients",
        )))
        .await;
        assert_eq!(err.code(), Some(Code::BadConnection));
    }

    #[tokio::test]
    async fn everything_else_becomes_database_error() {
        let err = run_with_error(Error::from(DriverError::other("no such table: foo"))).await;
        assert_eq!(err.code(), Some(Code::DatabaseError));
        assert!(err.to_string().contains("no such table: foo"));
    }

    #[tokio::test]
    async fn already_coded_errors_pass_through() {
        let original = Error::Coded {
            code: Code::BadConnection,
            message: "connection refused, try later",
            source: Box::new(Error::from(DriverError::connection("connection refused"))),
        };

        let err = run_with_error(original).await;
        assert_eq!(err.code(), Some(Code::BadConnection));
        // Not double wrapped.
        assert_eq!(err.to_string().matches("connection refused, try later").count(), 1);
    }
}
