//! Retry engine: exponential backoff with uniform jitter, honoring
//! cancellation.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::context::Context;
use crate::error::{Error, Result};

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_INITIAL_BACKOFF: Duration = Duration::from_millis(50);
pub const DEFAULT_RETRY_MAX_BACKOFF: Duration = Duration::from_secs(2);
pub const DEFAULT_RETRY_BACKOFF_MULTIPLIER: f64 = 2.0;

/// When and how often a failed call is retried.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub is_retryable: Arc<dyn Fn(&Error) -> bool + Send + Sync>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_backoff", &self.initial_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
        is_retryable: impl Fn(&Error) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
            is_retryable: Arc::new(is_retryable),
        }
    }

    /// Policy retrying serialization failures (SQLSTATE 40001) and calls the
    /// reconnect hook already salvaged.
    pub fn serialization_failures(max_attempts: u32) -> Self {
        Self::new(
            max_attempts,
            DEFAULT_RETRY_INITIAL_BACKOFF,
            DEFAULT_RETRY_MAX_BACKOFF,
            DEFAULT_RETRY_BACKOFF_MULTIPLIER,
            |err| err.is_serialization_failure() || err.is_can_retry(),
        )
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_attempts < 2 {
            return Err(Error::InvalidConfig(
                "retry policy: max_attempts must be at least 2".to_string(),
            ));
        }

        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "retry policy: invalid backoff multiplier {}",
                self.backoff_multiplier,
            )));
        }

        Ok(())
    }

    /// Upper bound of the sleep before attempt `attempt + 1`.
    fn backoff_cap(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let nanos = (self.initial_backoff.as_nanos() as f64 * factor)
            .min(self.max_backoff.as_nanos() as f64);

        Duration::from_nanos(nanos.max(0.0) as u64)
    }
}

/// Runs `f` under the retry policy. Without a policy this is a single call.
///
/// The sleep between attempts is uniform in `[0, cap)` where
/// `cap = min(initial * multiplier^attempt, max_backoff)`; cancellation wins
/// the race against the timer and surfaces as `Error::Canceled`.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: Option<&RetryPolicy>,
    ctx: &Context,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let Some(policy) = policy else {
        return f().await;
    };

    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let err = match f().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !(policy.is_retryable)(&err) {
            return Err(err);
        }

        if attempt >= policy.max_attempts {
            return Err(Error::MaxRetryAttempts);
        }

        let cap = policy.backoff_cap(attempt);
        let delay = if cap.is_zero() {
            Duration::ZERO
        } else {
            Duration::from_nanos(rand::thread_rng().gen_range(0..cap.as_nanos().max(1) as u64))
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = ctx.cancelled() => return Err(Error::Canceled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    fn always_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_nanos(1),
            Duration::from_nanos(1),
            1.0,
            |_| true,
        )
    }

    #[tokio::test]
    async fn no_policy_is_a_single_call() {
        let ctx = Context::background();
        let calls = AtomicU32::new(0);

        let err = with_retry(None, &ctx, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::from(DriverError::other("boom")))
        })
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "boom");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn returns_max_retry_attempts_after_budget() {
        let policy = always_retry(5);
        let ctx = Context::background();
        let calls = AtomicU32::new(0);

        let err = with_retry(Some(&policy), &ctx, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::from(DriverError::other("no such table: missing")))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::MaxRetryAttempts));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let policy = RetryPolicy::new(
            5,
            Duration::from_nanos(1),
            Duration::from_nanos(1),
            1.0,
            |_| false,
        );
        let ctx = Context::background();
        let calls = AtomicU32::new(0);

        let err = with_retry(Some(&policy), &ctx, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::from(DriverError::other("boom")))
        })
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "boom");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_stops_retrying() {
        let policy = always_retry(5);
        let ctx = Context::background();
        let calls = AtomicU32::new(0);

        let out = with_retry(Some(&policy), &ctx, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::from(DriverError::other("transient")))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(out, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_short_circuits_the_backoff() {
        let token = CancellationToken::new();
        let ctx = Context::with_cancellation(token.clone());
        let calls = AtomicU32::new(0);

        // Long enough that the sleep would dominate the test if cancellation
        // did not win.
        let policy = RetryPolicy::new(
            5,
            Duration::from_secs(30),
            Duration::from_secs(30),
            1.0,
            |_| true,
        );

        let err = with_retry(Some(&policy), &ctx, || {
            token.cancel();
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Error::from(DriverError::other("boom"))) }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Canceled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backoff_cap_grows_and_clamps() {
        let policy = RetryPolicy::new(
            5,
            Duration::from_millis(100),
            Duration::from_millis(300),
            2.0,
            |_| true,
        );

        assert_eq!(policy.backoff_cap(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_cap(2), Duration::from_millis(300));
        assert_eq!(policy.backoff_cap(10), Duration::from_millis(300));
    }

    #[test]
    fn validation() {
        assert!(always_retry(2).validate().is_ok());
        assert!(always_retry(1).validate().is_err());
        assert!(always_retry(0).validate().is_err());

        let mut policy = always_retry(5);
        policy.backoff_multiplier = -1.0;
        assert!(policy.validate().is_err());

        policy.backoff_multiplier = f64::NAN;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn serialization_policy_predicate() {
        let policy = RetryPolicy::serialization_failures(5);

        let serialization =
            Error::from(DriverError::other("restart transaction").with_sqlstate("40001"));
        assert!((policy.is_retryable)(&serialization));

        let can_retry = Error::CanRetry(Box::new(Error::from(DriverError::connection(
            "broken pipe",
        ))));
        assert!((policy.is_retryable)(&can_retry));

        let other = Error::from(DriverError::other("no such table: foo"));
        assert!(!(policy.is_retryable)(&other));
    }
}
