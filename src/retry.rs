//! Bounded exponential-backoff retry for a single outbound call.
//!
//! [`with_retry`] runs an operation up to `max_retries + 1` times. Every
//! attempt and every backoff wait is bounded by the caller's deadline; running
//! out of time is reported as [`RetryError::Timeout`], which is distinct from
//! running out of attempts.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, warn};

use crate::error::{ErrorCode, StandardError};

/// Attempt count and backoff base for one outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 100,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
        }
    }

    /// Delay before the given retry attempt.
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Terminal classification of a retried call.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("deadline exceeded after {attempts} attempt(s)")]
    Timeout { attempts: u32 },

    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Timeout { attempts } | RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RetryError::Timeout { .. })
    }
}

impl<E: Display> From<RetryError<E>> for StandardError {
    fn from(err: RetryError<E>) -> Self {
        let attempts = err.attempts();
        let code = match &err {
            RetryError::Timeout { .. } => ErrorCode::Timeout,
            RetryError::Exhausted { .. } => ErrorCode::UpstreamFailure,
        };
        StandardError::new(code, err.to_string())
            .with_details(serde_json::json!({ "attempts": attempts }))
    }
}

/// Run `op` with bounded retries and exponential backoff under `deadline`.
///
/// `op` receives the zero-based attempt index. Any `Err` consumes one
/// attempt.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    deadline: Instant,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempts = 0;
    let mut last = None;

    for attempt in 0..policy.max_attempts() {
        if attempt > 0 {
            let delay = policy.delay_for_attempt(attempt);
            if let Some(reason) = &last {
                warn!(
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "retrying outbound call"
                );
            }
            if timeout_at(deadline, sleep(delay)).await.is_err() {
                return Err(RetryError::Timeout { attempts });
            }
        }

        if Instant::now() >= deadline {
            return Err(RetryError::Timeout { attempts });
        }

        attempts += 1;
        match timeout_at(deadline, op(attempt)).await {
            Ok(Ok(value)) => {
                debug!(attempts, "outbound call succeeded");
                return Ok(value);
            }
            Ok(Err(err)) => last = Some(err),
            Err(_) => return Err(RetryError::Timeout { attempts }),
        }
    }

    match last {
        Some(last) => Err(RetryError::Exhausted { attempts, last }),
        // max_attempts() is at least 1, so the loop always records an outcome.
        None => Err(RetryError::Timeout { attempts }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[test]
    fn exponential_backoff_delays() {
        let policy = RetryPolicy::new(5, 1000);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(8000));
        assert_eq!(policy.max_attempts(), 6);
    }

    #[tokio::test]
    async fn always_failing_call_is_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, 1);

        let counter = calls.clone();
        let result: Result<(), _> = with_retry(&policy, far_deadline(), |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("connection refused")
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 4);
                assert_eq!(last, "connection refused");
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt_after_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(2, 20);
        let started = Instant::now();

        let counter = calls.clone();
        let result = with_retry(&policy, far_deadline(), |attempt| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 { Err("flaky") } else { Ok("done") }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // base + 2 * base
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn hung_call_times_out_without_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, 1);
        let deadline = Instant::now() + Duration::from_millis(50);
        let started = Instant::now();

        let counter = calls.clone();
        let result: Result<(), RetryError<&str>> = with_retry(&policy, deadline, |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<Result<(), &str>>().await
            }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Timeout { attempts: 1 })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn deadline_during_backoff_is_timeout_not_exhaustion() {
        let policy = RetryPolicy::new(5, 200);
        let deadline = Instant::now() + Duration::from_millis(50);
        let started = Instant::now();

        let result: Result<(), _> =
            with_retry(&policy, deadline, |_| async { Err::<(), _>("503") }).await;

        let err = result.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.attempts(), 1);
        // Abort as soon as the deadline passes, not after the full 200ms wait.
        assert!(started.elapsed() < Duration::from_millis(180));

        let standard: StandardError = err.into();
        assert_eq!(standard.code, ErrorCode::Timeout);
        assert!(standard.retryable);
    }

    #[tokio::test]
    async fn expired_deadline_makes_no_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = with_retry(&RetryPolicy::default(), Instant::now(), |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), &str>(())
            }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Timeout { attempts: 0 })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn exhaustion_maps_to_upstream_failure() {
        let err: RetryError<String> = RetryError::Exhausted {
            attempts: 3,
            last: "status 502".into(),
        };
        let standard: StandardError = err.into();
        assert_eq!(standard.code, ErrorCode::UpstreamFailure);
        assert!(standard.message.contains("status 502"));
        assert_eq!(standard.details["attempts"], 3);
    }
}
