//! Bounded retry and backoff logic for Keepsafe destinations
//!
//! Transfers to remote storage fail for two very different reasons: the network
//! blipped (retry it) or the request can never succeed (bad credentials, missing
//! bucket). Errors classify themselves through [`RetryableError`]; permanent
//! failures surface on the first attempt, transient ones are retried with
//! exponential backoff up to [`RetryPolicy::max_attempts`].

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures::Future;
use std::fmt::Display;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Default number of attempts for a single transfer operation
pub const DEFAULT_MAX_ATTEMPTS: usize = 5;

/// Outcome of an operation that could not be completed
#[derive(Error, Debug)]
pub enum RetryError<E: Display> {
    #[error("Operation '{operation}' exceeded {attempts} attempts: {last_error}")]
    MaxRetriesExceeded {
        operation: String,
        attempts: usize,
        last_error: E,
    },
    #[error("Permanent error in '{operation}' on attempt {attempt}: {last_error}")]
    Permanent {
        operation: String,
        attempt: usize,
        last_error: E,
    },
}

impl<E: Display> RetryError<E> {
    /// Number of attempts made before giving up
    pub fn attempts(&self) -> usize {
        match self {
            RetryError::MaxRetriesExceeded { attempts, .. } => *attempts,
            RetryError::Permanent { attempt, .. } => *attempt,
        }
    }

    /// Recover the error returned by the final attempt
    pub fn into_inner(self) -> E {
        match self {
            RetryError::MaxRetriesExceeded { last_error, .. } => last_error,
            RetryError::Permanent { last_error, .. } => last_error,
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T, E> = std::result::Result<T, RetryError<E>>;

/// Trait for categorizing errors as transient or permanent
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// How many times to try and how long to wait in between
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub backoff: ExponentialBackoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, backoff: ExponentialBackoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Policy for remote object storage and network filesystems
    pub fn remote() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, cloud_storage_backoff_policy())
    }

    /// Policy for local disk destinations
    pub fn local() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, local_storage_backoff_policy())
    }

    /// Policy with no delay between attempts, used by tests
    pub fn immediate(max_attempts: usize) -> Self {
        Self::new(
            max_attempts,
            ExponentialBackoffBuilder::new()
                .with_initial_interval(Duration::ZERO)
                .with_randomization_factor(0.0)
                .with_max_interval(Duration::ZERO)
                .with_max_elapsed_time(None)
                .build(),
        )
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, default_backoff_policy())
    }
}

/// Execute an operation with exponential backoff retry logic
pub async fn with_backoff<F, Fut, T, E>(
    op_name: &str,
    policy: &RetryPolicy,
    f: F,
) -> RetryResult<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + Display,
{
    with_backoff_notify(op_name, policy, f, |_, _, _| {}).await
}

/// Like [`with_backoff`], calling `notify(err, attempt, delay)` before each retry sleep
pub async fn with_backoff_notify<F, Fut, T, E, N>(
    op_name: &str,
    policy: &RetryPolicy,
    mut f: F,
    mut notify: N,
) -> RetryResult<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + Display,
    N: FnMut(&E, usize, Duration),
{
    let mut backoff = policy.backoff.clone();
    backoff.reset();
    let mut attempt = 1;

    loop {
        debug!(operation = op_name, attempt, "Attempting operation");

        match f(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        operation = op_name,
                        attempt, "Operation succeeded after retrying"
                    );
                }
                return Ok(result);
            }
            Err(err) if err.is_permanent() => {
                warn!(operation = op_name, attempt, error = %err, "Operation failed permanently");
                return Err(RetryError::Permanent {
                    operation: op_name.to_string(),
                    attempt,
                    last_error: err,
                });
            }
            Err(err) => {
                if attempt >= policy.max_attempts {
                    warn!(operation = op_name, attempt, error = %err, "Giving up after transient failures");
                    return Err(RetryError::MaxRetriesExceeded {
                        operation: op_name.to_string(),
                        attempts: attempt,
                        last_error: err,
                    });
                }

                // An exhausted elapsed-time budget still honours max_attempts, at the ceiling delay
                let delay = backoff
                    .next_backoff()
                    .unwrap_or(backoff.max_interval);
                warn!(
                    operation = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient failure, retrying"
                );
                notify(&err, attempt, delay);

                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

/// Default backoff policy for general operations
pub fn default_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(100))
        .with_max_interval(Duration::from_secs(5))
        .with_max_elapsed_time(Some(Duration::from_secs(30)))
        .with_multiplier(2.0)
        .build()
}

/// Backoff policy optimized for cloud storage operations
pub fn cloud_storage_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(500))
        .with_max_interval(Duration::from_secs(10))
        .with_max_elapsed_time(Some(Duration::from_secs(60)))
        .with_multiplier(1.5)
        .build()
}

/// Backoff policy for local storage operations (shorter timeouts)
pub fn local_storage_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(50))
        .with_max_interval(Duration::from_secs(1))
        .with_max_elapsed_time(Some(Duration::from_secs(10)))
        .with_multiplier(2.0)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    enum TestError {
        Network,
        Auth,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                TestError::Network => write!(f, "connection refused"),
                TestError::Auth => write!(f, "permission denied"),
            }
        }
    }

    impl RetryableError for TestError {
        fn is_transient(&self) -> bool {
            matches!(self, TestError::Network)
        }
    }

    #[tokio::test]
    async fn test_successful_operation() {
        let result: RetryResult<&str, TestError> =
            with_backoff("test_op", &RetryPolicy::immediate(5), |_attempt| async {
                Ok("success")
            })
            .await;

        assert_eq!(result.unwrap(), "success");
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let attempt_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempt_count);

        let result = with_backoff("test_op", &RetryPolicy::immediate(5), move |_attempt| {
            let count = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if count < 2 {
                    Err(TestError::Network)
                } else {
                    Ok("success")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let attempt_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempt_count);

        let result: RetryResult<(), TestError> =
            with_backoff("test_op", &RetryPolicy::immediate(5), move |_attempt| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Auth) }
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Permanent { attempt: 1, .. }));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
        assert!(matches!(err.into_inner(), TestError::Auth));
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let attempt_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempt_count);

        let result: RetryResult<(), TestError> =
            with_backoff("test_op", &RetryPolicy::immediate(5), move |_attempt| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Network) }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts(), 5);
        assert!(matches!(err, RetryError::MaxRetriesExceeded { .. }));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delays_grow_between_attempts() {
        let policy = RetryPolicy::new(
            4,
            ExponentialBackoffBuilder::new()
                .with_initial_interval(Duration::from_millis(100))
                .with_randomization_factor(0.0)
                .with_multiplier(2.0)
                .with_max_interval(Duration::from_secs(10))
                .with_max_elapsed_time(None)
                .build(),
        );
        let mut delays = Vec::new();

        let result: RetryResult<(), TestError> = with_backoff_notify(
            "test_op",
            &policy,
            |_attempt| async { Err(TestError::Network) },
            |_err, _attempt, delay| delays.push(delay),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
    }
}
