//! Retry executor driven by fault classification.

use super::backoff::ExponentialBackoff;
use super::classifier::Classify;
use crate::observability::ErrorMetrics;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Result of an execution plus the number of attempts it took.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// Final result; on failure this is the last fault, unchanged.
    pub result: Result<T, E>,
    /// Attempts made, including the first.
    pub attempts: u32,
}

/// Runs an operation, retrying retryable faults with backoff.
///
/// Non-retryable faults propagate after one attempt. The final fault is
/// always returned as-is, never wrapped.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    max_attempts: u32,
    backoff: ExponentialBackoff,
    deadline: Option<Instant>,
    metrics: Option<(String, Arc<ErrorMetrics>)>,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RetryExecutor {
    /// Creates an executor with default backoff.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: ExponentialBackoff::default(),
            deadline: None,
            metrics: None,
        }
    }

    /// Sets the backoff policy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets an absolute deadline; a backoff sleep that would end past it is
    /// skipped and the last fault returned.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets the deadline to `budget` from now.
    #[must_use]
    pub fn with_time_budget(self, budget: Duration) -> Self {
        let deadline = Instant::now() + budget;
        self.with_deadline(deadline)
    }

    /// Records failures and retries against `service`.
    #[must_use]
    pub fn with_metrics(mut self, service: impl Into<String>, metrics: Arc<ErrorMetrics>) -> Self {
        self.metrics = Some((service.into(), metrics));
        self
    }

    /// Returns the attempt ceiling.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the backoff policy.
    #[must_use]
    pub fn backoff(&self) -> &ExponentialBackoff {
        &self.backoff
    }

    /// Runs `operation` under the retry policy.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        self.execute_traced(operation).await.result
    }

    /// Runs `operation` and reports how many attempts it took.
    pub async fn execute_traced<T, E, F, Fut>(&self, mut operation: F) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let mut attempt: u32 = 0;
        loop {
            let err = match operation().await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt + 1,
                    }
                }
                Err(err) => err,
            };

            let category = err.category();
            if let Some((service, metrics)) = &self.metrics {
                metrics.record_error(service, &err.error_type(), category);
            }

            let attempts = attempt + 1;
            if !category.is_retryable() {
                debug!(%category, error = %err, "Fault is not retryable");
                return RetryOutcome { result: Err(err), attempts };
            }
            if attempts >= self.max_attempts {
                warn!(attempts, %category, error = %err, "Retries exhausted");
                return RetryOutcome { result: Err(err), attempts };
            }

            let delay = self.backoff.delay_for(attempt, err.retry_after());
            if let Some(deadline) = self.deadline {
                if Instant::now() + delay > deadline {
                    warn!(
                        attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Backoff would exceed the invocation deadline, giving up"
                    );
                    return RetryOutcome { result: Err(err), attempts };
                }
            }

            warn!(
                attempt = attempts,
                max_attempts = self.max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                %category,
                error = %err,
                "Retrying after fault"
            );
            if let Some((service, metrics)) = &self.metrics {
                metrics.record_retry_attempt(service, attempts);
            }

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ComplyflowError, Fault};
    use crate::resilience::ErrorCategory;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryExecutor {
        RetryExecutor::new(3).with_backoff(
            ExponentialBackoff::new()
                .with_base_delay_ms(1)
                .with_max_delay_ms(5)
                .with_jitter(false),
        )
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let outcome = fast()
            .execute_traced(|| async { Ok::<_, ComplyflowError>(42) })
            .await;
        assert_eq!(outcome.result.unwrap(), 42);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_non_retryable_makes_one_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ComplyflowError> = fast()
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Fault::validation("bad schema").into())
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let err = result.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Validation);
    }

    #[tokio::test]
    async fn test_retryable_exhausts_attempts_and_keeps_cause() {
        let calls = AtomicU32::new(0);
        let outcome = fast()
            .execute_traced(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ComplyflowError::from(Fault::transient(format!("flaky {n}"))))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.attempts, 3);
        match outcome.result {
            Err(ComplyflowError::Fault(fault)) => assert_eq!(fault.message, "flaky 2"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recovers_after_transient() {
        let calls = AtomicU32::new(0);
        let result = fast()
            .execute(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ComplyflowError::from(Fault::throttled("slow down", None)))
                } else {
                    Ok("done")
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_max_attempts_floor_is_one() {
        let executor = RetryExecutor::new(0);
        assert_eq!(executor.max_attempts(), 1);
    }

    #[tokio::test]
    async fn test_deadline_skips_oversized_sleep() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(5)
            .with_backoff(ExponentialBackoff::new().with_base_delay_ms(10_000).with_jitter(false))
            .with_time_budget(Duration::from_millis(50));

        let started = Instant::now();
        let outcome = executor
            .execute_traced(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ComplyflowError::from(Fault::transient("down")))
            })
            .await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_records_metrics() {
        let metrics = Arc::new(ErrorMetrics::new());
        let executor = fast().with_metrics("text-generation", Arc::clone(&metrics));
        let _ = executor
            .execute(|| async { Err::<(), _>(ComplyflowError::from(Fault::transient("x"))) })
            .await;

        assert_eq!(metrics.error_count("text-generation", ErrorCategory::Transient), 3);
        assert_eq!(metrics.retry_count("text-generation"), 2);
    }
}
