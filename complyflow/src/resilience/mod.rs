//! Fault classification, backoff, circuit breaking, and retries.
//!
//! The pieces compose explicitly at the call site through
//! [`ResilientCaller`]: the breaker wraps the retry loop, so the breaker sees
//! the outcome after retries rather than every individual attempt.

mod backoff;
mod circuit_breaker;
mod classifier;
mod retry;

pub use backoff::ExponentialBackoff;
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerSnapshot,
    CircuitState,
};
pub use classifier::{Classify, ErrorCategory, ErrorClassifier};
pub use retry::{RetryExecutor, RetryOutcome};

use crate::errors::CircuitOpenError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// `breaker.call(retry.execute(operation))` as one object.
#[derive(Debug, Clone)]
pub struct ResilientCaller {
    breaker: Arc<CircuitBreaker>,
    retry: RetryExecutor,
}

impl ResilientCaller {
    /// Composes a breaker and a retry executor.
    #[must_use]
    pub fn new(breaker: Arc<CircuitBreaker>, retry: RetryExecutor) -> Self {
        Self { breaker, retry }
    }

    /// Looks up (or creates) the breaker for `dependency` in `registry`.
    #[must_use]
    pub fn from_registry(
        registry: &CircuitBreakerRegistry,
        dependency: &str,
        retry: RetryExecutor,
    ) -> Self {
        Self::new(registry.get_or_create(dependency), retry)
    }

    /// Returns the breaker.
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Returns the retry executor.
    #[must_use]
    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    /// Runs `operation` with retries inside the breaker.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display + From<CircuitOpenError>,
    {
        self.breaker.call(|| self.retry.execute(operation)).await
    }
}
