//! Error types for the complyflow pipeline.
//!
//! Every error a resilient call can surface implements [`Classify`], so the
//! retry executor, the circuit breaker, and the dead-letter builder all derive
//! the same [`ErrorCategory`] without inspecting concrete error types.

use crate::resilience::{Classify, ErrorCategory, ErrorClassifier};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// The main error type for complyflow operations.
#[derive(Debug, Error)]
pub enum ComplyflowError {
    /// A classified failure from a downstream dependency or domain logic.
    #[error("{0}")]
    Fault(#[from] Fault),

    /// The circuit breaker rejected the call without invoking it.
    #[error("{0}")]
    CircuitOpen(#[from] CircuitOpenError),

    /// Task generation failed.
    #[error("{0}")]
    Planning(#[from] PlanningError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persistence collaborator failed.
    #[error("Store error: {0}")]
    Store(String),

    /// A conditional write found a conflicting record.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ComplyflowError {
    /// Creates a store error.
    #[must_use]
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Creates a config error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.error_type()));
        map.insert("category".to_string(), serde_json::json!(self.category()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map
    }
}

impl Classify for ComplyflowError {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::Fault(fault) => fault.category,
            Self::CircuitOpen(_) => ErrorCategory::ServiceUnavailable,
            Self::Serialization(_) => ErrorCategory::Validation,
            Self::Store(_) => ErrorCategory::Transient,
            Self::Planning(_) | Self::Conflict(_) | Self::Config(_) => ErrorCategory::Permanent,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Fault(fault) => fault.retry_after,
            _ => None,
        }
    }

    fn error_type(&self) -> String {
        match self {
            Self::Fault(fault) => fault.error_type(),
            Self::CircuitOpen(_) => "CircuitBreakerOpenError".to_string(),
            Self::Planning(_) => "TaskPlanningError".to_string(),
            Self::Serialization(_) => "SerializationError".to_string(),
            Self::Store(_) => "StoreError".to_string(),
            Self::Conflict(_) => "ConflictError".to_string(),
            Self::Config(_) => "ConfigError".to_string(),
        }
    }
}

/// A classified failure.
///
/// Carries the taxonomy value, the provider code it was classified from (if
/// any), and an optional provider-suggested minimum delay.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct Fault {
    /// Taxonomy value.
    pub category: ErrorCategory,
    /// Human-readable message.
    pub message: String,
    /// Provider error code, e.g. `ThrottlingException`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Minimum delay suggested by the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
}

impl Fault {
    /// Creates a fault with an explicit category.
    #[must_use]
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            code: None,
            retry_after: None,
        }
    }

    /// Creates a fault from a generic provider error code.
    #[must_use]
    pub fn from_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            category: ErrorClassifier::classify_code(&code),
            message: message.into(),
            code: Some(code),
            retry_after: None,
        }
    }

    /// Creates a fault from a text-generation provider error code.
    #[must_use]
    pub fn from_model_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            category: ErrorClassifier::classify_model_code(&code),
            message: message.into(),
            code: Some(code),
            retry_after: None,
        }
    }

    /// Creates a throttling fault with an optional suggested delay.
    #[must_use]
    pub fn throttled(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            category: ErrorCategory::Throttling,
            message: message.into(),
            code: None,
            retry_after,
        }
    }

    /// Creates a transient fault.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transient, message)
    }

    /// Creates a validation fault.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, message)
    }

    /// Sets the suggested retry delay.
    #[must_use]
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }
}

impl Classify for Fault {
    fn category(&self) -> ErrorCategory {
        self.category
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    fn error_type(&self) -> String {
        self.code.clone().unwrap_or_else(|| "Fault".to_string())
    }
}

/// Raised by a circuit breaker that is open or already running its trial.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Circuit breaker '{service}' is open")]
pub struct CircuitOpenError {
    /// The dependency the breaker guards.
    pub service: String,
}

impl CircuitOpenError {
    /// Creates a new circuit-open error.
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

/// Task generation failure. Carries no taxonomy of its own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Task planning failed: {message}")]
pub struct PlanningError {
    /// What went wrong.
    pub message: String,
    /// The obligation being processed, if known.
    pub obligation_id: Option<String>,
}

impl PlanningError {
    /// Creates a new planning error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            obligation_id: None,
        }
    }

    /// Sets the obligation id.
    #[must_use]
    pub fn for_obligation(mut self, obligation_id: impl Into<String>) -> Self {
        self.obligation_id = Some(obligation_id.into());
        self
    }
}

/// Makes an error message safe to store and show: control characters are
/// replaced with spaces, whitespace runs collapsed, and the result cut to
/// `limit` characters.
#[must_use]
pub fn sanitize_message(raw: &str, limit: usize) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= limit {
        collapsed
    } else {
        let mut cut: String = collapsed.chars().take(limit.saturating_sub(3)).collect();
        cut.push_str("...");
        cut
    }
}
