//! In-process error and retry counters.

use crate::resilience::ErrorCategory;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Counters for faults and retries, keyed by service name.
///
/// Shared across invocations via `Arc`; each counter update touches a single
/// map shard.
#[derive(Debug, Default)]
pub struct ErrorMetrics {
    errors: DashMap<(String, ErrorCategory), u64>,
    error_types: DashMap<(String, String), u64>,
    retries: DashMap<(String, u32), u64>,
}

impl ErrorMetrics {
    /// Creates empty counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one fault.
    pub fn record_error(&self, service: &str, error_type: &str, category: ErrorCategory) {
        *self
            .errors
            .entry((service.to_string(), category))
            .or_insert(0) += 1;
        *self
            .error_types
            .entry((service.to_string(), error_type.to_string()))
            .or_insert(0) += 1;
        debug!(service, error_type, %category, "Recorded error");
    }

    /// Records a retry; `attempt` is the attempt that just failed (1-based).
    pub fn record_retry_attempt(&self, service: &str, attempt: u32) {
        *self.retries.entry((service.to_string(), attempt)).or_insert(0) += 1;
    }

    /// Returns the number of faults of `category` for `service`.
    #[must_use]
    pub fn error_count(&self, service: &str, category: ErrorCategory) -> u64 {
        self.errors
            .get(&(service.to_string(), category))
            .map_or(0, |v| *v)
    }

    /// Returns the total faults recorded for `service`.
    #[must_use]
    pub fn total_errors(&self, service: &str) -> u64 {
        self.errors
            .iter()
            .filter(|e| e.key().0 == service)
            .map(|e| *e.value())
            .sum()
    }

    /// Returns the number of retries for `service`.
    #[must_use]
    pub fn retry_count(&self, service: &str) -> u64 {
        self.retries
            .iter()
            .filter(|e| e.key().0 == service)
            .map(|e| *e.value())
            .sum()
    }

    /// Converts the counters to a JSON snapshot.
    #[must_use]
    pub fn to_dict(&self) -> Value {
        let mut errors: Nested = BTreeMap::new();
        for entry in &self.errors {
            let (service, category) = entry.key();
            bump(&mut errors, service, category.to_string(), *entry.value());
        }

        let mut error_types: Nested = BTreeMap::new();
        for entry in &self.error_types {
            let (service, error_type) = entry.key();
            bump(&mut error_types, service, error_type.clone(), *entry.value());
        }

        let mut retries: Nested = BTreeMap::new();
        for entry in &self.retries {
            let (service, attempt) = entry.key();
            bump(&mut retries, service, attempt.to_string(), *entry.value());
        }

        serde_json::json!({
            "errors": errors,
            "error_types": error_types,
            "retries": retries,
        })
    }
}

type Nested = BTreeMap<String, BTreeMap<String, u64>>;

fn bump(map: &mut Nested, service: &str, key: String, count: u64) {
    *map.entry(service.to_string())
        .or_default()
        .entry(key)
        .or_insert(0) += count;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_by_category() {
        let metrics = ErrorMetrics::new();
        metrics.record_error("planner", "ThrottlingException", ErrorCategory::Throttling);
        metrics.record_error("planner", "ThrottlingException", ErrorCategory::Throttling);
        metrics.record_error("planner", "ValidationException", ErrorCategory::Validation);
        metrics.record_error("status-store", "StoreError", ErrorCategory::Transient);

        assert_eq!(metrics.error_count("planner", ErrorCategory::Throttling), 2);
        assert_eq!(metrics.total_errors("planner"), 3);
        assert_eq!(metrics.total_errors("status-store"), 1);
    }

    #[test]
    fn test_retry_counts() {
        let metrics = ErrorMetrics::new();
        metrics.record_retry_attempt("planner", 1);
        metrics.record_retry_attempt("planner", 2);
        metrics.record_retry_attempt("planner", 1);
        assert_eq!(metrics.retry_count("planner"), 3);
        assert_eq!(metrics.retry_count("other"), 0);
    }

    #[test]
    fn test_to_dict_shape() {
        let metrics = ErrorMetrics::new();
        metrics.record_error("planner", "ThrottlingException", ErrorCategory::Throttling);
        metrics.record_retry_attempt("planner", 1);

        let dict = metrics.to_dict();
        assert_eq!(dict["errors"]["planner"]["throttling"], 1);
        assert_eq!(dict["error_types"]["planner"]["ThrottlingException"], 1);
        assert_eq!(dict["retries"]["planner"]["1"], 1);
    }
}
