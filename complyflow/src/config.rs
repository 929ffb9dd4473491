//! Pipeline configuration.
//!
//! [`PipelineConfig`] can be deserialized (every field has a default), built
//! with `with_*` setters, or read from the environment with
//! [`PipelineConfig::from_env`].

use crate::errors::ComplyflowError;
use crate::models::ProcessingStage;
use crate::resilience::{
    CircuitBreakerConfig, CircuitBreakerRegistry, ExponentialBackoff, RetryExecutor,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Breaker name used by the planning stage.
pub const PLANNER_DEPENDENCY: &str = "planner";

/// Breaker name used for text-generation calls.
pub const TEXT_GENERATION_DEPENDENCY: &str = "text-generation";

fn default_max_attempts() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_batch_concurrency() -> usize {
    1
}

const DEFAULT_BUDGET_MS: u64 = 600_000;

fn default_budgets() -> BTreeMap<ProcessingStage, u64> {
    BTreeMap::from([
        (ProcessingStage::Upload, 300_000),
        (ProcessingStage::Analysis, 900_000),
        (ProcessingStage::Planning, DEFAULT_BUDGET_MS),
        (ProcessingStage::Reporting, DEFAULT_BUDGET_MS),
    ])
}

fn default_breaker_overrides() -> BTreeMap<String, CircuitBreakerConfig> {
    BTreeMap::from([(
        PLANNER_DEPENDENCY.to_string(),
        CircuitBreakerConfig::new().with_recovery_timeout(Duration::from_secs(300)),
    )])
}

/// Retry policy applied around each stage's domain logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Attempt ceiling, including the first attempt.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay policy between attempts.
    #[serde(default)]
    pub backoff: ExponentialBackoff,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: ExponentialBackoff::default(),
        }
    }
}

/// Circuit breaker thresholds, with per-dependency overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Thresholds for dependencies without an override.
    #[serde(default)]
    pub default: CircuitBreakerConfig,
    /// Thresholds keyed by dependency name.
    #[serde(default = "default_breaker_overrides")]
    pub overrides: BTreeMap<String, CircuitBreakerConfig>,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            default: CircuitBreakerConfig::default(),
            overrides: default_breaker_overrides(),
        }
    }
}

impl BreakerSettings {
    /// Returns the thresholds for `dependency`.
    #[must_use]
    pub fn for_dependency(&self, dependency: &str) -> CircuitBreakerConfig {
        self.overrides
            .get(dependency)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// Planning-engine switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerSettings {
    /// Ask the text generator for plan enhancements.
    #[serde(default = "default_true")]
    pub use_ai_enhancement: bool,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            use_ai_enhancement: true,
        }
    }
}

/// Configuration for the stage orchestrators, planner, and recovery tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Retry policy.
    #[serde(default)]
    pub retry: RetrySettings,
    /// Circuit breaker thresholds.
    #[serde(default)]
    pub breaker: BreakerSettings,
    /// Planner switches.
    #[serde(default)]
    pub planner: PlannerSettings,
    /// Dead-letter queue per stage; stages without one drop failed messages
    /// after logging.
    #[serde(default)]
    pub dead_letter_queues: BTreeMap<ProcessingStage, String>,
    /// Input queue per stage.
    #[serde(default)]
    pub stage_queues: BTreeMap<ProcessingStage, String>,
    /// Invocation time budget per stage, in milliseconds.
    #[serde(default = "default_budgets")]
    pub invocation_budget_ms: BTreeMap<ProcessingStage, u64>,
    /// Age after which an in-flight record counts as stuck, in
    /// milliseconds. Unset means twice the stage's invocation budget.
    #[serde(default)]
    pub stale_after_ms: Option<u64>,
    /// Messages handled concurrently within one batch.
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry: RetrySettings::default(),
            breaker: BreakerSettings::default(),
            planner: PlannerSettings::default(),
            dead_letter_queues: BTreeMap::new(),
            stage_queues: BTreeMap::new(),
            invocation_budget_ms: default_budgets(),
            stale_after_ms: None,
            batch_concurrency: default_batch_concurrency(),
        }
    }
}

impl PipelineConfig {
    /// Creates a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the configuration from process environment variables.
    pub fn from_env() -> Result<Self, ComplyflowError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name
    /// to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ComplyflowError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let read = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(raw) = read("USE_AI_ENHANCEMENT") {
            config.planner.use_ai_enhancement = parse_bool("USE_AI_ENHANCEMENT", &raw)?;
        }

        for stage in [
            ProcessingStage::Analysis,
            ProcessingStage::Planning,
            ProcessingStage::Reporting,
        ] {
            let prefix = stage.as_str().to_ascii_uppercase();
            if let Some(url) = read(&format!("{prefix}_DLQ_URL")) {
                config.dead_letter_queues.insert(stage, url);
            }
            if let Some(url) = read(&format!("{prefix}_QUEUE_URL")) {
                config.stage_queues.insert(stage, url);
            }
        }

        for stage in [
            ProcessingStage::Upload,
            ProcessingStage::Analysis,
            ProcessingStage::Planning,
            ProcessingStage::Reporting,
        ] {
            let key = format!("{}_TIMEOUT", stage.as_str().to_ascii_uppercase());
            if let Some(raw) = read(&key) {
                let secs: u64 = parse_number(&key, &raw)?;
                config.invocation_budget_ms.insert(stage, secs.saturating_mul(1000));
            }
        }

        if let Some(raw) = read("RETRY_MAX_ATTEMPTS") {
            config.retry.max_attempts = parse_number("RETRY_MAX_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = read("BREAKER_FAILURE_THRESHOLD") {
            let threshold: u32 = parse_number("BREAKER_FAILURE_THRESHOLD", &raw)?;
            config.breaker.default.failure_threshold = threshold;
            for breaker in config.breaker.overrides.values_mut() {
                breaker.failure_threshold = threshold;
            }
        }
        if let Some(raw) = read("BREAKER_RECOVERY_TIMEOUT") {
            let secs: u64 = parse_number("BREAKER_RECOVERY_TIMEOUT", &raw)?;
            let timeout_ms = secs.saturating_mul(1000);
            config.breaker.default.recovery_timeout_ms = timeout_ms;
            for breaker in config.breaker.overrides.values_mut() {
                breaker.recovery_timeout_ms = timeout_ms;
            }
        }
        if let Some(raw) = read("STALE_PROCESSING_SECONDS") {
            let secs: u64 = parse_number("STALE_PROCESSING_SECONDS", &raw)?;
            config.stale_after_ms = Some(secs.saturating_mul(1000));
        }
        if let Some(raw) = read("BATCH_CONCURRENCY") {
            config.batch_concurrency = parse_number("BATCH_CONCURRENCY", &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ComplyflowError> {
        if self.retry.max_attempts == 0 {
            return Err(ComplyflowError::config("retry.max_attempts must be at least 1"));
        }
        if self.retry.backoff.multiplier < 1.0 {
            return Err(ComplyflowError::config("retry.backoff.multiplier must be >= 1.0"));
        }
        if self.breaker.default.failure_threshold == 0
            || self.breaker.overrides.values().any(|b| b.failure_threshold == 0)
        {
            return Err(ComplyflowError::config("breaker failure_threshold must be at least 1"));
        }
        if self.batch_concurrency == 0 {
            return Err(ComplyflowError::config("batch_concurrency must be at least 1"));
        }
        if let Some((stage, _)) = self.invocation_budget_ms.iter().find(|(_, ms)| **ms == 0) {
            return Err(ComplyflowError::config(format!(
                "invocation budget for {stage} must be positive"
            )));
        }
        Ok(())
    }

    /// Sets the dead-letter queue for `stage`.
    #[must_use]
    pub fn with_dead_letter_queue(
        mut self,
        stage: ProcessingStage,
        queue: impl Into<String>,
    ) -> Self {
        self.dead_letter_queues.insert(stage, queue.into());
        self
    }

    /// Sets the input queue for `stage`.
    #[must_use]
    pub fn with_stage_queue(mut self, stage: ProcessingStage, queue: impl Into<String>) -> Self {
        self.stage_queues.insert(stage, queue.into());
        self
    }

    /// Sets the attempt ceiling.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry.max_attempts = max_attempts;
        self
    }

    /// Sets the backoff policy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.retry.backoff = backoff;
        self
    }

    /// Sets the default breaker thresholds.
    #[must_use]
    pub fn with_default_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker.default = breaker;
        self
    }

    /// Overrides the breaker thresholds for `dependency`.
    #[must_use]
    pub fn with_breaker_override(
        mut self,
        dependency: impl Into<String>,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        self.breaker.overrides.insert(dependency.into(), breaker);
        self
    }

    /// Enables or disables AI enhancement.
    #[must_use]
    pub fn with_ai_enhancement(mut self, enabled: bool) -> Self {
        self.planner.use_ai_enhancement = enabled;
        self
    }

    /// Sets the invocation budget for `stage`, to millisecond precision.
    #[must_use]
    pub fn with_budget(mut self, stage: ProcessingStage, budget: Duration) -> Self {
        self.invocation_budget_ms.insert(stage, duration_ms(budget));
        self
    }

    /// Sets the stuck-record threshold for every stage, to millisecond
    /// precision.
    #[must_use]
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after_ms = Some(duration_ms(stale_after));
        self
    }

    /// Sets the batch concurrency.
    #[must_use]
    pub fn with_batch_concurrency(mut self, concurrency: usize) -> Self {
        self.batch_concurrency = concurrency;
        self
    }

    /// Returns the dead-letter queue for `stage`.
    #[must_use]
    pub fn dead_letter_queue(&self, stage: ProcessingStage) -> Option<&str> {
        self.dead_letter_queues.get(&stage).map(String::as_str)
    }

    /// Returns the input queue for `stage`.
    #[must_use]
    pub fn stage_queue(&self, stage: ProcessingStage) -> Option<&str> {
        self.stage_queues.get(&stage).map(String::as_str)
    }

    /// Returns the invocation budget for `stage`. Stages without one get
    /// the planning default.
    #[must_use]
    pub fn budget(&self, stage: ProcessingStage) -> Duration {
        let ms = self
            .invocation_budget_ms
            .get(&stage)
            .copied()
            .unwrap_or(DEFAULT_BUDGET_MS);
        Duration::from_millis(ms)
    }

    /// Returns the age after which an in-flight record at `stage` is stuck.
    #[must_use]
    pub fn stale_after(&self, stage: ProcessingStage) -> Duration {
        self.stale_after_ms
            .map_or_else(|| self.budget(stage) * 2, Duration::from_millis)
    }

    /// Builds a retry executor whose backoff sleeps never run past
    /// `deadline`, normally the invocation's.
    #[must_use]
    pub fn retry_executor(&self, deadline: Instant) -> RetryExecutor {
        RetryExecutor::new(self.retry.max_attempts)
            .with_backoff(self.retry.backoff.clone())
            .with_deadline(deadline)
    }

    /// Builds a breaker registry and registers every configured override.
    #[must_use]
    pub fn breaker_registry(&self) -> CircuitBreakerRegistry {
        let registry = CircuitBreakerRegistry::with_default_config(self.breaker.default.clone());
        for (dependency, breaker) in &self.breaker.overrides {
            registry.get_or_create_with(dependency, breaker.clone());
        }
        registry
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn parse_number<T: FromStr>(key: &str, raw: &str) -> Result<T, ComplyflowError> {
    raw.parse()
        .map_err(|_| {
            ComplyflowError::config(format!("{key} must be a non-negative integer, got '{raw}'"))
        })
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ComplyflowError> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ComplyflowError::config(format!("{key} must be true or false, got '{raw}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.planner.use_ai_enhancement);
        assert_eq!(config.batch_concurrency, 1);
        assert_eq!(config.budget(ProcessingStage::Analysis), Duration::from_secs(900));
        assert_eq!(config.stale_after(ProcessingStage::Planning), Duration::from_secs(1200));
        assert_eq!(
            config.breaker.for_dependency(PLANNER_DEPENDENCY).recovery_timeout(),
            Duration::from_secs(300)
        );
        assert_eq!(
            config.breaker.for_dependency("object-store").recovery_timeout(),
            Duration::from_secs(60)
        );
        assert!(config.dead_letter_queue(ProcessingStage::Planning).is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_reads_variables() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("USE_AI_ENHANCEMENT", "false"),
            ("PLANNING_DLQ_URL", "planning-dlq"),
            ("REPORTING_QUEUE_URL", "reporting-queue"),
            ("PLANNING_TIMEOUT", "120"),
            ("RETRY_MAX_ATTEMPTS", "5"),
            ("BREAKER_FAILURE_THRESHOLD", "2"),
            ("BREAKER_RECOVERY_TIMEOUT", "30"),
            ("STALE_PROCESSING_SECONDS", "45"),
            ("BATCH_CONCURRENCY", "4"),
        ]))
        .unwrap();

        assert!(!config.planner.use_ai_enhancement);
        assert_eq!(config.dead_letter_queue(ProcessingStage::Planning), Some("planning-dlq"));
        assert_eq!(config.stage_queue(ProcessingStage::Reporting), Some("reporting-queue"));
        assert_eq!(config.budget(ProcessingStage::Planning), Duration::from_secs(120));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.breaker.for_dependency("object-store").failure_threshold, 2);
        assert_eq!(config.breaker.for_dependency(PLANNER_DEPENDENCY).failure_threshold, 2);
        assert_eq!(
            config.breaker.for_dependency("object-store").recovery_timeout(),
            Duration::from_secs(30)
        );
        assert_eq!(
            config.breaker.for_dependency(PLANNER_DEPENDENCY).recovery_timeout(),
            Duration::from_secs(30)
        );
        assert_eq!(config.stale_after(ProcessingStage::Analysis), Duration::from_secs(45));
        assert_eq!(config.batch_concurrency, 4);
    }

    #[test]
    fn test_sub_second_durations_keep_millisecond_precision() {
        let config = PipelineConfig::new()
            .with_budget(ProcessingStage::Planning, Duration::from_millis(500))
            .with_stale_after(Duration::from_millis(1_500));

        assert_eq!(config.budget(ProcessingStage::Planning), Duration::from_millis(500));
        assert_eq!(config.stale_after(ProcessingStage::Planning), Duration::from_millis(1_500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_executor_uses_configured_attempts() {
        let executor = PipelineConfig::new().with_max_attempts(4).retry_executor(Instant::now());
        assert_eq!(executor.max_attempts(), 4);
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        let err =
            PipelineConfig::from_lookup(lookup(&[("RETRY_MAX_ATTEMPTS", "three")])).unwrap_err();
        assert!(matches!(err, ComplyflowError::Config(_)));

        let err =
            PipelineConfig::from_lookup(lookup(&[("USE_AI_ENHANCEMENT", "maybe")])).unwrap_err();
        assert!(err.to_string().contains("USE_AI_ENHANCEMENT"));

        let err = PipelineConfig::from_lookup(lookup(&[("BATCH_CONCURRENCY", "0")])).unwrap_err();
        assert!(matches!(err, ComplyflowError::Config(_)));
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: PipelineConfig = serde_json::from_value(serde_json::json!({
            "dead_letter_queues": {"planning": "planning-dlq"},
            "retry": {"max_attempts": 4}
        }))
        .unwrap();
        assert_eq!(config.dead_letter_queue(ProcessingStage::Planning), Some("planning-dlq"));
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.backoff, ExponentialBackoff::default());
        assert_eq!(config.budget(ProcessingStage::Reporting), Duration::from_secs(600));
    }

    #[test]
    fn test_breaker_registry_applies_overrides() {
        let registry = PipelineConfig::default()
            .with_breaker_override(
                TEXT_GENERATION_DEPENDENCY,
                CircuitBreakerConfig::new().with_failure_threshold(2),
            )
            .breaker_registry();
        let text_generation = registry.get_or_create(TEXT_GENERATION_DEPENDENCY);
        assert_eq!(text_generation.config().failure_threshold, 2);
        assert_eq!(
            registry.get_or_create(PLANNER_DEPENDENCY).config().recovery_timeout(),
            Duration::from_secs(300)
        );
        assert_eq!(registry.get_or_create("other").config().failure_threshold, 5);
    }
}
