//! The contract a stage's domain logic implements.

use crate::errors::ComplyflowError;
use crate::messages::StageTrigger;
use crate::models::ProcessingStage;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Domain logic for one pipeline stage.
///
/// The orchestrator owns status records, retries, breaking, dead-lettering,
/// notifications, and next-stage triggers; a handler only does the work and
/// reports what it produced. `run` may be invoked more than once for the
/// same trigger, so its writes must be idempotent. Every attempt for one
/// message receives the same [`Invocation`].
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// The stage this handler implements.
    fn stage(&self) -> ProcessingStage;

    /// Component name written to status metadata and notifications,
    /// e.g. `planner_agent`.
    fn source(&self) -> &str;

    /// Name of the circuit breaker guarding this stage's dependencies.
    fn dependency(&self) -> &str;

    /// Processes one trigger. Nested retries must end by
    /// `invocation.deadline()`.
    async fn run(
        &self,
        trigger: &StageTrigger,
        invocation: &Invocation,
    ) -> Result<StageOutcome, ComplyflowError>;
}

/// State shared by every attempt at one message: the invocation deadline
/// and values a handler computed on an earlier attempt.
pub struct Invocation {
    deadline: Instant,
    memo: Mutex<HashMap<&'static str, Arc<dyn Any + Send + Sync>>>,
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("remaining", &self.remaining())
            .field("memo_keys", &self.memo.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Invocation {
    /// Starts an invocation that must finish within `budget`.
    #[must_use]
    pub fn new(budget: Duration) -> Self {
        Self::with_deadline(Instant::now() + budget)
    }

    /// Starts an invocation ending at `deadline`.
    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline,
            memo: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the instant by which all work must be done.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Returns the time left before the deadline.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Stores `value` under `key` for later attempts and returns it.
    pub fn remember<T: Any + Send + Sync>(&self, key: &'static str, value: T) -> Arc<T> {
        let value = Arc::new(value);
        self.memo.lock().insert(key, value.clone());
        value
    }

    /// Returns the value stored under `key`, if it has type `T`.
    #[must_use]
    pub fn recall<T: Any + Send + Sync>(&self, key: &'static str) -> Option<Arc<T>> {
        let value = self.memo.lock().get(key).cloned()?;
        value.downcast::<T>().ok()
    }
}

/// What a successful stage run produced.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StageOutcome {
    /// Field name carrying the artifact count, e.g. `tasks_generated`.
    pub artifact_key: String,
    /// Number of artifacts produced.
    pub artifact_count: usize,
    /// Extra keys merged into the completed status record.
    pub metadata: Map<String, Value>,
    /// Warning recorded on the status record.
    pub warning: Option<String>,
}

impl StageOutcome {
    /// Creates an outcome reporting `count` artifacts under `artifact_key`.
    #[must_use]
    pub fn new(artifact_key: impl Into<String>, count: usize) -> Self {
        Self {
            artifact_key: artifact_key.into(),
            artifact_count: count,
            metadata: Map::new(),
            warning: None,
        }
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sets the warning.
    #[must_use]
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warning = Some(warning.into());
        self
    }

    /// Returns true if nothing was produced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.artifact_count == 0
    }
}
