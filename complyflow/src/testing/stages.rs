//! A stage handler driven by a script.

use crate::errors::{ComplyflowError, Fault};
use crate::messages::StageTrigger;
use crate::models::ProcessingStage;
use crate::orchestrator::{Invocation, StageHandler, StageOutcome};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Stage handler that replays scripted results and records every trigger.
///
/// Each run pops the next scripted result; once the script is exhausted
/// every run returns the fallback, which produces one artifact unless set
/// with [`ScriptedStage::failing_with`].
#[derive(Debug)]
pub struct ScriptedStage {
    stage: ProcessingStage,
    source: String,
    dependency: String,
    artifact_key: String,
    script: Mutex<VecDeque<Result<usize, Fault>>>,
    fallback: Result<usize, Fault>,
    triggers: Mutex<Vec<StageTrigger>>,
}

impl ScriptedStage {
    /// Creates a handler for `stage` named `<stage>_agent`.
    #[must_use]
    pub fn new(stage: ProcessingStage) -> Self {
        Self {
            stage,
            source: format!("{stage}_agent"),
            dependency: stage.as_str().to_string(),
            artifact_key: "artifacts".to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback: Ok(1),
            triggers: Mutex::new(Vec::new()),
        }
    }

    /// Sets the breaker name.
    #[must_use]
    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependency = dependency.into();
        self
    }

    /// Sets the artifact key reported in outcomes.
    #[must_use]
    pub fn with_artifact_key(mut self, key: impl Into<String>) -> Self {
        self.artifact_key = key.into();
        self
    }

    /// Queues a run producing `count` artifacts.
    #[must_use]
    pub fn produce(self, count: usize) -> Self {
        self.script.lock().push_back(Ok(count));
        self
    }

    /// Queues a failing run.
    #[must_use]
    pub fn fail(self, fault: Fault) -> Self {
        self.script.lock().push_back(Err(fault));
        self
    }

    /// Makes every run after the script fail with `fault`.
    #[must_use]
    pub fn failing_with(mut self, fault: Fault) -> Self {
        self.fallback = Err(fault);
        self
    }

    /// Returns how many times the handler ran.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.triggers.lock().len()
    }

    /// Returns every trigger the handler ran with.
    #[must_use]
    pub fn triggers(&self) -> Vec<StageTrigger> {
        self.triggers.lock().clone()
    }
}

#[async_trait]
impl StageHandler for ScriptedStage {
    fn stage(&self) -> ProcessingStage {
        self.stage
    }

    fn source(&self) -> &str {
        &self.source
    }

    fn dependency(&self) -> &str {
        &self.dependency
    }

    async fn run(
        &self,
        trigger: &StageTrigger,
        _invocation: &Invocation,
    ) -> Result<StageOutcome, ComplyflowError> {
        self.triggers.lock().push(trigger.clone());
        let next = self.script.lock().pop_front();
        let result = next.unwrap_or_else(|| self.fallback.clone());
        let count = result?;
        Ok(StageOutcome::new(self.artifact_key.clone(), count))
    }
}
