//! The planning stage handler.

use super::engine::{PlanningResult, TaskPlanner};
use crate::config::{PipelineConfig, PLANNER_DEPENDENCY, TEXT_GENERATION_DEPENDENCY};
use crate::errors::ComplyflowError;
use crate::messages::StageTrigger;
use crate::models::ProcessingStage;
use crate::orchestrator::{Invocation, StageHandler, StageOutcome};
use crate::ports::{ObligationStore, TaskStore, TextGenerator};
use crate::resilience::{CircuitBreakerRegistry, ResilientCaller};
use crate::utils::now_utc;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Component name written to status metadata and notifications.
pub const PLANNER_SOURCE: &str = "planner_agent";

/// Count field carried to the reporting stage.
pub const TASKS_GENERATED: &str = "tasks_generated";

const PLANNED_BATCH: &str = "planning.batch";

// A plan computed once per invocation; outer retries store this same list.
struct PlannedBatch {
    obligations_processed: usize,
    result: PlanningResult,
}

/// Loads a document's obligations, plans tasks, and stores them.
pub struct PlanningStage {
    obligations: Arc<dyn ObligationStore>,
    tasks: Arc<dyn TaskStore>,
    planner: TaskPlanner,
    config: Arc<PipelineConfig>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl fmt::Debug for PlanningStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanningStage")
            .field("planner", &self.planner)
            .field("use_ai_enhancement", &self.config.planner.use_ai_enhancement)
            .finish_non_exhaustive()
    }
}

impl PlanningStage {
    /// Creates the stage with the standard planner and no text generator.
    #[must_use]
    pub fn new(
        obligations: Arc<dyn ObligationStore>,
        tasks: Arc<dyn TaskStore>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            obligations,
            tasks,
            planner: TaskPlanner::new(),
            breakers: Arc::new(config.breaker_registry()),
            config,
        }
    }

    /// Sets the text generator used for enhancement.
    #[must_use]
    pub fn with_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.planner = self.planner.with_generator(generator);
        self
    }

    /// Replaces the planner.
    #[must_use]
    pub fn with_planner(mut self, planner: TaskPlanner) -> Self {
        self.planner = planner;
        self
    }

    /// Shares a breaker registry, typically the orchestrator's.
    #[must_use]
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    /// Returns the breaker registry.
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    // Shares the invocation deadline with the orchestrator's retry.
    fn generation_caller(&self, deadline: Instant) -> ResilientCaller {
        let breaker = self.breakers.get_or_create_with(
            TEXT_GENERATION_DEPENDENCY,
            self.config.breaker.for_dependency(TEXT_GENERATION_DEPENDENCY),
        );
        ResilientCaller::new(breaker, self.config.retry_executor(deadline))
    }

    async fn plan(
        &self,
        document_id: &str,
        invocation: &Invocation,
    ) -> Result<Arc<PlannedBatch>, ComplyflowError> {
        if let Some(batch) = invocation.recall::<PlannedBatch>(PLANNED_BATCH) {
            debug!(document_id, "Reusing plan from an earlier attempt");
            return Ok(batch);
        }

        let obligations = self.obligations.list_obligations(document_id).await?;
        let result = if obligations.is_empty() {
            PlanningResult::empty(now_utc())
        } else {
            let planner = self
                .planner
                .clone()
                .with_resilience(self.generation_caller(invocation.deadline()));
            planner
                .plan(&obligations, self.config.planner.use_ai_enhancement, now_utc())
                .await?
        };
        Ok(invocation.remember(
            PLANNED_BATCH,
            PlannedBatch {
                obligations_processed: obligations.len(),
                result,
            },
        ))
    }
}

#[async_trait]
impl StageHandler for PlanningStage {
    fn stage(&self) -> ProcessingStage {
        ProcessingStage::Planning
    }

    fn source(&self) -> &str {
        PLANNER_SOURCE
    }

    fn dependency(&self) -> &str {
        PLANNER_DEPENDENCY
    }

    async fn run(
        &self,
        trigger: &StageTrigger,
        invocation: &Invocation,
    ) -> Result<StageOutcome, ComplyflowError> {
        let document_id = trigger.document_id.trim();
        let batch = self.plan(document_id, invocation).await?;
        let processed = batch.obligations_processed;
        if processed == 0 {
            warn!(document_id, "No obligations found for document");
            return Ok(StageOutcome::new(TASKS_GENERATED, 0)
                .with_metadata_entry("obligations_processed", 0)
                .with_warning("No obligations found for document"));
        }

        let result = &batch.result;
        if result.tasks.is_empty() {
            warn!(document_id, "No tasks generated from obligations");
            return Ok(StageOutcome::new(TASKS_GENERATED, 0)
                .with_metadata_entry("obligations_processed", processed)
                .with_warning("No tasks generated from obligations"));
        }

        let stored = self.tasks.batch_create(&result.tasks).await?;
        let distribution = serde_json::to_value(&result.statistics.priority_distribution)?;
        let mut outcome = StageOutcome::new(TASKS_GENERATED, stored)
            .with_metadata_entry("obligations_processed", processed)
            .with_metadata_entry("priority_distribution", distribution)
            .with_metadata_entry("ai_enhanced", result.enhanced);

        if stored < result.tasks.len() {
            warn!(
                document_id,
                stored,
                generated = result.tasks.len(),
                "Partial task write"
            );
            outcome = outcome.with_warning(format!(
                "Only {stored} of {} tasks were stored",
                result.tasks.len()
            ));
        }
        info!(document_id, stored, "Tasks stored");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Fault;
    use crate::models::{DeadlineType, Obligation, ObligationCategory, ObligationSeverity};
    use crate::resilience::{Classify, ErrorCategory, ExponentialBackoff};
    use crate::testing::{InMemoryObligationStore, InMemoryTaskStore, ScriptedTextGenerator};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn invocation() -> Invocation {
        Invocation::new(Duration::from_secs(60))
    }

    struct Fixture {
        obligations: Arc<InMemoryObligationStore>,
        tasks: Arc<InMemoryTaskStore>,
        config: Arc<PipelineConfig>,
    }

    fn fixture(use_ai: bool) -> Fixture {
        let config = PipelineConfig::new()
            .with_ai_enhancement(use_ai)
            .with_backoff(ExponentialBackoff::new().with_base_delay_ms(1).with_jitter(false));
        Fixture {
            obligations: Arc::new(InMemoryObligationStore::new()),
            tasks: Arc::new(InMemoryTaskStore::new()),
            config: Arc::new(config),
        }
    }

    impl Fixture {
        fn stage(&self) -> PlanningStage {
            PlanningStage::new(self.obligations.clone(), self.tasks.clone(), self.config.clone())
        }

        fn add(&self, id: &str, category: ObligationCategory, severity: ObligationSeverity) {
            self.obligations.insert(
                Obligation::new(
                    "doc_1",
                    "Maintain continuous emissions monitoring",
                    category,
                    severity,
                    DeadlineType::Ongoing,
                )
                .with_id(id),
            );
        }
    }

    #[tokio::test]
    async fn test_run_stores_tasks_and_reports_summary() {
        let fx = fixture(false);
        fx.add("obl_1", ObligationCategory::Monitoring, ObligationSeverity::High);
        fx.add("obl_2", ObligationCategory::Financial, ObligationSeverity::Low);

        let outcome = fx.stage().run(&StageTrigger::new("doc_1"), &invocation()).await.unwrap();

        assert_eq!(outcome.artifact_key, TASKS_GENERATED);
        assert_eq!(outcome.artifact_count, 6);
        assert!(outcome.warning.is_none());
        assert_eq!(outcome.metadata["obligations_processed"], json!(2));
        assert_eq!(outcome.metadata["ai_enhanced"], json!(false));
        assert_eq!(outcome.metadata["priority_distribution"], json!({"high": 5, "medium": 1}));
        assert_eq!(fx.tasks.len(), 6);
    }

    #[tokio::test]
    async fn test_rerun_upserts_instead_of_duplicating() {
        let fx = fixture(false);
        fx.add("obl_1", ObligationCategory::Reporting, ObligationSeverity::Medium);
        let stage = fx.stage();

        stage.run(&StageTrigger::new("doc_1"), &invocation()).await.unwrap();
        stage.run(&StageTrigger::new("doc_1"), &invocation()).await.unwrap();
        assert_eq!(fx.tasks.len(), 3);
    }

    #[tokio::test]
    async fn test_no_obligations_is_an_empty_outcome() {
        let fx = fixture(false);
        let outcome = fx.stage().run(&StageTrigger::new("doc_1"), &invocation()).await.unwrap();
        assert!(outcome.is_empty());
        assert_eq!(outcome.warning.as_deref(), Some("No obligations found for document"));
        assert!(fx.tasks.is_empty());
    }

    #[tokio::test]
    async fn test_partial_write_is_reported() {
        let fx = fixture(false);
        fx.add("obl_1", ObligationCategory::Operational, ObligationSeverity::Medium);
        fx.tasks.limit_writes(2);

        let outcome = fx.stage().run(&StageTrigger::new("doc_1"), &invocation()).await.unwrap();
        assert_eq!(outcome.artifact_count, 2);
        assert_eq!(outcome.warning.as_deref(), Some("Only 2 of 3 tasks were stored"));
    }

    #[tokio::test]
    async fn test_store_fault_propagates_with_its_category() {
        let fx = fixture(false);
        fx.obligations
            .push_failure(Fault::from_code("ProvisionedThroughputExceededException", "busy"));
        fx.obligations.push_failure(Fault::from_code("AccessDenied", "no access"));

        let first = fx.stage().run(&StageTrigger::new("doc_1"), &invocation()).await.unwrap_err();
        assert_eq!(first.category(), ErrorCategory::Unknown);
        let second = fx.stage().run(&StageTrigger::new("doc_1"), &invocation()).await.unwrap_err();
        assert_eq!(second.category(), ErrorCategory::Authentication);
    }

    #[tokio::test]
    async fn test_generator_outage_does_not_fail_the_stage() {
        let fx = fixture(true);
        fx.add("obl_1", ObligationCategory::Reporting, ObligationSeverity::High);
        let generator = Arc::new(ScriptedTextGenerator::new());
        let stage = fx.stage().with_generator(generator.clone());

        let outcome = stage.run(&StageTrigger::new("doc_1"), &invocation()).await.unwrap();

        assert_eq!(outcome.artifact_count, 3);
        assert_eq!(outcome.metadata["ai_enhanced"], json!(false));
        assert_eq!(generator.prompts().len(), 3);
        let breaker = stage.breakers().get(TEXT_GENERATION_DEPENDENCY).unwrap();
        assert_eq!(breaker.failure_count(), 1);
    }

    #[tokio::test]
    async fn test_retry_stores_the_plan_from_the_first_attempt() {
        let fx = fixture(true);
        fx.add("obl_1", ObligationCategory::Reporting, ObligationSeverity::Medium);
        let reply = json!({
            "additional_tasks": [
                {"title": "Obtain board sign-off", "description": "Present the report",
                 "priority": "high", "estimated_days": 14, "obligation_ids": ["obl_1"]}
            ]
        });
        let generator = Arc::new(
            ScriptedTextGenerator::new()
                .respond(reply.to_string())
                .respond(r#"{"additional_tasks": [{"title": "Other", "description": "x"}]}"#),
        );
        let stage = fx.stage().with_generator(generator.clone());
        fx.tasks.push_failure(Fault::transient("write conflict"));
        let invocation = invocation();

        let first = stage.run(&StageTrigger::new("doc_1"), &invocation).await;
        assert!(first.is_err());
        let outcome = stage.run(&StageTrigger::new("doc_1"), &invocation).await.unwrap();

        assert_eq!(generator.prompts().len(), 1);
        assert_eq!(outcome.artifact_count, 4);
        assert_eq!(outcome.metadata["ai_enhanced"], json!(true));
        assert!(fx.tasks.all().iter().all(|t| t.title != "Other"));
    }

    #[tokio::test]
    async fn test_generation_retry_stops_at_the_invocation_deadline() {
        let fx = fixture(true);
        fx.add("obl_1", ObligationCategory::Reporting, ObligationSeverity::High);
        let throttled = || Fault::throttled("slow down", Some(Duration::from_millis(400)));
        let generator = Arc::new(
            ScriptedTextGenerator::new()
                .fail(throttled())
                .fail(throttled())
                .fail(throttled()),
        );
        let stage = fx.stage().with_generator(generator.clone());
        let invocation = Invocation::new(Duration::from_millis(100));

        let started = std::time::Instant::now();
        let outcome = stage.run(&StageTrigger::new("doc_1"), &invocation).await.unwrap();

        assert_eq!(outcome.artifact_count, 3);
        assert_eq!(generator.prompts().len(), 1);
        assert!(started.elapsed() < Duration::from_millis(400));
    }
}
