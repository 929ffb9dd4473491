//! Message-driven stage execution.

use super::stage::{Invocation, StageHandler, StageOutcome};
use super::tracker::{BeginOutcome, StatusTracker};
use crate::config::PipelineConfig;
use crate::errors::{sanitize_message, ComplyflowError};
use crate::messages::{DeadLetterMessage, NotificationEvent, NotificationMessage, StageTrigger};
use crate::models::ProcessingStage;
use crate::observability::ErrorMetrics;
use crate::ports::{NotificationSink, QueuePublisher, StatusStore};
use crate::resilience::{CircuitBreakerRegistry, Classify, ErrorCategory, ResilientCaller};
use crate::utils::now_utc;
use futures::stream::{self, StreamExt};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};

/// Longest error message written to a status record.
pub const STATUS_MESSAGE_LIMIT: usize = 500;

/// Why a message was acknowledged without running the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The same trigger already completed the stage.
    Duplicate,
    /// Another attempt is in flight.
    InProgress,
}

/// What happened to one queue message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// The stage completed.
    Completed {
        /// Document processed.
        document_id: String,
        /// Artifacts produced.
        artifacts: usize,
        /// Attempt number recorded on the status record.
        attempt: u64,
    },
    /// Nothing was run.
    Skipped {
        /// Document the trigger named.
        document_id: String,
        /// Why.
        reason: SkipReason,
    },
    /// The stage failed; the failure was recorded, dead-lettered, and
    /// notified.
    Failed {
        /// Document the trigger named, if it could be parsed.
        document_id: Option<String>,
        /// Category of the final fault.
        category: ErrorCategory,
    },
}

impl MessageOutcome {
    /// Returns the document the message concerned, if known.
    #[must_use]
    pub fn document_id(&self) -> Option<&str> {
        match self {
            Self::Completed { document_id, .. } | Self::Skipped { document_id, .. } => {
                Some(document_id)
            }
            Self::Failed { document_id, .. } => document_id.as_deref(),
        }
    }

    /// Returns true for [`MessageOutcome::Failed`].
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Tally of one batch of messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Messages whose stage completed.
    pub processed: usize,
    /// Messages whose stage failed.
    pub failed: usize,
    /// Duplicates and in-flight triggers.
    pub skipped: usize,
    /// Artifacts produced across the batch.
    pub total_artifacts: usize,
    /// Per-message outcomes, in input order.
    pub outcomes: Vec<MessageOutcome>,
}

impl BatchReport {
    /// Builds a report from per-message outcomes.
    #[must_use]
    pub fn from_outcomes(outcomes: Vec<MessageOutcome>) -> Self {
        let mut report = Self::default();
        for outcome in &outcomes {
            match outcome {
                MessageOutcome::Completed { artifacts, .. } => {
                    report.processed += 1;
                    report.total_artifacts += artifacts;
                }
                MessageOutcome::Skipped { .. } => report.skipped += 1,
                MessageOutcome::Failed { .. } => report.failed += 1,
            }
        }
        report.outcomes = outcomes;
        report
    }
}

/// Runs one stage's domain logic for queue messages.
///
/// Owns the stage's status records, wraps the handler in the dependency's
/// circuit breaker and the retry policy, forwards terminal failures to the
/// dead-letter queue, sends notifications, and enqueues the next stage.
/// A failed message never affects the others in its batch.
pub struct StageOrchestrator {
    handler: Arc<dyn StageHandler>,
    tracker: StatusTracker,
    publisher: Arc<dyn QueuePublisher>,
    notifier: Arc<dyn NotificationSink>,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Arc<ErrorMetrics>,
    config: Arc<PipelineConfig>,
}

impl fmt::Debug for StageOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageOrchestrator")
            .field("stage", &self.handler.stage())
            .field("source", &self.handler.source())
            .finish_non_exhaustive()
    }
}

impl StageOrchestrator {
    /// Creates an orchestrator with its own breaker registry and metrics.
    #[must_use]
    pub fn new(
        handler: Arc<dyn StageHandler>,
        status_store: Arc<dyn StatusStore>,
        publisher: Arc<dyn QueuePublisher>,
        notifier: Arc<dyn NotificationSink>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            handler,
            tracker: StatusTracker::new(status_store),
            publisher,
            notifier,
            breakers: Arc::new(config.breaker_registry()),
            metrics: Arc::new(ErrorMetrics::new()),
            config,
        }
    }

    /// Shares a breaker registry, so breaker state survives across
    /// orchestrators and invocations.
    #[must_use]
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    /// Shares an error-metrics collector.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<ErrorMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Returns the stage this orchestrator runs.
    #[must_use]
    pub fn stage(&self) -> ProcessingStage {
        self.handler.stage()
    }

    /// Returns the status tracker.
    #[must_use]
    pub fn tracker(&self) -> &StatusTracker {
        &self.tracker
    }

    /// Returns the breaker registry.
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Returns the error metrics.
    #[must_use]
    pub fn metrics(&self) -> &Arc<ErrorMetrics> {
        &self.metrics
    }

    /// Handles a batch, at most `batch_concurrency` messages at a time.
    /// Outcomes are reported in input order.
    pub async fn handle_batch(&self, bodies: &[Value]) -> BatchReport {
        let concurrency = self.config.batch_concurrency.max(1);
        let outcomes: Vec<MessageOutcome> = stream::iter(bodies)
            .map(|body| self.handle_message(body))
            .buffered(concurrency)
            .collect()
            .await;
        let report = BatchReport::from_outcomes(outcomes);
        info!(
            stage = %self.stage(),
            processed = report.processed,
            failed = report.failed,
            skipped = report.skipped,
            "Batch finished"
        );
        report
    }

    /// Handles one queue message. Never returns an error: every failure is
    /// recorded and reported through the outcome.
    pub async fn handle_message(&self, body: &Value) -> MessageOutcome {
        let stage = self.stage();
        match StageTrigger::parse(body) {
            Ok(trigger) => {
                let span = info_span!("stage", document_id = %trigger.document_id, stage = %stage);
                self.process(trigger, body).instrument(span).await
            }
            Err(fault) => {
                let err = ComplyflowError::from(fault);
                error!(%stage, error = %err, "Rejecting malformed stage trigger");
                self.metrics
                    .record_error(self.handler.source(), &err.error_type(), err.category());
                self.dead_letter(body, &err).await;
                MessageOutcome::Failed {
                    document_id: None,
                    category: err.category(),
                }
            }
        }
    }

    async fn process(&self, trigger: StageTrigger, body: &Value) -> MessageOutcome {
        let stage = self.stage();
        let invocation = Invocation::new(self.config.budget(stage));
        let source = self.handler.source();
        let document_id = trigger.document_id.trim().to_string();
        info!(
            source,
            trigger_stage = trigger.stage.as_deref().unwrap_or(""),
            recovery = trigger.is_recovery_attempt(),
            "Processing stage trigger"
        );

        let begin = self
            .tracker
            .begin(&trigger, stage, source, now_utc(), self.config.stale_after(stage))
            .await;
        let attempt = match begin {
            Ok(BeginOutcome::Started { attempt, .. }) => attempt,
            Ok(BeginOutcome::Duplicate) => {
                info!("Trigger already processed, skipping");
                return MessageOutcome::Skipped {
                    document_id,
                    reason: SkipReason::Duplicate,
                };
            }
            Ok(BeginOutcome::AlreadyActive) => {
                info!("Stage attempt already in flight, skipping");
                return MessageOutcome::Skipped {
                    document_id,
                    reason: SkipReason::InProgress,
                };
            }
            Err(err) => return self.fail(&document_id, body, &err, None).await,
        };

        let dependency = self.handler.dependency();
        let breaker = self
            .breakers
            .get_or_create_with(dependency, self.config.breaker.for_dependency(dependency));
        let retry = self
            .config
            .retry_executor(invocation.deadline())
            .with_metrics(dependency, Arc::clone(&self.metrics));
        let caller = ResilientCaller::new(breaker, retry);

        match caller.call(|| self.handler.run(&trigger, &invocation)).await {
            Ok(outcome) => self.succeed(&document_id, body, attempt, outcome).await,
            Err(err) => self.fail(&document_id, body, &err, Some(attempt)).await,
        }
    }

    async fn succeed(
        &self,
        document_id: &str,
        body: &Value,
        attempt: u64,
        outcome: StageOutcome,
    ) -> MessageOutcome {
        let stage = self.stage();
        let source = self.handler.source();
        let count = outcome.artifact_count;

        let mut metadata = outcome.metadata.clone();
        metadata.insert("completed_by".to_string(), Value::from(source));
        metadata.insert(outcome.artifact_key.clone(), Value::from(count));
        let warning = outcome
            .warning
            .clone()
            .or_else(|| outcome.is_empty().then(|| format!("{stage} produced no artifacts")));
        if let Some(warning) = &warning {
            warn!(warning = %warning, "Stage completed with warning");
            metadata.insert("warning".to_string(), Value::from(warning.as_str()));
        }

        if let Err(err) = self.tracker.complete(document_id, stage, metadata).await {
            return self.fail(document_id, body, &err, Some(attempt)).await;
        }

        if outcome.is_empty() {
            info!("No artifacts produced, next stage not triggered");
        } else {
            self.trigger_next(document_id, &outcome).await;
        }

        let summary = format!(
            "{} completed for document {document_id}: {count} {}",
            stage_title(stage),
            outcome.artifact_key.replace('_', " ")
        );
        let mut note = NotificationMessage::new(
            document_id,
            NotificationEvent::for_stage(stage, true),
            summary,
            source,
            &now_utc(),
        )
        .with_metadata_entry(outcome.artifact_key.clone(), count)
        .with_metadata_entry("attempt", attempt);
        if let Some(warning) = warning {
            note = note.with_metadata_entry("warning", warning);
        }
        self.notify(&note).await;

        info!(artifacts = count, attempt, "Stage completed");
        MessageOutcome::Completed {
            document_id: document_id.to_string(),
            artifacts: count,
            attempt,
        }
    }

    async fn trigger_next(&self, document_id: &str, outcome: &StageOutcome) {
        let stage = self.stage();
        let Some(next) = stage.next().filter(|s| *s != ProcessingStage::Completed) else {
            return;
        };
        let Some(queue) = self.config.stage_queue(next) else {
            warn!(next_stage = %next, "No queue configured for next stage");
            return;
        };

        let message = StageTrigger::new(document_id)
            .with_stage(stage.completion_label())
            .with_field(outcome.artifact_key.clone(), outcome.artifact_count)
            .with_timestamp(&now_utc())
            .with_source(self.handler.source());
        match self.publisher.publish(queue, &message.to_value()).await {
            Ok(()) => info!(queue, next_stage = %next, "Enqueued next stage"),
            Err(err) => {
                error!(queue, next_stage = %next, error = %err, "Failed to enqueue next stage");
                self.metrics
                    .record_error(self.handler.source(), &err.error_type(), err.category());
            }
        }
    }

    async fn fail(
        &self,
        document_id: &str,
        body: &Value,
        err: &ComplyflowError,
        attempt: Option<u64>,
    ) -> MessageOutcome {
        let stage = self.stage();
        let source = self.handler.source();
        let category = err.category();
        let error_type = err.error_type();
        let message = sanitize_message(
            &format!("{stage} failed: {category}: {err}"),
            STATUS_MESSAGE_LIMIT,
        );
        error!(%category, error_type = %error_type, error = %err, "Stage failed");
        self.metrics.record_error(source, &error_type, category);

        if attempt.is_some() {
            let mut metadata = Map::new();
            metadata.insert("failed_by".to_string(), Value::from(source));
            metadata.insert("error_category".to_string(), Value::from(category.as_str()));
            metadata.insert("error_type".to_string(), Value::from(error_type.as_str()));
            let recorded = self.tracker.fail(document_id, stage, &message, metadata).await;
            if let Err(status_err) = recorded {
                error!(error = %status_err, "Failed to record stage failure");
            }
        }

        self.dead_letter(body, err).await;

        let mut note = NotificationMessage::new(
            document_id,
            NotificationEvent::for_stage(stage, false),
            message,
            source,
            &now_utc(),
        )
        .with_metadata_entry("error_category", category.as_str());
        if let Some(attempt) = attempt {
            note = note.with_metadata_entry("attempt", attempt);
        }
        self.notify(&note).await;

        MessageOutcome::Failed {
            document_id: Some(document_id.to_string()),
            category,
        }
    }

    async fn dead_letter(&self, body: &Value, err: &ComplyflowError) {
        let stage = self.stage();
        let Some(queue) = self.config.dead_letter_queue(stage) else {
            warn!(%stage, "No dead-letter queue configured, dropping failed message");
            return;
        };
        let envelope =
            DeadLetterMessage::for_failure(body, err, format!("{stage}_processing"), &now_utc());
        match self.publisher.publish(queue, &envelope.to_value()).await {
            Ok(()) => info!(
                queue,
                retry_count = envelope.retry_count,
                "Sent message to dead-letter queue"
            ),
            Err(publish_err) => {
                error!(queue, error = %publish_err, "Failed to send message to dead-letter queue");
            }
        }
    }

    async fn notify(&self, note: &NotificationMessage) {
        if let Err(err) = self.notifier.notify(note).await {
            warn!(event_type = %note.event_type, error = %err, "Failed to send notification");
        }
    }
}

fn stage_title(stage: ProcessingStage) -> String {
    let name = stage.as_str();
    let mut chars = name.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_ascii_uppercase().to_string() + chars.as_str()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_title() {
        assert_eq!(stage_title(ProcessingStage::Planning), "Planning");
        assert_eq!(stage_title(ProcessingStage::Upload), "Upload");
    }

    #[test]
    fn test_batch_report_tally() {
        let report = BatchReport::from_outcomes(vec![
            MessageOutcome::Completed {
                document_id: "doc_1".to_string(),
                artifacts: 4,
                attempt: 1,
            },
            MessageOutcome::Failed {
                document_id: None,
                category: ErrorCategory::Validation,
            },
            MessageOutcome::Skipped {
                document_id: "doc_2".to_string(),
                reason: SkipReason::Duplicate,
            },
            MessageOutcome::Completed {
                document_id: "doc_3".to_string(),
                artifacts: 2,
                attempt: 2,
            },
        ]);
        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.total_artifacts, 6);
        assert_eq!(report.outcomes[1].document_id(), None);
        assert!(report.outcomes[1].is_failure());
    }
}
