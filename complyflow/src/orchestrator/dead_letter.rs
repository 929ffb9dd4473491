//! Recovery of dead-lettered stage triggers.

use crate::config::PipelineConfig;
use crate::messages::{DeadLetterMessage, NotificationEvent, NotificationMessage};
use crate::models::ProcessingStage;
use crate::ports::{NotificationSink, QueuePublisher};
use crate::resilience::ErrorCategory;
use crate::utils::{format_iso8601, now_utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Dead-lettered messages that have been through this many recoveries are
/// not requeued again.
pub const MAX_RECOVERY_ATTEMPTS: u32 = 5;

const SOURCE: &str = "dlq_processor";

/// What the processor decided for one dead-letter message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// The failure cannot succeed on retry.
    NoRetryPermanentError,
    /// The message has been recovered too many times.
    MaxRetriesExceeded,
    /// The original message was requeued to its stage.
    RequeuedForProcessing,
    /// The failing stage could not be determined.
    UnknownStage,
    /// The stage has no input queue configured.
    QueueNotConfigured,
    /// The envelope or original message was unreadable.
    NoRecoveryStrategy,
    /// Requeueing was attempted and failed.
    RecoveryFailed,
}

impl RecoveryAction {
    /// Returns the wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoRetryPermanentError => "no_retry_permanent_error",
            Self::MaxRetriesExceeded => "max_retries_exceeded",
            Self::RequeuedForProcessing => "requeued_for_processing",
            Self::UnknownStage => "unknown_stage",
            Self::QueueNotConfigured => "queue_not_configured",
            Self::NoRecoveryStrategy => "no_recovery_strategy",
            Self::RecoveryFailed => "recovery_failed",
        }
    }

    /// Returns true if the message was requeued.
    #[must_use]
    pub fn is_recovered(&self) -> bool {
        matches!(self, Self::RequeuedForProcessing)
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision for one dead-letter message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryResult {
    /// Action taken.
    pub action: RecoveryAction,
    /// Document of the original message, if readable.
    pub document_id: Option<String>,
    /// Stage the message was routed to, if resolved.
    pub stage: Option<ProcessingStage>,
    /// Human-readable reason.
    pub reason: String,
}

/// Tally of a dead-letter batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeadLetterReport {
    /// Messages inspected.
    pub processed: usize,
    /// Messages requeued.
    pub recovered: usize,
    /// Messages left in the dead-letter channel.
    pub failed: usize,
    /// Per-message decisions, in input order.
    pub results: Vec<RecoveryResult>,
}

/// Decides whether dead-lettered triggers are worth another run and
/// requeues the ones that are.
pub struct DeadLetterProcessor {
    publisher: Arc<dyn QueuePublisher>,
    notifier: Arc<dyn NotificationSink>,
    config: Arc<PipelineConfig>,
}

impl fmt::Debug for DeadLetterProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadLetterProcessor").finish_non_exhaustive()
    }
}

impl DeadLetterProcessor {
    /// Creates a processor.
    #[must_use]
    pub fn new(
        publisher: Arc<dyn QueuePublisher>,
        notifier: Arc<dyn NotificationSink>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            publisher,
            notifier,
            config,
        }
    }

    /// Processes a batch of dead-letter bodies.
    pub async fn process_batch(&self, bodies: &[Value]) -> DeadLetterReport {
        let mut report = DeadLetterReport::default();
        for body in bodies {
            let result = self.process(body).await;
            report.processed += 1;
            if result.action.is_recovered() {
                report.recovered += 1;
            } else {
                report.failed += 1;
            }
            report.results.push(result);
        }
        info!(
            processed = report.processed,
            recovered = report.recovered,
            failed = report.failed,
            "Dead-letter batch finished"
        );
        report
    }

    /// Processes one dead-letter body and notifies the outcome.
    pub async fn process(&self, body: &Value) -> RecoveryResult {
        let envelope: DeadLetterMessage = match serde_json::from_value(body.clone()) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(error = %err, "Unreadable dead-letter message");
                return RecoveryResult {
                    action: RecoveryAction::NoRecoveryStrategy,
                    document_id: None,
                    stage: None,
                    reason: format!("unreadable dead-letter message: {err}"),
                };
            }
        };

        let result = self.decide(&envelope).await;
        match result.action {
            RecoveryAction::RequeuedForProcessing => info!(
                document_id = result.document_id.as_deref().unwrap_or(""),
                action = %result.action,
                "Recovered dead-lettered message"
            ),
            _ => warn!(
                document_id = result.document_id.as_deref().unwrap_or(""),
                action = %result.action,
                reason = %result.reason,
                "Dead-lettered message not recovered"
            ),
        }
        self.notify(&envelope, &result).await;
        result
    }

    async fn decide(&self, envelope: &DeadLetterMessage) -> RecoveryResult {
        let document_id = envelope
            .original_message
            .get("document_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let result = |action, stage, reason: String| RecoveryResult {
            action,
            document_id: document_id.clone(),
            stage,
            reason,
        };

        let category = envelope.error.category;
        if matches!(
            category,
            ErrorCategory::Permanent
                | ErrorCategory::Unknown
                | ErrorCategory::Validation
                | ErrorCategory::Authentication
        ) {
            return result(
                RecoveryAction::NoRetryPermanentError,
                None,
                format!("{category} errors are not retried"),
            );
        }
        if envelope.retry_count >= MAX_RECOVERY_ATTEMPTS {
            return result(
                RecoveryAction::MaxRetriesExceeded,
                None,
                format!("already retried {} times", envelope.retry_count),
            );
        }
        let Value::Object(original) = &envelope.original_message else {
            return result(
                RecoveryAction::NoRecoveryStrategy,
                None,
                "original message is not an object".to_string(),
            );
        };
        if document_id.is_none() {
            return result(
                RecoveryAction::NoRecoveryStrategy,
                None,
                "original message has no document_id".to_string(),
            );
        }

        let Some(stage) = resolve_stage(envelope) else {
            return result(
                RecoveryAction::UnknownStage,
                None,
                format!("cannot route context '{}'", envelope.error.context),
            );
        };
        let Some(queue) = self.config.stage_queue(stage) else {
            return result(
                RecoveryAction::QueueNotConfigured,
                Some(stage),
                format!("no queue configured for {stage}"),
            );
        };

        let mut requeued = original.clone();
        requeued.insert("recovery_attempt".to_string(), Value::Bool(true));
        requeued.insert(
            "recovery_timestamp".to_string(),
            Value::from(format_iso8601(&now_utc())),
        );
        requeued.insert(
            "original_error".to_string(),
            serde_json::to_value(&envelope.error).unwrap_or(Value::Null),
        );
        requeued.insert("retry_count".to_string(), Value::from(envelope.retry_count));

        match self.publisher.publish(queue, &Value::Object(requeued)).await {
            Ok(()) => result(
                RecoveryAction::RequeuedForProcessing,
                Some(stage),
                format!("requeued to {stage}"),
            ),
            Err(err) => result(
                RecoveryAction::RecoveryFailed,
                Some(stage),
                format!("requeue failed: {err}"),
            ),
        }
    }

    async fn notify(&self, envelope: &DeadLetterMessage, result: &RecoveryResult) {
        let Some(document_id) = result.document_id.as_deref() else {
            return;
        };
        let (event, message) = if result.action.is_recovered() {
            (
                NotificationEvent::ProcessingRecovered,
                format!("Processing recovered for document {document_id}"),
            )
        } else {
            (
                NotificationEvent::ProcessingFailedPermanently,
                format!(
                    "Processing failed permanently for document {document_id}: {}",
                    result.reason
                ),
            )
        };
        let note = NotificationMessage::new(document_id, event, message, SOURCE, &now_utc())
            .with_metadata_entry("recovery_action", result.action.as_str())
            .with_metadata_entry("error_category", envelope.error.category.as_str())
            .with_metadata_entry("retry_count", envelope.retry_count);
        if let Err(err) = self.notifier.notify(&note).await {
            warn!(error = %err, "Failed to send notification");
        }
    }
}

/// The stage to requeue to: the original trigger's stage label if it has
/// one, else the `<stage>_processing` context prefix. Only stages with an
/// input queue of their own qualify.
fn resolve_stage(envelope: &DeadLetterMessage) -> Option<ProcessingStage> {
    let from_label = envelope
        .original_message
        .get("stage")
        .and_then(Value::as_str)
        .and_then(ProcessingStage::from_trigger_label);
    let from_context = || {
        envelope
            .error
            .context
            .strip_suffix("_processing")
            .and_then(|prefix| prefix.parse::<ProcessingStage>().ok())
    };
    from_label.or_else(from_context).filter(|stage| {
        matches!(
            stage,
            ProcessingStage::Analysis | ProcessingStage::Planning | ProcessingStage::Reporting
        )
    })
}
