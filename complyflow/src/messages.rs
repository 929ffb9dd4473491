//! Wire messages: stage triggers, dead-letter envelopes, notifications.

use crate::errors::{sanitize_message, Fault};
use crate::models::ProcessingStage;
use crate::resilience::{Classify, ErrorCategory};
use crate::utils::{format_iso8601, idempotency_key, parse_iso8601, Timestamp};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Longest error message carried in a dead-letter envelope.
pub const DEAD_LETTER_MESSAGE_LIMIT: usize = 1000;

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// A queue message asking a stage to process one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTrigger {
    /// Document to process.
    pub document_id: String,
    /// Stage label set by the producer, e.g. `planning` or
    /// `planning_completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Producer timestamp, kept verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Producer name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Times this message has been through the dead-letter channel.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_count: u32,
    /// Stage-specific fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StageTrigger {
    /// Creates a trigger for `document_id`.
    #[must_use]
    pub fn new(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            stage: None,
            timestamp: None,
            source: None,
            retry_count: 0,
            extra: Map::new(),
        }
    }

    /// Parses a queue body; a missing or blank `document_id` is a
    /// validation fault.
    pub fn parse(body: &Value) -> Result<Self, Fault> {
        let trigger: Self = serde_json::from_value(body.clone())
            .map_err(|e| Fault::validation(format!("Malformed stage trigger: {e}")))?;
        if trigger.document_id.trim().is_empty() {
            return Err(Fault::validation("No document_id found in message"));
        }
        Ok(trigger)
    }

    /// Sets the stage label.
    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Sets the producer timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: &Timestamp) -> Self {
        self.timestamp = Some(format_iso8601(timestamp));
        self
    }

    /// Sets the producer name.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Adds a stage-specific field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Parses the producer timestamp, if present and well-formed.
    #[must_use]
    pub fn parsed_timestamp(&self) -> Option<Timestamp> {
        self.timestamp.as_deref().and_then(|ts| parse_iso8601(ts).ok())
    }

    /// Returns true for messages requeued by dead-letter recovery.
    #[must_use]
    pub fn is_recovery_attempt(&self) -> bool {
        self.extra
            .get("recovery_attempt")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Idempotency key for this trigger at `stage`.
    #[must_use]
    pub fn idempotency_key(&self, stage: ProcessingStage) -> String {
        idempotency_key(&[
            &self.document_id,
            stage.as_str(),
            self.timestamp.as_deref().unwrap_or(""),
            self.source.as_deref().unwrap_or(""),
        ])
    }

    /// Serializes to the queue body shape.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }
}

fn lenient_category<'de, D>(deserializer: D) -> Result<ErrorCategory, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw
        .and_then(|s| s.parse().ok())
        .unwrap_or(ErrorCategory::Unknown))
}

fn unknown_category() -> ErrorCategory {
    ErrorCategory::Unknown
}

/// Failure details inside a dead-letter envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterError {
    /// Error type name.
    #[serde(rename = "type", default)]
    pub error_type: String,
    /// Error message.
    #[serde(default)]
    pub message: String,
    /// Taxonomy value; unrecognised values read as `unknown`.
    #[serde(default = "unknown_category", deserialize_with = "lenient_category")]
    pub category: ErrorCategory,
    /// When the failure was recorded.
    #[serde(default)]
    pub timestamp: String,
    /// Where the failure happened, e.g. `planning_processing`.
    #[serde(default)]
    pub context: String,
}

/// Envelope published to a dead-letter channel on terminal failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterMessage {
    /// The triggering message, verbatim.
    pub original_message: Value,
    /// Failure details.
    pub error: DeadLetterError,
    /// Previous `retry_count` of the original message plus one.
    #[serde(default)]
    pub retry_count: u32,
}

impl DeadLetterMessage {
    /// Wraps `original` with the failure that ended its processing.
    #[must_use]
    pub fn for_failure<E>(
        original: &Value,
        err: &E,
        context: impl Into<String>,
        now: &Timestamp,
    ) -> Self
    where
        E: Classify + fmt::Display,
    {
        let previous = original
            .get("retry_count")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0);
        Self {
            original_message: original.clone(),
            error: DeadLetterError {
                error_type: err.error_type(),
                message: sanitize_message(&err.to_string(), DEAD_LETTER_MESSAGE_LIMIT),
                category: err.category(),
                timestamp: format_iso8601(now),
                context: context.into(),
            },
            retry_count: previous.saturating_add(1),
        }
    }

    /// Serializes to the queue body shape.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }
}

/// Kind of notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    /// Upload accepted.
    DocumentUploaded,
    /// Upload stage failed.
    UploadFailed,
    /// Analysis finished.
    AnalysisCompleted,
    /// Analysis failed.
    AnalysisFailed,
    /// Planning finished.
    PlanningCompleted,
    /// Planning failed.
    PlanningFailed,
    /// Reporting finished.
    ReportingCompleted,
    /// Reporting failed.
    ReportingFailed,
    /// Whole pipeline finished.
    ProcessingCompleted,
    /// Whole pipeline failed.
    ProcessingFailed,
    /// A dead-lettered message was requeued.
    ProcessingRecovered,
    /// A dead-lettered message will not be retried.
    ProcessingFailedPermanently,
    /// A stuck stage was marked failed and redriven.
    StageTimedOut,
}

impl NotificationEvent {
    /// Returns the completion or failure event for `stage`.
    #[must_use]
    pub fn for_stage(stage: ProcessingStage, success: bool) -> Self {
        match (stage, success) {
            (ProcessingStage::Upload, true) => Self::DocumentUploaded,
            (ProcessingStage::Upload, false) => Self::UploadFailed,
            (ProcessingStage::Analysis, true) => Self::AnalysisCompleted,
            (ProcessingStage::Analysis, false) => Self::AnalysisFailed,
            (ProcessingStage::Planning, true) => Self::PlanningCompleted,
            (ProcessingStage::Planning, false) => Self::PlanningFailed,
            (ProcessingStage::Reporting, true) => Self::ReportingCompleted,
            (ProcessingStage::Reporting, false) => Self::ReportingFailed,
            (ProcessingStage::Completed, true) => Self::ProcessingCompleted,
            (ProcessingStage::Completed, false) => Self::ProcessingFailed,
        }
    }

    /// Returns the wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DocumentUploaded => "document_uploaded",
            Self::UploadFailed => "upload_failed",
            Self::AnalysisCompleted => "analysis_completed",
            Self::AnalysisFailed => "analysis_failed",
            Self::PlanningCompleted => "planning_completed",
            Self::PlanningFailed => "planning_failed",
            Self::ReportingCompleted => "reporting_completed",
            Self::ReportingFailed => "reporting_failed",
            Self::ProcessingCompleted => "processing_completed",
            Self::ProcessingFailed => "processing_failed",
            Self::ProcessingRecovered => "processing_recovered",
            Self::ProcessingFailedPermanently => "processing_failed_permanently",
            Self::StageTimedOut => "stage_timed_out",
        }
    }
}

impl fmt::Display for NotificationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A success or failure notification. Carries counts, never payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    /// Document the event concerns.
    pub document_id: String,
    /// Event kind.
    pub event_type: NotificationEvent,
    /// Human-readable summary.
    pub message: String,
    /// When the event happened.
    pub timestamp: String,
    /// Component that emitted the event.
    pub source: String,
    /// Small summary values.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl NotificationMessage {
    /// Creates a notification.
    #[must_use]
    pub fn new(
        document_id: impl Into<String>,
        event_type: NotificationEvent,
        message: impl Into<String>,
        source: impl Into<String>,
        now: &Timestamp,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            event_type,
            message: message.into(),
            timestamp: format_iso8601(now),
            source: source.into(),
            metadata: Map::new(),
        }
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ComplyflowError;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn now() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 2, 10, 8, 30, 0).unwrap()
    }

    #[test]
    fn test_parse_keeps_extra_fields() {
        let body = json!({
            "document_id": "doc_1",
            "stage": "planning_completed",
            "tasks_generated": 12,
            "timestamp": "2024-02-10T08:00:00",
            "source": "planner_agent"
        });
        let trigger = StageTrigger::parse(&body).unwrap();
        assert_eq!(trigger.stage.as_deref(), Some("planning_completed"));
        assert_eq!(trigger.extra["tasks_generated"], 12);
        assert_eq!(trigger.retry_count, 0);
        assert!(trigger.parsed_timestamp().is_some());
        assert_eq!(trigger.to_value(), body);
    }

    #[test]
    fn test_parse_requires_document_id() {
        let err = StageTrigger::parse(&json!({"stage": "planning"})).unwrap_err();
        assert_eq!(err.category, ErrorCategory::Validation);
        let err = StageTrigger::parse(&json!({"document_id": " "})).unwrap_err();
        assert_eq!(err.category, ErrorCategory::Validation);
    }

    #[test]
    fn test_idempotency_key_depends_on_timestamp_and_source() {
        let a = StageTrigger::new("doc_1").with_timestamp(&now()).with_source("analyzer");
        let b = a.clone();
        let c = StageTrigger::new("doc_1").with_source("analyzer");
        assert_eq!(
            a.idempotency_key(ProcessingStage::Planning),
            b.idempotency_key(ProcessingStage::Planning)
        );
        assert_ne!(
            a.idempotency_key(ProcessingStage::Planning),
            c.idempotency_key(ProcessingStage::Planning)
        );
        assert_ne!(
            a.idempotency_key(ProcessingStage::Planning),
            a.idempotency_key(ProcessingStage::Reporting)
        );
    }

    #[test]
    fn test_dead_letter_shape() {
        let original = json!({"document_id": "doc_1", "retry_count": 2});
        let err: ComplyflowError = Fault::validation("bad obligation payload").into();
        let dlq = DeadLetterMessage::for_failure(&original, &err, "planning_processing", &now());

        assert_eq!(dlq.retry_count, 3);
        let value = dlq.to_value();
        assert_eq!(value["original_message"], original);
        assert_eq!(value["error"]["type"], "Fault");
        assert_eq!(value["error"]["category"], "validation");
        assert_eq!(value["error"]["context"], "planning_processing");
        assert_eq!(value["error"]["timestamp"], "2024-02-10T08:30:00.000000+00:00");
    }

    #[test]
    fn test_dead_letter_reads_unknown_category() {
        let body = json!({
            "original_message": {"document_id": "doc_1"},
            "error": {"type": "Boom", "message": "x", "category": "cosmic_rays"},
            "retry_count": 1
        });
        let dlq: DeadLetterMessage = serde_json::from_value(body).unwrap();
        assert_eq!(dlq.error.category, ErrorCategory::Unknown);
    }

    #[test]
    fn test_notification_events_per_stage() {
        assert_eq!(
            NotificationEvent::for_stage(ProcessingStage::Planning, true),
            NotificationEvent::PlanningCompleted
        );
        assert_eq!(
            NotificationEvent::for_stage(ProcessingStage::Analysis, false),
            NotificationEvent::AnalysisFailed
        );
        let note = NotificationMessage::new(
            "doc_1",
            NotificationEvent::PlanningCompleted,
            "done",
            "planner_agent",
            &now(),
        )
        .with_metadata_entry("tasks_generated", 4);
        let value = serde_json::to_value(&note).unwrap();
        assert_eq!(value["event_type"], "planning_completed");
        assert_eq!(value["metadata"]["tasks_generated"], 4);
    }
}
