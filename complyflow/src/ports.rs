//! Collaborator contracts.
//!
//! Storage, queues, notification delivery, and text generation live outside
//! this crate; the orchestrator and planner only see these traits.

use crate::errors::ComplyflowError;
use crate::messages::NotificationMessage;
use crate::models::{Obligation, ProcessingStage, ProcessingStatusRecord, StatusUpdate, Task};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, Level};

/// Read access to extracted obligations.
#[async_trait]
pub trait ObligationStore: Send + Sync {
    /// Lists every obligation extracted from `document_id`.
    async fn list_obligations(&self, document_id: &str) -> Result<Vec<Obligation>, ComplyflowError>;
}

/// Write access to generated tasks.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Writes `tasks` and returns how many were stored.
    ///
    /// Writes are upserts keyed by task id. A partial write returns a count
    /// below `tasks.len()` rather than an error.
    async fn batch_create(&self, tasks: &[Task]) -> Result<usize, ComplyflowError>;
}

/// Processing status records.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Returns every record for `document_id`.
    async fn get(&self, document_id: &str) -> Result<Vec<ProcessingStatusRecord>, ComplyflowError>;

    /// Creates a record; fails with `Conflict` if one already exists for the
    /// same document and stage.
    async fn create(&self, record: ProcessingStatusRecord) -> Result<(), ComplyflowError>;

    /// Updates the record for `(document_id, stage)` in place.
    ///
    /// Fails with `Conflict` when `update.expected_status` is set and does not
    /// match the stored status, and with `Store` when no record exists.
    async fn update(
        &self,
        document_id: &str,
        stage: ProcessingStage,
        update: StatusUpdate,
    ) -> Result<ProcessingStatusRecord, ComplyflowError>;
}

/// External text-generation capability.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Returns the completion for `prompt`.
    async fn generate(&self, prompt: &str) -> Result<String, ComplyflowError>;
}

/// Fire-and-forget queue publishing, used for next-stage triggers and
/// dead-letter envelopes.
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    /// Publishes `body` to `queue`.
    async fn publish(&self, queue: &str, body: &Value) -> Result<(), ComplyflowError>;
}

/// Notification delivery.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Delivers `notification`.
    async fn notify(&self, notification: &NotificationMessage) -> Result<(), ComplyflowError>;
}

/// Notification sink that writes to the log instead of a topic.
#[derive(Debug, Clone)]
pub struct LoggingNotificationSink {
    level: Level,
}

impl Default for LoggingNotificationSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingNotificationSink {
    /// Creates a sink logging at `level`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }
}

#[async_trait]
impl NotificationSink for LoggingNotificationSink {
    async fn notify(&self, notification: &NotificationMessage) -> Result<(), ComplyflowError> {
        if self.level == Level::DEBUG {
            debug!(
                document_id = %notification.document_id,
                event_type = %notification.event_type,
                source = %notification.source,
                "Notification: {}", notification.message
            );
        } else {
            info!(
                document_id = %notification.document_id,
                event_type = %notification.event_type,
                source = %notification.source,
                "Notification: {}", notification.message
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::NotificationEvent;
    use crate::utils::now_utc;

    #[tokio::test]
    async fn test_logging_sink_never_fails() {
        let sink = LoggingNotificationSink::new(Level::DEBUG);
        let note = NotificationMessage::new(
            "doc_1",
            NotificationEvent::PlanningFailed,
            "Planning failed",
            "planner_agent",
            &now_utc(),
        );
        tokio_test::assert_ok!(sink.notify(&note).await);
        tokio_test::assert_ok!(LoggingNotificationSink::default().notify(&note).await);
    }
}
