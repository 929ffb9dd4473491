//! Sweeps status records stuck in flight after a worker died mid-stage.

use super::tracker::age;
use crate::config::PipelineConfig;
use crate::errors::ComplyflowError;
use crate::messages::{NotificationEvent, NotificationMessage, StageTrigger};
use crate::models::{ProcessingStage, ProcessingStatus, StatusUpdate};
use crate::ports::{NotificationSink, QueuePublisher, StatusStore};
use crate::utils::{format_iso8601, Timestamp};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Error message written to records the reconciler fails.
pub const TIMED_OUT_MESSAGE: &str = "stage timed out";

const SOURCE: &str = "stale_reconciler";

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Records inspected.
    pub scanned: usize,
    /// `(document_id, stage)` pairs marked failed.
    pub timed_out: Vec<(String, ProcessingStage)>,
    /// Timed-out stages whose trigger was republished.
    pub redriven: usize,
    /// Timed-out stages with no queue to republish to.
    pub unroutable: usize,
    /// Documents or records the sweep could not read or write.
    pub errors: usize,
}

/// Marks in-flight records older than the stage's staleness threshold as
/// failed and redrives them through the stage queue.
pub struct StaleRecordReconciler {
    store: Arc<dyn StatusStore>,
    publisher: Arc<dyn QueuePublisher>,
    notifier: Arc<dyn NotificationSink>,
    config: Arc<PipelineConfig>,
}

impl std::fmt::Debug for StaleRecordReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaleRecordReconciler").finish_non_exhaustive()
    }
}

impl StaleRecordReconciler {
    /// Creates a reconciler.
    #[must_use]
    pub fn new(
        store: Arc<dyn StatusStore>,
        publisher: Arc<dyn QueuePublisher>,
        notifier: Arc<dyn NotificationSink>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            store,
            publisher,
            notifier,
            config,
        }
    }

    /// Sweeps the records of `document_ids` as of `now`.
    pub async fn sweep(&self, document_ids: &[String], now: Timestamp) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for document_id in document_ids {
            let records = match self.store.get(document_id).await {
                Ok(records) => records,
                Err(err) => {
                    error!(%document_id, error = %err, "Failed to read status records");
                    report.errors += 1;
                    continue;
                }
            };

            for record in records {
                report.scanned += 1;
                let stale_after = self.config.stale_after(record.stage);
                if !record.status.is_active() || age(&record, now) <= stale_after {
                    continue;
                }

                match self.time_out(document_id, record.stage, record.status, now).await {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(err) => {
                        error!(
                            %document_id,
                            stage = %record.stage,
                            error = %err,
                            "Failed to time out stage"
                        );
                        report.errors += 1;
                        continue;
                    }
                }
                report.timed_out.push((document_id.clone(), record.stage));

                if self.redrive(document_id, record.stage, now).await {
                    report.redriven += 1;
                } else {
                    report.unroutable += 1;
                }
            }
        }

        if !report.timed_out.is_empty() {
            info!(
                scanned = report.scanned,
                timed_out = report.timed_out.len(),
                redriven = report.redriven,
                "Stale record sweep finished"
            );
        }
        report
    }

    /// Returns false when the record moved on before the write landed.
    async fn time_out(
        &self,
        document_id: &str,
        stage: ProcessingStage,
        seen: ProcessingStatus,
        now: Timestamp,
    ) -> Result<bool, ComplyflowError> {
        let update = StatusUpdate::new(ProcessingStatus::Failed)
            .expecting(seen)
            .with_error(TIMED_OUT_MESSAGE)
            .with_metadata_entry("timed_out", true)
            .with_metadata_entry("reconciled_at", format_iso8601(&now));
        match self.store.update(document_id, stage, update).await {
            Ok(_) => {
                warn!(document_id, %stage, "Marked stuck stage as timed out");
                Ok(true)
            }
            Err(ComplyflowError::Conflict(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn redrive(&self, document_id: &str, stage: ProcessingStage, now: Timestamp) -> bool {
        let Some(queue) = self.config.stage_queue(stage) else {
            warn!(document_id, %stage, "No queue configured, stuck stage not redriven");
            return false;
        };
        let trigger = StageTrigger::new(document_id)
            .with_stage(stage.as_str())
            .with_timestamp(&now)
            .with_source(SOURCE)
            .with_field("recovery_attempt", true);
        let redriven = match self.publisher.publish(queue, &trigger.to_value()).await {
            Ok(()) => true,
            Err(err) => {
                error!(document_id, %stage, queue, error = %err, "Failed to redrive stuck stage");
                false
            }
        };

        let note = NotificationMessage::new(
            document_id,
            NotificationEvent::StageTimedOut,
            format!("{stage} timed out for document {document_id}"),
            SOURCE,
            &now,
        )
        .with_metadata_entry("stage", stage.as_str())
        .with_metadata_entry("redriven", redriven);
        if let Err(err) = self.notifier.notify(&note).await {
            warn!(error = %err, "Failed to send notification");
        }
        redriven
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProcessingStatusRecord;
    use crate::testing::{InMemoryStatusStore, RecordingNotificationSink, RecordingQueuePublisher};
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn start() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    struct Fixture {
        store: Arc<InMemoryStatusStore>,
        publisher: Arc<RecordingQueuePublisher>,
        notifier: Arc<RecordingNotificationSink>,
        reconciler: StaleRecordReconciler,
    }

    fn fixture(config: PipelineConfig) -> Fixture {
        let store = Arc::new(InMemoryStatusStore::new());
        let publisher = Arc::new(RecordingQueuePublisher::new());
        let notifier = Arc::new(RecordingNotificationSink::new());
        let reconciler = StaleRecordReconciler::new(
            store.clone(),
            publisher.clone(),
            notifier.clone(),
            Arc::new(config),
        );
        Fixture {
            store,
            publisher,
            notifier,
            reconciler,
        }
    }

    fn seed(
        store: &InMemoryStatusStore,
        doc: &str,
        stage: ProcessingStage,
        status: ProcessingStatus,
    ) {
        store.seed(ProcessingStatusRecord::new(doc, stage, status, start()).unwrap());
    }

    #[tokio::test]
    async fn test_stuck_record_is_failed_and_redriven() {
        let f = fixture(
            PipelineConfig::default()
                .with_stale_after(Duration::from_secs(600))
                .with_stage_queue(ProcessingStage::Planning, "planning-queue"),
        );
        seed(&f.store, "doc_1", ProcessingStage::Analysis, ProcessingStatus::Completed);
        seed(&f.store, "doc_1", ProcessingStage::Planning, ProcessingStatus::Processing);

        let now = start() + ChronoDuration::seconds(601);
        let report = f.reconciler.sweep(&["doc_1".to_string()], now).await;

        assert_eq!(report.scanned, 2);
        assert_eq!(report.timed_out, vec![("doc_1".to_string(), ProcessingStage::Planning)]);
        assert_eq!(report.redriven, 1);

        let record = f.store.record("doc_1", ProcessingStage::Planning).unwrap();
        assert_eq!(record.status, ProcessingStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some(TIMED_OUT_MESSAGE));

        let sent = f.publisher.messages("planning-queue");
        assert_eq!(sent.len(), 1);
        let trigger = StageTrigger::parse(&sent[0]).unwrap();
        assert_eq!(trigger.stage.as_deref(), Some("planning"));
        assert!(trigger.is_recovery_attempt());
        assert_eq!(f.notifier.events(), vec![NotificationEvent::StageTimedOut]);
    }

    #[tokio::test]
    async fn test_fresh_record_is_left_alone() {
        let f = fixture(PipelineConfig::default().with_stale_after(Duration::from_secs(600)));
        seed(&f.store, "doc_1", ProcessingStage::Planning, ProcessingStatus::Processing);

        let report = f
            .reconciler
            .sweep(&["doc_1".to_string()], start() + ChronoDuration::seconds(30))
            .await;
        assert!(report.timed_out.is_empty());
        assert_eq!(
            f.store.record("doc_1", ProcessingStage::Planning).unwrap().status,
            ProcessingStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_missing_queue_is_unroutable() {
        let f = fixture(PipelineConfig::default().with_stale_after(Duration::from_secs(1)));
        seed(&f.store, "doc_1", ProcessingStage::Reporting, ProcessingStatus::Processing);

        let report = f
            .reconciler
            .sweep(&["doc_1".to_string()], start() + ChronoDuration::seconds(5))
            .await;
        assert_eq!(report.timed_out.len(), 1);
        assert_eq!(report.unroutable, 1);
        assert!(f.publisher.all().is_empty());
    }
}
