//! Status-record bookkeeping for stage attempts.

use crate::errors::ComplyflowError;
use crate::messages::StageTrigger;
use crate::models::{ProcessingStage, ProcessingStatus, ProcessingStatusRecord, StatusUpdate};
use crate::ports::StatusStore;
use crate::utils::Timestamp;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Result of trying to start a stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginOutcome {
    /// This invocation owns the attempt.
    Started {
        /// Attempt number, 1 for the first run of the stage.
        attempt: u64,
        /// True when re-entering after a failed or stuck attempt.
        redrive: bool,
    },
    /// Another attempt is in flight and not yet stale.
    AlreadyActive,
    /// The same trigger already completed the stage.
    Duplicate,
}

/// Reads and writes the per-stage status records for the orchestrator.
///
/// Every write after creation is conditional on the status the tracker last
/// saw, so two invocations racing on the same trigger cannot both claim the
/// attempt.
#[derive(Clone)]
pub struct StatusTracker {
    store: Arc<dyn StatusStore>,
}

impl std::fmt::Debug for StatusTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusTracker").finish_non_exhaustive()
    }
}

impl StatusTracker {
    /// Creates a tracker over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self { store }
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.store
    }

    /// Claims a stage attempt for `trigger`.
    ///
    /// Creates the record if absent. Re-enters a `failed` record, or an
    /// in-flight one older than `stale_after`, as a redrive with the attempt
    /// counter bumped. A `completed` record written under the same
    /// idempotency key makes the trigger a duplicate.
    pub async fn begin(
        &self,
        trigger: &StageTrigger,
        stage: ProcessingStage,
        source: &str,
        now: Timestamp,
        stale_after: Duration,
    ) -> Result<BeginOutcome, ComplyflowError> {
        let document_id = trigger.document_id.trim();
        let key = trigger.idempotency_key(stage);
        let existing = self
            .store
            .get(document_id)
            .await?
            .into_iter()
            .find(|record| record.stage == stage);

        let Some(record) = existing else {
            let record =
                ProcessingStatusRecord::new(document_id, stage, ProcessingStatus::Processing, now)?
                    .with_metadata(attempt_metadata(source, 1, &key, false));
            return match self.store.create(record).await {
                Ok(()) => Ok(BeginOutcome::Started {
                    attempt: 1,
                    redrive: false,
                }),
                Err(ComplyflowError::Conflict(_)) => Ok(BeginOutcome::AlreadyActive),
                Err(err) => Err(err),
            };
        };

        if record.status == ProcessingStatus::Completed
            && record.idempotency_key() == Some(key.as_str())
        {
            debug!(document_id, %stage, "Trigger already completed this stage");
            return Ok(BeginOutcome::Duplicate);
        }
        if record.status.is_active() && age(&record, now) <= stale_after {
            return Ok(BeginOutcome::AlreadyActive);
        }

        let redrive = record.status == ProcessingStatus::Failed || record.status.is_active();
        let attempt = record.attempt() + 1;
        if redrive {
            info!(
                document_id,
                %stage,
                attempt,
                previous_status = %record.status,
                "Re-entering stage after failed attempt"
            );
        }

        let update = StatusUpdate::new(ProcessingStatus::Processing)
            .restarted_at(now)
            .expecting(record.status)
            .with_metadata(attempt_metadata(source, attempt, &key, redrive));
        match self.store.update(document_id, stage, update).await {
            Ok(_) => Ok(BeginOutcome::Started { attempt, redrive }),
            Err(ComplyflowError::Conflict(_)) => Ok(BeginOutcome::AlreadyActive),
            Err(err) => Err(err),
        }
    }

    /// Marks the attempt completed and merges `metadata`.
    pub async fn complete(
        &self,
        document_id: &str,
        stage: ProcessingStage,
        metadata: Map<String, Value>,
    ) -> Result<ProcessingStatusRecord, ComplyflowError> {
        let update = StatusUpdate::new(ProcessingStatus::Completed)
            .expecting(ProcessingStatus::Processing)
            .with_metadata(metadata);
        self.store.update(document_id, stage, update).await
    }

    /// Marks the attempt failed with a human-readable `message`.
    pub async fn fail(
        &self,
        document_id: &str,
        stage: ProcessingStage,
        message: &str,
        metadata: Map<String, Value>,
    ) -> Result<ProcessingStatusRecord, ComplyflowError> {
        let update = StatusUpdate::new(ProcessingStatus::Failed)
            .expecting(ProcessingStatus::Processing)
            .with_error(message)
            .with_metadata(metadata);
        self.store.update(document_id, stage, update).await
    }

    /// Returns the record describing where `document_id` currently is: the
    /// latest in-flight or failed record by start time, else the latest
    /// completed one.
    pub async fn current_stage(
        &self,
        document_id: &str,
    ) -> Result<Option<ProcessingStatusRecord>, ComplyflowError> {
        let records = self.store.get(document_id).await?;
        let latest = |completed: bool| {
            records
                .iter()
                .filter(|r| (r.status == ProcessingStatus::Completed) == completed)
                .filter(|r| {
                    completed || r.status.is_active() || r.status == ProcessingStatus::Failed
                })
                .max_by_key(|r| (r.started_at, r.stage))
                .cloned()
        };
        Ok(latest(false).or_else(|| latest(true)))
    }
}

/// Age of the current attempt; a start time in the future counts as zero.
pub(crate) fn age(record: &ProcessingStatusRecord, now: Timestamp) -> Duration {
    (now - record.started_at).to_std().unwrap_or(Duration::ZERO)
}

fn attempt_metadata(source: &str, attempt: u64, key: &str, redrive: bool) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("started_by".to_string(), Value::from(source));
    metadata.insert("attempt".to_string(), Value::from(attempt));
    metadata.insert("idempotency_key".to_string(), Value::from(key));
    metadata.insert("redrive".to_string(), Value::from(redrive));
    metadata
}
