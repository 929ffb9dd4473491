//! In-memory stores.

use crate::errors::{ComplyflowError, Fault};
use crate::models::{Obligation, ProcessingStage, ProcessingStatusRecord, StatusUpdate, Task};
use crate::ports::{ObligationStore, StatusStore, TaskStore};
use crate::utils::now_utc;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Status store backed by a map keyed by `(document_id, stage)`.
#[derive(Debug, Default)]
pub struct InMemoryStatusStore {
    records: Mutex<BTreeMap<(String, ProcessingStage), ProcessingStatusRecord>>,
    writes: Mutex<usize>,
}

impl InMemoryStatusStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a record directly, bypassing conflict checks.
    pub fn seed(&self, record: ProcessingStatusRecord) {
        self.records
            .lock()
            .insert((record.document_id.clone(), record.stage), record);
    }

    /// Returns the record for `(document_id, stage)`.
    #[must_use]
    pub fn record(
        &self,
        document_id: &str,
        stage: ProcessingStage,
    ) -> Option<ProcessingStatusRecord> {
        self.records
            .lock()
            .get(&(document_id.to_string(), stage))
            .cloned()
    }

    /// Returns the number of successful writes.
    #[must_use]
    pub fn write_count(&self) -> usize {
        *self.writes.lock()
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn get(&self, document_id: &str) -> Result<Vec<ProcessingStatusRecord>, ComplyflowError> {
        Ok(self
            .records
            .lock()
            .values()
            .filter(|r| r.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn create(&self, record: ProcessingStatusRecord) -> Result<(), ComplyflowError> {
        record.validate()?;
        let mut records = self.records.lock();
        let key = (record.document_id.clone(), record.stage);
        if records.contains_key(&key) {
            return Err(ComplyflowError::Conflict(format!(
                "status record for {} at {} already exists",
                key.0, key.1
            )));
        }
        records.insert(key, record);
        *self.writes.lock() += 1;
        Ok(())
    }

    async fn update(
        &self,
        document_id: &str,
        stage: ProcessingStage,
        update: StatusUpdate,
    ) -> Result<ProcessingStatusRecord, ComplyflowError> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(&(document_id.to_string(), stage))
            .ok_or_else(|| {
                ComplyflowError::store(format!("no status record for {document_id} at {stage}"))
            })?;

        if let Some(expected) = update.expected_status {
            if record.status != expected {
                return Err(ComplyflowError::Conflict(format!(
                    "expected {expected} for {document_id} at {stage}, found {}",
                    record.status
                )));
            }
        }

        let mut next = record.clone();
        next.apply(&update, now_utc())?;
        *record = next.clone();
        *self.writes.lock() += 1;
        Ok(next)
    }
}

/// Obligation store with optional scripted failures.
#[derive(Debug, Default)]
pub struct InMemoryObligationStore {
    obligations: Mutex<HashMap<String, Vec<Obligation>>>,
    failures: Mutex<VecDeque<Fault>>,
    calls: Mutex<usize>,
}

impl InMemoryObligationStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an obligation under its document.
    pub fn insert(&self, obligation: Obligation) {
        self.obligations
            .lock()
            .entry(obligation.document_id.clone())
            .or_default()
            .push(obligation);
    }

    /// Makes the next call fail with `fault`. Queued failures are returned
    /// in order before any success.
    pub fn push_failure(&self, fault: Fault) {
        self.failures.lock().push_back(fault);
    }

    /// Returns how many times `list_obligations` was called.
    #[must_use]
    pub fn call_count(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl ObligationStore for InMemoryObligationStore {
    async fn list_obligations(
        &self,
        document_id: &str,
    ) -> Result<Vec<Obligation>, ComplyflowError> {
        *self.calls.lock() += 1;
        if let Some(fault) = self.failures.lock().pop_front() {
            return Err(fault.into());
        }
        Ok(self
            .obligations
            .lock()
            .get(document_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Task store that upserts by task id, with optional scripted failures.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<BTreeMap<String, Task>>,
    write_limit: Mutex<Option<usize>>,
    failures: Mutex<VecDeque<Fault>>,
}

impl InMemoryTaskStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores at most `limit` tasks per `batch_create` call.
    pub fn limit_writes(&self, limit: usize) {
        *self.write_limit.lock() = Some(limit);
    }

    /// Makes the next `batch_create` fail with `fault` before writing
    /// anything.
    pub fn push_failure(&self, fault: Fault) {
        self.failures.lock().push_back(fault);
    }

    /// Returns every stored task, ordered by id.
    #[must_use]
    pub fn all(&self) -> Vec<Task> {
        self.tasks.lock().values().cloned().collect()
    }

    /// Returns the number of stored tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn batch_create(&self, tasks: &[Task]) -> Result<usize, ComplyflowError> {
        if let Some(fault) = self.failures.lock().pop_front() {
            return Err(fault.into());
        }
        let limit = self.write_limit.lock().unwrap_or(usize::MAX);
        let mut stored = self.tasks.lock();
        let mut written = 0;
        for task in tasks.iter().take(limit) {
            stored.insert(task.task_id.clone(), task.clone());
            written += 1;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProcessingStatus, TaskPriority};

    #[tokio::test]
    async fn test_status_create_conflicts_on_duplicate() {
        let store = InMemoryStatusStore::new();
        let record = ProcessingStatusRecord::new(
            "doc_1",
            ProcessingStage::Planning,
            ProcessingStatus::Processing,
            now_utc(),
        )
        .unwrap();
        store.create(record.clone()).await.unwrap();
        let err = store.create(record).await.unwrap_err();
        assert!(matches!(err, ComplyflowError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_conditional_update() {
        let store = InMemoryStatusStore::new();
        store
            .create(
                ProcessingStatusRecord::new(
                    "doc_1",
                    ProcessingStage::Planning,
                    ProcessingStatus::Processing,
                    now_utc(),
                )
                .unwrap(),
            )
            .await
            .unwrap();

        let stale =
            StatusUpdate::new(ProcessingStatus::Completed).expecting(ProcessingStatus::Failed);
        assert!(matches!(
            store.update("doc_1", ProcessingStage::Planning, stale).await,
            Err(ComplyflowError::Conflict(_))
        ));

        let ok =
            StatusUpdate::new(ProcessingStatus::Completed).expecting(ProcessingStatus::Processing);
        let record = store.update("doc_1", ProcessingStage::Planning, ok).await.unwrap();
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_update_missing_record_is_store_error() {
        let store = InMemoryStatusStore::new();
        let result = store
            .update("doc_x", ProcessingStage::Analysis, StatusUpdate::new(ProcessingStatus::Failed))
            .await;
        assert!(matches!(result, Err(ComplyflowError::Store(_))));
    }

    #[tokio::test]
    async fn test_task_store_upserts_and_limits() {
        let store = InMemoryTaskStore::new();
        let now = now_utc();
        let tasks: Vec<Task> = (0..3)
            .map(|i| Task::new(format!("task_{i}"), "obl_1", "Title", "d", TaskPriority::Low, now))
            .collect();

        assert_eq!(store.batch_create(&tasks).await.unwrap(), 3);
        assert_eq!(store.batch_create(&tasks).await.unwrap(), 3);
        assert_eq!(store.len(), 3);

        store.limit_writes(1);
        assert_eq!(store.batch_create(&tasks).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_obligation_store_scripted_failure() {
        let store = InMemoryObligationStore::new();
        store.push_failure(Fault::transient("table busy"));
        assert!(store.list_obligations("doc_1").await.is_err());
        assert!(store.list_obligations("doc_1").await.unwrap().is_empty());
        assert_eq!(store.call_count(), 2);
    }
}
