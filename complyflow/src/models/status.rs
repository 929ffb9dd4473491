//! Pipeline stages and processing status records.

use crate::errors::Fault;
use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// A named phase of document processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    /// File received and validated.
    Upload,
    /// Obligations extracted.
    Analysis,
    /// Tasks generated.
    Planning,
    /// Report produced.
    Reporting,
    /// Terminal marker stage.
    Completed,
}

impl ProcessingStage {
    /// Every stage in pipeline order.
    pub const ALL: [Self; 5] = [
        Self::Upload,
        Self::Analysis,
        Self::Planning,
        Self::Reporting,
        Self::Completed,
    ];

    /// Returns the wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Analysis => "analysis",
            Self::Planning => "planning",
            Self::Reporting => "reporting",
            Self::Completed => "completed",
        }
    }

    /// Returns the stage triggered after this one completes.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Upload => Some(Self::Analysis),
            Self::Analysis => Some(Self::Planning),
            Self::Planning => Some(Self::Reporting),
            Self::Reporting => Some(Self::Completed),
            Self::Completed => None,
        }
    }

    /// Returns the label producers put in the `stage` field of the trigger
    /// they send after this stage completes, e.g. `planning_completed`.
    #[must_use]
    pub fn completion_label(self) -> String {
        format!("{}_completed", self.as_str())
    }

    /// Resolves an incoming `stage` label to the stage it triggers.
    ///
    /// `analysis_completed` triggers planning; a bare stage name triggers
    /// that stage.
    #[must_use]
    pub fn from_trigger_label(label: &str) -> Option<Self> {
        match label.strip_suffix("_completed") {
            Some(prefix) => prefix.parse::<Self>().ok().and_then(Self::next),
            None => label.parse().ok(),
        }
    }
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStage {
    type Err = Fault;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| {
                Fault::validation(format!(
                    "Stage must be one of: upload, analysis, planning, reporting, completed (got '{s}')"
                ))
            })
    }
}

/// Status of a document-stage pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    /// Upload accepted.
    Uploaded,
    /// Generic in-flight marker.
    Processing,
    /// Analysis in flight.
    Analyzing,
    /// Planning in flight.
    Planning,
    /// Reporting in flight.
    Reporting,
    /// Stage finished.
    Completed,
    /// Stage attempt failed.
    Failed,
}

impl ProcessingStatus {
    /// Returns true for statuses that mean an attempt is running.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Processing | Self::Analyzing | Self::Planning | Self::Reporting
        )
    }

    /// Returns true for `completed` and `failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl Default for ProcessingStatus {
    fn default() -> Self {
        Self::Processing
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uploaded => "uploaded",
            Self::Processing => "processing",
            Self::Analyzing => "analyzing",
            Self::Planning => "planning",
            Self::Reporting => "reporting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One row per (document, stage). Never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStatusRecord {
    /// Document identifier.
    pub document_id: String,
    /// Stage the record tracks.
    pub stage: ProcessingStage,
    /// Current status.
    pub status: ProcessingStatus,
    /// When the current attempt started.
    pub started_at: Timestamp,
    /// When the stage completed.
    #[serde(default)]
    pub completed_at: Option<Timestamp>,
    /// Human-readable failure message.
    #[serde(default)]
    pub error_message: Option<String>,
    /// Free-form stage metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Last write time.
    pub updated_timestamp: Timestamp,
}

impl ProcessingStatusRecord {
    /// Creates a validated record.
    pub fn new(
        document_id: impl Into<String>,
        stage: ProcessingStage,
        status: ProcessingStatus,
        started_at: Timestamp,
    ) -> Result<Self, Fault> {
        let mut record = Self {
            document_id: document_id.into().trim().to_string(),
            stage,
            status,
            started_at,
            completed_at: None,
            error_message: None,
            metadata: Map::new(),
            updated_timestamp: started_at,
        };
        record.normalize(started_at);
        record.validate()?;
        Ok(record)
    }

    /// Sets the metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Checks the record invariants.
    pub fn validate(&self) -> Result<(), Fault> {
        if self.document_id.trim().is_empty() {
            return Err(Fault::validation("Document ID cannot be empty"));
        }
        if let Some(completed_at) = self.completed_at {
            if completed_at < self.started_at {
                return Err(Fault::validation("Completion time cannot be before start time"));
            }
        }
        if self.status == ProcessingStatus::Completed && self.completed_at.is_none() {
            return Err(Fault::validation("Completed record has no completion time"));
        }
        Ok(())
    }

    /// Assigns a completion time to a completed record that lacks one.
    pub fn normalize(&mut self, now: Timestamp) {
        if self.status == ProcessingStatus::Completed && self.completed_at.is_none() {
            self.completed_at = Some(now.max(self.started_at));
        }
    }

    /// Applies an update in place and re-validates.
    pub fn apply(&mut self, update: &StatusUpdate, now: Timestamp) -> Result<(), Fault> {
        self.status = update.status;
        if let Some(message) = &update.error_message {
            self.error_message = Some(message.clone());
        }
        if let Some(started_at) = update.started_at {
            self.started_at = started_at;
            self.completed_at = None;
            self.error_message = update.error_message.clone();
        }
        for (key, value) in &update.metadata {
            self.metadata.insert(key.clone(), value.clone());
        }
        self.updated_timestamp = now;
        self.normalize(now);
        self.validate()
    }

    /// Returns the `attempt` counter from metadata, defaulting to 1.
    #[must_use]
    pub fn attempt(&self) -> u64 {
        self.metadata
            .get("attempt")
            .and_then(Value::as_u64)
            .unwrap_or(1)
    }

    /// Returns the idempotency key stored by the attempt that wrote this
    /// record.
    #[must_use]
    pub fn idempotency_key(&self) -> Option<&str> {
        self.metadata.get("idempotency_key").and_then(Value::as_str)
    }
}

/// Partial update of a status record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// New status.
    pub status: ProcessingStatus,
    /// Failure message to record.
    #[serde(default)]
    pub error_message: Option<String>,
    /// Keys merged into the existing metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Restarts the attempt clock; clears completion and error fields.
    #[serde(default)]
    pub started_at: Option<Timestamp>,
    /// Conditional write: only apply if the stored status matches.
    #[serde(default)]
    pub expected_status: Option<ProcessingStatus>,
}

impl StatusUpdate {
    /// Creates an update to `status`.
    #[must_use]
    pub fn new(status: ProcessingStatus) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    /// Sets the error message.
    #[must_use]
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Merges one metadata entry.
    #[must_use]
    pub fn with_metadata_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Merges metadata entries.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    /// Restarts the attempt at `started_at`.
    #[must_use]
    pub fn restarted_at(mut self, started_at: Timestamp) -> Self {
        self.started_at = Some(started_at);
        self
    }

    /// Makes the write conditional on the stored status.
    #[must_use]
    pub fn expecting(mut self, status: ProcessingStatus) -> Self {
        self.expected_status = Some(status);
        self
    }
}
