//! Extracted compliance obligations.

use crate::errors::Fault;
use crate::utils::{now_utc, prefixed_id, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Obligation category; selects the task templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObligationCategory {
    /// Periodic or one-off regulatory reporting.
    Reporting,
    /// Ongoing monitoring duties.
    Monitoring,
    /// Changes to day-to-day operations.
    Operational,
    /// Capital, fees, and other financial duties.
    Financial,
}

impl ObligationCategory {
    /// Returns the wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reporting => "reporting",
            Self::Monitoring => "monitoring",
            Self::Operational => "operational",
            Self::Financial => "financial",
        }
    }
}

impl fmt::Display for ObligationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How serious non-compliance would be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObligationSeverity {
    /// Must be handled first.
    Critical,
    /// Important.
    High,
    /// Normal.
    Medium,
    /// Can wait.
    Low,
}

impl fmt::Display for ObligationSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// Deadline shape of an obligation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineType {
    /// Repeats on a schedule.
    Recurring,
    /// Happens once.
    OneTime,
    /// Continuous.
    Ongoing,
}

impl fmt::Display for DeadlineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recurring => write!(f, "recurring"),
            Self::OneTime => write!(f, "one_time"),
            Self::Ongoing => write!(f, "ongoing"),
        }
    }
}

fn default_confidence() -> f64 {
    1.0
}

/// A compliance requirement extracted from a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Obligation {
    /// Obligation identifier.
    pub obligation_id: String,
    /// Parent document.
    pub document_id: String,
    /// Requirement text.
    pub description: String,
    /// Category.
    pub category: ObligationCategory,
    /// Severity.
    pub severity: ObligationSeverity,
    /// Deadline shape.
    pub deadline_type: DeadlineType,
    /// Entities the obligation applies to.
    #[serde(default)]
    pub applicable_entities: BTreeSet<String>,
    /// Source passage.
    #[serde(default)]
    pub extracted_text: String,
    /// Extraction confidence in `[0, 1]`.
    #[serde(default = "default_confidence")]
    pub confidence_score: f64,
    /// Creation time.
    pub created_timestamp: Timestamp,
}

impl Obligation {
    /// Creates an obligation with a generated `obl_` id.
    #[must_use]
    pub fn new(
        document_id: impl Into<String>,
        description: impl Into<String>,
        category: ObligationCategory,
        severity: ObligationSeverity,
        deadline_type: DeadlineType,
    ) -> Self {
        Self {
            obligation_id: prefixed_id("obl"),
            document_id: document_id.into(),
            description: description.into(),
            category,
            severity,
            deadline_type,
            applicable_entities: BTreeSet::new(),
            extracted_text: String::new(),
            confidence_score: default_confidence(),
            created_timestamp: now_utc(),
        }
    }

    /// Sets the id.
    #[must_use]
    pub fn with_id(mut self, obligation_id: impl Into<String>) -> Self {
        self.obligation_id = obligation_id.into();
        self
    }

    /// Sets the confidence score.
    #[must_use]
    pub fn with_confidence(mut self, score: f64) -> Self {
        self.confidence_score = score;
        self
    }

    /// Adds applicable entities, dropping blanks and duplicates.
    #[must_use]
    pub fn with_entities<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.applicable_entities.extend(
            entities
                .into_iter()
                .map(|e| e.as_ref().trim().to_string())
                .filter(|e| !e.is_empty()),
        );
        self
    }

    /// Checks the fields the planner relies on.
    pub fn validate(&self) -> Result<(), Fault> {
        if self.obligation_id.trim().is_empty() {
            return Err(Fault::validation("Obligation ID cannot be empty"));
        }
        if self.description.trim().is_empty() {
            return Err(Fault::validation(format!(
                "Obligation {} has an empty description",
                self.obligation_id
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence_score) {
            return Err(Fault::validation(format!(
                "Obligation {} confidence score {} is outside [0, 1]",
                self.obligation_id, self.confidence_score
            )));
        }
        Ok(())
    }
}
