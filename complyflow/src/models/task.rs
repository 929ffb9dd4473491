//! Actionable tasks derived from obligations.

use crate::errors::Fault;
use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Task priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    /// Do first.
    High,
    /// Normal.
    Medium,
    /// Do last.
    Low,
}

impl TaskPriority {
    /// Every priority, highest first.
    pub const ALL: [Self; 3] = [Self::High, Self::Medium, Self::Low];

    /// Numeric rank; higher sorts first.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::High => 3,
            Self::Medium => 2,
            Self::Low => 1,
        }
    }

    /// Returns the wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = Fault;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(Fault::validation(format!("unknown task priority '{other}'"))),
        }
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not started.
    #[default]
    Pending,
    /// Being worked on.
    InProgress,
    /// Done.
    Completed,
    /// Past due.
    Overdue,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Overdue => write!(f, "overdue"),
        }
    }
}

/// An actionable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task identifier.
    pub task_id: String,
    /// Parent obligation.
    pub obligation_id: String,
    /// Title.
    pub title: String,
    /// Description.
    pub description: String,
    /// Priority.
    pub priority: TaskPriority,
    /// Assignee.
    #[serde(default)]
    pub assigned_to: Option<String>,
    /// Due date.
    #[serde(default)]
    pub due_date: Option<Timestamp>,
    /// Status.
    #[serde(default)]
    pub status: TaskStatus,
    /// Creation time.
    pub created_timestamp: Timestamp,
    /// Last update time.
    pub updated_timestamp: Timestamp,
}

impl Task {
    /// Creates a pending task.
    #[must_use]
    pub fn new(
        task_id: impl Into<String>,
        obligation_id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        priority: TaskPriority,
        now: Timestamp,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            obligation_id: obligation_id.into(),
            title: title.into(),
            description: description.into(),
            priority,
            assigned_to: None,
            due_date: None,
            status: TaskStatus::Pending,
            created_timestamp: now,
            updated_timestamp: now,
        }
    }

    /// Sets the due date.
    #[must_use]
    pub fn with_due_date(mut self, due_date: Timestamp) -> Self {
        self.due_date = Some(due_date);
        self
    }

    /// Checks task invariants.
    pub fn validate(&self) -> Result<(), Fault> {
        if self.task_id.trim().is_empty() {
            return Err(Fault::validation("Task ID cannot be empty"));
        }
        if self.title.trim().is_empty() {
            return Err(Fault::validation(format!("Task {} has an empty title", self.task_id)));
        }
        if self.updated_timestamp < self.created_timestamp {
            return Err(Fault::validation(format!(
                "Task {} was updated before it was created",
                self.task_id
            )));
        }
        if let Some(due) = self.due_date {
            if due < self.created_timestamp {
                return Err(Fault::validation(format!(
                    "Task {} is due before it was created",
                    self.task_id
                )));
            }
        }
        Ok(())
    }
}
