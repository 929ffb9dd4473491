//! Derived task statistics.

use crate::models::Task;
use crate::utils::Timestamp;
use serde::Serialize;
use std::collections::BTreeMap;

/// Summary of a task list. Derived on demand, never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatistics {
    /// Number of tasks.
    pub total_tasks: usize,
    /// Task count per priority name.
    pub priority_distribution: BTreeMap<String, usize>,
    /// Number of tasks with a due date.
    pub tasks_with_due_dates: usize,
    /// Ids of the tasks with a due date, in input order.
    pub dated_task_ids: Vec<String>,
    /// Mean whole days until due across dated tasks, to one decimal.
    pub average_days_to_due: f64,
    /// Earliest due date.
    pub earliest_due_date: Option<Timestamp>,
    /// Latest due date.
    pub latest_due_date: Option<Timestamp>,
}

impl TaskStatistics {
    /// Computes statistics for `tasks` as of `now`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn compute(tasks: &[Task], now: Timestamp) -> Self {
        let mut priority_distribution = BTreeMap::new();
        for task in tasks {
            *priority_distribution
                .entry(task.priority.as_str().to_string())
                .or_insert(0) += 1;
        }

        let dated: Vec<(&Task, Timestamp)> = tasks
            .iter()
            .filter_map(|t| t.due_date.map(|due| (t, due)))
            .collect();
        let average_days_to_due = if dated.is_empty() {
            0.0
        } else {
            let total: i64 = dated.iter().map(|(_, due)| (*due - now).num_days()).sum();
            let mean = total as f64 / dated.len() as f64;
            (mean * 10.0).round() / 10.0
        };

        Self {
            total_tasks: tasks.len(),
            priority_distribution,
            tasks_with_due_dates: dated.len(),
            dated_task_ids: dated.iter().map(|(t, _)| t.task_id.clone()).collect(),
            average_days_to_due,
            earliest_due_date: dated.iter().map(|(_, due)| *due).min(),
            latest_due_date: dated.iter().map(|(_, due)| *due).max(),
        }
    }

    /// Returns the count for `priority`, or 0.
    #[must_use]
    pub fn count_for(&self, priority: &str) -> usize {
        self.priority_distribution.get(priority).copied().unwrap_or(0)
    }
}
