//! AI-suggested task enhancement.
//!
//! The planner sends the base tasks and obligation summaries to a
//! [`TextGenerator`](crate::ports::TextGenerator), extracts a JSON suggestion
//! payload from the reply, and merges it into the base list. Anything that
//! cannot be parsed or does not belong to the current batch is dropped.

use super::engine::PlanningContext;
use crate::models::{Obligation, Task, TaskPriority};
use crate::utils::{format_iso8601, stable_id, Timestamp};
use chrono::Duration;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::LazyLock;
use tracing::{debug, warn};

/// Days used when a suggested task gives no estimate.
pub const DEFAULT_SUGGESTED_DAYS: f64 = 7.0;

const MAX_SUGGESTED_DAYS: i64 = 3650;

static JSON_OBJECT: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?s)\{.*\}").ok());

/// The structured reply expected from the text generator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuggestionPayload {
    /// Free-form review of the plan. Informational.
    #[serde(default)]
    pub analysis: Value,
    /// Tasks to add, kept raw so one malformed entry does not void the rest.
    #[serde(default)]
    pub additional_tasks: Vec<Value>,
    /// Changes to existing tasks, kept raw for the same reason.
    #[serde(default)]
    pub task_modifications: Vec<Value>,
    /// Suggested phases. Informational, never enforced.
    #[serde(default)]
    pub sequencing_recommendations: Vec<Value>,
}

impl SuggestionPayload {
    /// Returns true if the payload would change nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.additional_tasks.is_empty() && self.task_modifications.is_empty()
    }
}

/// A task the generator wants added.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SuggestedTask {
    /// Title; required.
    pub title: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Priority name; unknown values fall back to medium.
    #[serde(default)]
    pub priority: Option<String>,
    /// Days until due.
    #[serde(default)]
    pub estimated_days: Option<f64>,
    /// Ids of tasks this one follows. Informational.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Obligations the task serves; the first one known to the batch wins.
    #[serde(default)]
    pub obligation_ids: Vec<String>,
}

/// Overrides for one existing task.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SuggestedChanges {
    /// New title.
    #[serde(default)]
    pub title: Option<String>,
    /// New description.
    #[serde(default)]
    pub description: Option<String>,
    /// New priority; ignored when not a known priority.
    #[serde(default)]
    pub priority: Option<String>,
    /// Recomputes the due date as `now + days`.
    #[serde(default)]
    pub estimated_days: Option<f64>,
}

/// A modification keyed by task id.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TaskModification {
    /// Target task.
    pub task_id: String,
    /// What to change.
    #[serde(default)]
    pub suggested_changes: SuggestedChanges,
}

/// What a merge did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Suggested tasks added.
    pub added: usize,
    /// Existing tasks modified.
    pub modified: usize,
    /// Entries dropped as malformed or out of scope.
    pub rejected: usize,
}

/// Builds the enhancement prompt for `obligations` and their base `tasks`.
#[must_use]
pub fn build_prompt(obligations: &[Obligation], tasks: &[Task]) -> String {
    let obligations_summary: Vec<Value> = obligations
        .iter()
        .map(|o| {
            json!({
                "id": o.obligation_id,
                "description": o.description,
                "category": o.category.as_str(),
                "severity": o.severity.to_string(),
                "deadline_type": o.deadline_type.to_string(),
            })
        })
        .collect();
    let tasks_summary: Vec<Value> = tasks
        .iter()
        .map(|t| {
            json!({
                "id": t.task_id,
                "obligation_id": t.obligation_id,
                "title": t.title,
                "description": t.description,
                "priority": t.priority.as_str(),
                "due_date": t.due_date.as_ref().map(format_iso8601),
            })
        })
        .collect();

    let obligations_json = serde_json::to_string_pretty(&obligations_summary).unwrap_or_default();
    let tasks_json = serde_json::to_string_pretty(&tasks_summary).unwrap_or_default();

    format!(
        r#"You are reviewing a compliance task plan built from regulatory obligations.
Check the plan for gaps, suggest tasks that are missing, adjust existing tasks
where needed, and propose a sensible order of work.

OBLIGATIONS:
{obligations_json}

CURRENT TASKS:
{tasks_json}

Reply with a single JSON object of this shape:

{{
  "analysis": {{"strengths": [], "gaps": [], "risks": []}},
  "additional_tasks": [
    {{"title": "...", "description": "...", "priority": "high|medium|low",
      "estimated_days": 5, "depends_on": ["task id"], "obligation_ids": ["obligation id"]}}
  ],
  "task_modifications": [
    {{"task_id": "existing task id",
      "suggested_changes": {{"title": "...", "description": "...", "priority": "high|medium|low", "estimated_days": 7}}}}
  ],
  "sequencing_recommendations": [
    {{"phase": "...", "tasks": ["task id"], "duration_estimate": "..."}}
  ]
}}

Only reference task ids and obligation ids listed above."#
    )
}

/// Extracts the suggestion payload from a generator reply.
///
/// Takes the span from the first `{` to the last `}` so prose around the
/// JSON is tolerated. Returns `None` if no object parses.
#[must_use]
pub fn parse_suggestions(response: &str) -> Option<SuggestionPayload> {
    let pattern = JSON_OBJECT.as_ref()?;
    let candidate = pattern.find(response)?;
    match serde_json::from_str(candidate.as_str()) {
        Ok(payload) => Some(payload),
        Err(err) => {
            debug!(error = %err, "Suggestion payload did not parse");
            None
        }
    }
}

/// Merges `payload` into `tasks`.
///
/// Additional tasks get deterministic ids and attach to the first obligation
/// id they name that belongs to the context, falling back to the first
/// obligation. Modifications apply only to task ids in the batch.
pub fn merge(
    mut tasks: Vec<Task>,
    payload: &SuggestionPayload,
    context: &PlanningContext<'_>,
) -> (Vec<Task>, MergeSummary) {
    let mut summary = MergeSummary::default();
    let now = context.now();

    for (index, raw) in payload.additional_tasks.iter().enumerate() {
        let suggestion: SuggestedTask = match serde_json::from_value(raw.clone()) {
            Ok(s) => s,
            Err(err) => {
                warn!(error = %err, index, "Dropping malformed suggested task");
                summary.rejected += 1;
                continue;
            }
        };
        match suggested_task(&suggestion, index, context) {
            Some(task) => {
                tasks.push(task);
                summary.added += 1;
            }
            None => summary.rejected += 1,
        }
    }

    for raw in &payload.task_modifications {
        let modification: TaskModification = match serde_json::from_value(raw.clone()) {
            Ok(m) => m,
            Err(err) => {
                warn!(error = %err, "Dropping malformed task modification");
                summary.rejected += 1;
                continue;
            }
        };
        let Some(task) = tasks.iter_mut().find(|t| t.task_id == modification.task_id) else {
            warn!(
                task_id = %modification.task_id,
                "Ignoring modification for a task outside this batch"
            );
            summary.rejected += 1;
            continue;
        };
        apply_changes(task, &modification.suggested_changes, now);
        summary.modified += 1;
    }

    (tasks, summary)
}

fn suggested_task(
    suggestion: &SuggestedTask,
    index: usize,
    context: &PlanningContext<'_>,
) -> Option<Task> {
    if suggestion.title.trim().is_empty() {
        warn!(index, "Dropping suggested task without a title");
        return None;
    }

    let named = suggestion
        .obligation_ids
        .iter()
        .find(|id| context.contains_obligation(id));
    let obligation_id = match named {
        Some(id) => id.clone(),
        None => {
            if !suggestion.obligation_ids.is_empty() {
                warn!(
                    obligation_ids = ?suggestion.obligation_ids,
                    "Suggested task names obligations outside this document"
                );
            }
            context.first_obligation_id()?.to_string()
        }
    };

    let priority = match suggestion.priority.as_deref() {
        None => TaskPriority::Medium,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(priority = raw, "Unknown suggested priority, using medium");
            TaskPriority::Medium
        }),
    };
    let now = context.now();
    let days = suggestion.estimated_days.unwrap_or(DEFAULT_SUGGESTED_DAYS);
    let task_id = stable_id(
        "task",
        &[&obligation_id, "suggested", &index.to_string(), &suggestion.title],
    );

    Some(
        Task::new(
            task_id,
            obligation_id,
            suggestion.title.trim(),
            suggestion.description.trim(),
            priority,
            now,
        )
        .with_due_date(now + Duration::days(whole_days(days))),
    )
}

fn apply_changes(task: &mut Task, changes: &SuggestedChanges, now: Timestamp) {
    if let Some(title) = changes.title.as_deref().filter(|t| !t.trim().is_empty()) {
        task.title = title.trim().to_string();
    }
    if let Some(description) = &changes.description {
        task.description.clone_from(description);
    }
    if let Some(raw) = changes.priority.as_deref() {
        match raw.parse() {
            Ok(priority) => task.priority = priority,
            Err(_) => debug!(task_id = %task.task_id, priority = raw, "Keeping priority"),
        }
    }
    if let Some(days) = changes.estimated_days {
        task.due_date = Some(now + Duration::days(whole_days(days)));
    }
    task.updated_timestamp = now.max(task.created_timestamp);
}

#[allow(clippy::cast_possible_truncation)]
fn whole_days(days: f64) -> i64 {
    (days.round().max(1.0) as i64).min(MAX_SUGGESTED_DAYS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeadlineType, ObligationCategory, ObligationSeverity};
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn now() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn obligations() -> Vec<Obligation> {
        vec![
            Obligation::new(
                "doc_1",
                "Submit annual emissions report",
                ObligationCategory::Reporting,
                ObligationSeverity::High,
                DeadlineType::Recurring,
            )
            .with_id("obl_a"),
            Obligation::new(
                "doc_1",
                "Monitor discharge levels",
                ObligationCategory::Monitoring,
                ObligationSeverity::Medium,
                DeadlineType::Ongoing,
            )
            .with_id("obl_b"),
        ]
    }

    fn base() -> Vec<Task> {
        vec![
            Task::new("task_1", "obl_a", "Prepare report", "d", TaskPriority::High, now()),
            Task::new("task_2", "obl_b", "Review monitoring", "d", TaskPriority::Medium, now()),
        ]
    }

    #[test]
    fn test_parse_tolerates_surrounding_prose() {
        let reply =
            "Here is my review:\n{\"additional_tasks\": [], \"task_modifications\": []}\nThanks.";
        let payload = parse_suggestions(reply).unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(parse_suggestions("no structured answer today").is_none());
        assert!(parse_suggestions("{ not json }").is_none());
        assert!(parse_suggestions("{\"additional_tasks\": \"lots\"}").is_none());
    }

    #[test]
    fn test_prompt_lists_ids() {
        let prompt = build_prompt(&obligations(), &base());
        assert!(prompt.contains("obl_a"));
        assert!(prompt.contains("task_2"));
        assert!(prompt.contains("additional_tasks"));
    }

    #[test]
    fn test_merge_adds_and_modifies() {
        let payload: SuggestionPayload = serde_json::from_value(json!({
            "additional_tasks": [
                {"title": "Engage external auditor", "description": "Book the audit",
                 "priority": "high", "estimated_days": 10, "obligation_ids": ["obl_b"]}
            ],
            "task_modifications": [
                {"task_id": "task_2",
                 "suggested_changes": {"priority": "high", "estimated_days": 3}}
            ]
        }))
        .unwrap();

        let obligations = obligations();
        let (tasks, summary) = merge(base(), &payload, &PlanningContext::new(&obligations, now()));
        assert_eq!(summary, MergeSummary { added: 1, modified: 1, rejected: 0 });
        assert_eq!(tasks.len(), 3);

        let added = &tasks[2];
        assert_eq!(added.obligation_id, "obl_b");
        assert_eq!(added.priority, TaskPriority::High);
        assert_eq!(added.due_date, Some(now() + Duration::days(10)));
        assert!(added.task_id.starts_with("task_"));

        assert_eq!(tasks[1].priority, TaskPriority::High);
        assert_eq!(tasks[1].due_date, Some(now() + Duration::days(3)));
    }

    #[test]
    fn test_merge_ids_are_deterministic() {
        let payload: SuggestionPayload = serde_json::from_value(json!({
            "additional_tasks": [{"title": "Extra", "description": "x"}]
        }))
        .unwrap();
        let (first, _) = merge(base(), &payload, &PlanningContext::new(&obligations(), now()));
        let (second, _) = merge(base(), &payload, &PlanningContext::new(&obligations(), now()));
        assert_eq!(first[2].task_id, second[2].task_id);
        assert_eq!(first[2].due_date, Some(now() + Duration::days(7)));
    }

    #[test]
    fn test_unknown_modification_priority_is_ignored() {
        let payload: SuggestionPayload = serde_json::from_value(json!({
            "task_modifications": [
                {"task_id": "task_1",
                 "suggested_changes": {"priority": "urgent", "title": "Prepare final report"}}
            ]
        }))
        .unwrap();
        let obligations = obligations();
        let (tasks, summary) = merge(base(), &payload, &PlanningContext::new(&obligations, now()));
        assert_eq!(summary.modified, 1);
        assert_eq!(tasks[0].priority, TaskPriority::High);
        assert_eq!(tasks[0].title, "Prepare final report");
    }

    #[test]
    fn test_foreign_ids_are_guarded() {
        let payload: SuggestionPayload = serde_json::from_value(json!({
            "additional_tasks": [
                {"title": "Cross-check", "obligation_ids": ["obl_from_other_doc"]},
                {"description": "no title"}
            ],
            "task_modifications": [
                {"task_id": "task_from_other_doc", "suggested_changes": {"title": "Hijacked"}}
            ]
        }))
        .unwrap();
        let obligations = obligations();
        let (tasks, summary) = merge(base(), &payload, &PlanningContext::new(&obligations, now()));
        assert_eq!(summary, MergeSummary { added: 1, modified: 0, rejected: 2 });
        assert_eq!(tasks[2].obligation_id, "obl_a");
        assert!(tasks.iter().all(|t| t.title != "Hijacked"));
    }

    #[test]
    fn test_whole_days_bounds() {
        assert_eq!(whole_days(0.0), 1);
        assert_eq!(whole_days(-4.0), 1);
        assert_eq!(whole_days(2.6), 3);
        assert_eq!(whole_days(f64::NAN), 1);
        assert_eq!(whole_days(1e12), MAX_SUGGESTED_DAYS);
    }
}
