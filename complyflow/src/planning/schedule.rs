//! Ordering and dependency inference over generated tasks.

use crate::models::Task;
use std::cmp::{Ordering, Reverse};
use std::collections::BTreeMap;

/// Orders tasks by priority (high first), then due date (undated last),
/// then creation time. The sort is stable, so ties keep input order.
#[must_use]
pub fn prioritize(mut tasks: Vec<Task>) -> Vec<Task> {
    tasks.sort_by(schedule_order);
    tasks
}

fn schedule_order(a: &Task, b: &Task) -> Ordering {
    Reverse(a.priority.rank())
        .cmp(&Reverse(b.priority.rank()))
        .then_with(|| due_order(a, b))
        .then_with(|| a.created_timestamp.cmp(&b.created_timestamp))
}

fn due_order(a: &Task, b: &Task) -> Ordering {
    match (a.due_date, b.due_date) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Infers a dependency chain per obligation.
///
/// Within each obligation's tasks, ordered by priority then due date, every
/// task depends on the one before it. The result maps each task id to its
/// dependencies; it is advisory and never stored.
#[must_use]
pub fn analyze_dependencies(tasks: &[Task]) -> BTreeMap<String, Vec<String>> {
    let mut groups: BTreeMap<&str, Vec<&Task>> = BTreeMap::new();
    for task in tasks {
        groups.entry(task.obligation_id.as_str()).or_default().push(task);
    }

    let mut dependencies = BTreeMap::new();
    for group in groups.values_mut() {
        group.sort_by(|a, b| {
            Reverse(a.priority.rank())
                .cmp(&Reverse(b.priority.rank()))
                .then_with(|| due_order(a, b))
        });
        let mut previous: Option<&str> = None;
        for task in &*group {
            let deps = previous.map(|id| vec![id.to_string()]).unwrap_or_default();
            dependencies.insert(task.task_id.clone(), deps);
            previous = Some(task.task_id.as_str());
        }
    }
    dependencies
}
