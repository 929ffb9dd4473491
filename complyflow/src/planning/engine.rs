//! The task planning engine.

use super::enhancement::{self, MergeSummary};
use super::schedule;
use super::stats::TaskStatistics;
use super::templates::{TaskTemplate, TemplateCatalog};
use crate::errors::PlanningError;
use crate::models::{DeadlineType, Obligation, ObligationSeverity, Task, TaskPriority};
use crate::ports::TextGenerator;
use crate::resilience::ResilientCaller;
use crate::utils::{stable_id, Timestamp};
use chrono::Duration;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Longest obligation description copied into a task description.
pub const MAX_DESCRIPTION_CHARS: usize = 200;

const ELLIPSIS: &str = "...";

/// Keywords that name the obligation type, checked in order.
const TYPE_KEYWORDS: [(&str, &str); 6] = [
    ("report", "Report"),
    ("monitoring", "Monitoring"),
    ("operational", "Operational"),
    ("financial", "Financial"),
    ("compliance", "Compliance"),
    ("audit", "Audit"),
];

const DEFAULT_TYPE: &str = "Compliance";

/// The obligations of one document and the instant planning runs at.
///
/// `now` is captured once so every task in a run shares the same creation
/// time and due-date base.
#[derive(Debug, Clone, Copy)]
pub struct PlanningContext<'a> {
    obligations: &'a [Obligation],
    now: Timestamp,
}

impl<'a> PlanningContext<'a> {
    /// Creates a context.
    #[must_use]
    pub fn new(obligations: &'a [Obligation], now: Timestamp) -> Self {
        Self { obligations, now }
    }

    /// Returns the obligations.
    #[must_use]
    pub fn obligations(&self) -> &'a [Obligation] {
        self.obligations
    }

    /// Returns the planning instant.
    #[must_use]
    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// Returns true if `obligation_id` belongs to this context.
    #[must_use]
    pub fn contains_obligation(&self, obligation_id: &str) -> bool {
        self.obligations.iter().any(|o| o.obligation_id == obligation_id)
    }

    /// Returns the id of the first obligation.
    #[must_use]
    pub fn first_obligation_id(&self) -> Option<&'a str> {
        self.obligations.first().map(|o| o.obligation_id.as_str())
    }
}

/// Output of [`TaskPlanner::plan`].
#[derive(Debug, Clone, PartialEq)]
pub struct PlanningResult {
    /// Prioritized tasks.
    pub tasks: Vec<Task>,
    /// Statistics over `tasks`.
    pub statistics: TaskStatistics,
    /// Whether suggestions changed the base list.
    pub enhanced: bool,
}

impl PlanningResult {
    pub(crate) fn empty(now: Timestamp) -> Self {
        Self {
            tasks: Vec::new(),
            statistics: TaskStatistics::compute(&[], now),
            enhanced: false,
        }
    }
}

/// Turns obligations into a prioritized task list.
#[derive(Clone)]
pub struct TaskPlanner {
    catalog: TemplateCatalog,
    generator: Option<Arc<dyn TextGenerator>>,
    resilience: Option<ResilientCaller>,
}

impl fmt::Debug for TaskPlanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPlanner")
            .field("catalog", &self.catalog)
            .field("has_generator", &self.generator.is_some())
            .field("resilience", &self.resilience)
            .finish()
    }
}

impl Default for TaskPlanner {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskPlanner {
    /// Creates a planner with the standard templates and no generator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            catalog: TemplateCatalog::standard(),
            generator: None,
            resilience: None,
        }
    }

    /// Replaces the template catalog.
    #[must_use]
    pub fn with_catalog(mut self, catalog: TemplateCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Sets the text generator used for enhancement.
    #[must_use]
    pub fn with_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Routes generator calls through a breaker and retry executor.
    #[must_use]
    pub fn with_resilience(mut self, caller: ResilientCaller) -> Self {
        self.resilience = Some(caller);
        self
    }

    /// Returns the template catalog.
    #[must_use]
    pub fn catalog(&self) -> &TemplateCatalog {
        &self.catalog
    }

    /// Generates the template-driven tasks for `obligations`, in input order.
    ///
    /// Ids are derived from the obligation, category, and template position,
    /// so the same input always produces the same tasks.
    pub fn generate_base_tasks(
        &self,
        obligations: &[Obligation],
        now: Timestamp,
    ) -> Result<Vec<Task>, PlanningError> {
        let mut tasks = Vec::new();
        for obligation in obligations {
            obligation.validate().map_err(|fault| {
                PlanningError::new(fault.message).for_obligation(&obligation.obligation_id)
            })?;

            let templates = self.catalog.templates_for(obligation.category);
            if templates.is_empty() {
                tasks.push(generic_task(obligation, now));
                continue;
            }

            let obligation_type = obligation_type(&obligation.description);
            let description = truncate_description(&obligation.description);
            for (index, template) in templates.iter().enumerate() {
                tasks.push(template_task(
                    obligation,
                    template,
                    index,
                    obligation_type,
                    &description,
                    now,
                ));
            }
        }

        for task in &tasks {
            task.validate().map_err(|fault| {
                PlanningError::new(fault.message).for_obligation(&task.obligation_id)
            })?;
        }
        Ok(tasks)
    }

    /// Plans tasks for one document.
    ///
    /// Enhancement runs only when `use_ai_enhancement` is set and a generator
    /// is configured; any failure there falls back to the base list. Only a
    /// failure in base generation is returned as an error.
    pub async fn plan(
        &self,
        obligations: &[Obligation],
        use_ai_enhancement: bool,
        now: Timestamp,
    ) -> Result<PlanningResult, PlanningError> {
        if obligations.is_empty() {
            warn!("No obligations provided for task generation");
            return Ok(PlanningResult::empty(now));
        }
        info!(obligations = obligations.len(), "Generating tasks");

        let context = PlanningContext::new(obligations, now);
        let base = self.generate_base_tasks(obligations, now)?;
        let (tasks, enhanced) = match (&self.generator, use_ai_enhancement) {
            (Some(generator), true) => self.enhance(generator.as_ref(), base, &context).await,
            _ => (base, false),
        };

        let tasks = schedule::prioritize(tasks);
        let statistics = TaskStatistics::compute(&tasks, now);
        info!(tasks = tasks.len(), enhanced, "Task generation finished");
        Ok(PlanningResult {
            tasks,
            statistics,
            enhanced,
        })
    }

    /// Computes statistics for `tasks`.
    #[must_use]
    pub fn statistics(&self, tasks: &[Task], now: Timestamp) -> TaskStatistics {
        TaskStatistics::compute(tasks, now)
    }

    /// Infers per-obligation dependency chains.
    #[must_use]
    pub fn analyze_dependencies(&self, tasks: &[Task]) -> BTreeMap<String, Vec<String>> {
        schedule::analyze_dependencies(tasks)
    }

    async fn enhance(
        &self,
        generator: &dyn TextGenerator,
        base: Vec<Task>,
        context: &PlanningContext<'_>,
    ) -> (Vec<Task>, bool) {
        let prompt = enhancement::build_prompt(context.obligations(), &base);
        let reply = match &self.resilience {
            Some(caller) => caller.call(|| generator.generate(&prompt)).await,
            None => generator.generate(&prompt).await,
        };

        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                warn!(error = %err, "Enhancement failed, using base tasks");
                return (base, false);
            }
        };
        let Some(payload) = enhancement::parse_suggestions(&reply) else {
            warn!("No usable suggestions in enhancement reply, using base tasks");
            return (base, false);
        };

        let (tasks, summary) = enhancement::merge(base, &payload, context);
        let MergeSummary { added, modified, rejected } = summary;
        debug!(added, modified, rejected, "Merged suggestions");
        (tasks, added + modified > 0)
    }
}

/// Returns the first type keyword found in `description`, title-cased.
#[must_use]
pub fn obligation_type(description: &str) -> &'static str {
    let lowered = description.to_lowercase();
    TYPE_KEYWORDS
        .iter()
        .find(|(keyword, _)| lowered.contains(keyword))
        .map_or(DEFAULT_TYPE, |&(_, name)| name)
}

/// Cuts `description` to at most [`MAX_DESCRIPTION_CHARS`] characters,
/// ending in `...` when shortened.
#[must_use]
pub fn truncate_description(description: &str) -> String {
    if description.chars().count() <= MAX_DESCRIPTION_CHARS {
        return description.to_string();
    }
    let kept: String = description
        .chars()
        .take(MAX_DESCRIPTION_CHARS - ELLIPSIS.len())
        .collect();
    format!("{kept}{ELLIPSIS}")
}

/// Raises a template priority according to obligation severity.
#[must_use]
pub fn escalate_priority(base: TaskPriority, severity: ObligationSeverity) -> TaskPriority {
    match severity {
        ObligationSeverity::Critical | ObligationSeverity::High => TaskPriority::High,
        ObligationSeverity::Medium | ObligationSeverity::Low => base,
    }
}

/// Scales a template estimate: 0.7x (rounded up, at least one day) for
/// critical obligations, 1.3x for low ones.
#[must_use]
pub fn scaled_days(estimated_days: u32, severity: ObligationSeverity) -> i64 {
    let days = i64::from(estimated_days);
    match severity {
        ObligationSeverity::Critical => ((days * 7 + 9) / 10).max(1),
        ObligationSeverity::Low => days * 13 / 10,
        ObligationSeverity::High | ObligationSeverity::Medium => days,
    }
}

/// Days until due for an obligation with no templates.
#[must_use]
pub fn fallback_days(deadline_type: DeadlineType, severity: ObligationSeverity) -> i64 {
    use ObligationSeverity::{Critical, High};
    match deadline_type {
        DeadlineType::OneTime if matches!(severity, Critical | High) => 30,
        DeadlineType::OneTime => 60,
        DeadlineType::Recurring => 90,
        DeadlineType::Ongoing if severity == Critical => 60,
        DeadlineType::Ongoing => 120,
    }
}

fn severity_priority(severity: ObligationSeverity) -> TaskPriority {
    match severity {
        ObligationSeverity::Critical | ObligationSeverity::High => TaskPriority::High,
        ObligationSeverity::Medium => TaskPriority::Medium,
        ObligationSeverity::Low => TaskPriority::Low,
    }
}

fn template_task(
    obligation: &Obligation,
    template: &TaskTemplate,
    index: usize,
    obligation_type: &str,
    description: &str,
    now: Timestamp,
) -> Task {
    let task_id = stable_id(
        "task",
        &[
            &obligation.obligation_id,
            obligation.category.as_str(),
            &index.to_string(),
        ],
    );
    let days = scaled_days(template.estimated_days, obligation.severity);
    Task::new(
        task_id,
        &obligation.obligation_id,
        template.render_title(obligation_type),
        template.render_description(obligation_type, description),
        escalate_priority(template.priority, obligation.severity),
        now,
    )
    .with_due_date(now + Duration::days(days))
}

fn generic_task(obligation: &Obligation, now: Timestamp) -> Task {
    let category = obligation.category.as_str();
    let mut label = category.to_string();
    if let Some(first) = label.get_mut(..1) {
        first.make_ascii_uppercase();
    }
    let task_id = stable_id("task", &[&obligation.obligation_id, category, "generic"]);
    let days = fallback_days(obligation.deadline_type, obligation.severity);
    Task::new(
        task_id,
        &obligation.obligation_id,
        format!("Address {label} Obligation"),
        format!("Address the compliance obligation: {}", obligation.description),
        severity_priority(obligation.severity),
        now,
    )
    .with_due_date(now + Duration::days(days))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Fault;
    use crate::models::ObligationCategory;
    use crate::ports::MockTextGenerator;
    use crate::testing::ScriptedTextGenerator;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn now() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    fn obligation(
        id: &str,
        category: ObligationCategory,
        severity: ObligationSeverity,
        deadline: DeadlineType,
    ) -> Obligation {
        Obligation::new(
            "doc_1",
            "Submit the quarterly capital report to the regulator",
            category,
            severity,
            deadline,
        )
        .with_id(id)
    }

    fn due_in_days(task: &Task) -> i64 {
        (task.due_date.unwrap() - now()).num_days()
    }

    #[test]
    fn test_critical_obligation_yields_only_high_tasks() {
        let planner = TaskPlanner::new();
        let tasks = planner
            .generate_base_tasks(
                &[obligation(
                    "obl_1",
                    ObligationCategory::Reporting,
                    ObligationSeverity::Critical,
                    DeadlineType::OneTime,
                )],
                now(),
            )
            .unwrap();

        assert_eq!(tasks.len(), 3);
        assert!(tasks.iter().all(|t| t.priority == TaskPriority::High));
        assert_eq!(tasks[0].title, "Prepare Report Report");
        assert_eq!(due_in_days(&tasks[0]), 5);
        assert_eq!(due_in_days(&tasks[2]), 1);
    }

    #[test]
    fn test_low_severity_keeps_template_priority() {
        let planner = TaskPlanner::new();
        let tasks = planner
            .generate_base_tasks(
                &[obligation(
                    "obl_1",
                    ObligationCategory::Monitoring,
                    ObligationSeverity::Low,
                    DeadlineType::Ongoing,
                )],
                now(),
            )
            .unwrap();

        let priorities: Vec<TaskPriority> = tasks.iter().map(|t| t.priority).collect();
        assert_eq!(
            priorities,
            vec![TaskPriority::High, TaskPriority::Medium, TaskPriority::Medium]
        );
        assert_eq!(due_in_days(&tasks[0]), 18);
        assert_eq!(due_in_days(&tasks[1]), 6);
    }

    #[test]
    fn test_high_severity_escalates_medium_templates() {
        let tasks = TaskPlanner::new()
            .generate_base_tasks(
                &[obligation(
                    "obl_1",
                    ObligationCategory::Operational,
                    ObligationSeverity::High,
                    DeadlineType::Recurring,
                )],
                now(),
            )
            .unwrap();
        assert!(tasks.iter().all(|t| t.priority == TaskPriority::High));
        assert_eq!(due_in_days(&tasks[0]), 21);
    }

    #[test]
    fn test_generic_task_when_category_has_no_templates() {
        let catalog =
            TemplateCatalog::standard().with_templates(ObligationCategory::Financial, Vec::new());
        let planner = TaskPlanner::new().with_catalog(catalog);
        let obligations = vec![
            obligation(
                "obl_1",
                ObligationCategory::Financial,
                ObligationSeverity::High,
                DeadlineType::OneTime,
            ),
            obligation(
                "obl_2",
                ObligationCategory::Financial,
                ObligationSeverity::Medium,
                DeadlineType::OneTime,
            ),
            obligation(
                "obl_3",
                ObligationCategory::Financial,
                ObligationSeverity::Low,
                DeadlineType::Recurring,
            ),
            obligation(
                "obl_4",
                ObligationCategory::Financial,
                ObligationSeverity::Critical,
                DeadlineType::Ongoing,
            ),
            obligation(
                "obl_5",
                ObligationCategory::Financial,
                ObligationSeverity::Medium,
                DeadlineType::Ongoing,
            ),
        ];
        let tasks = planner.generate_base_tasks(&obligations, now()).unwrap();

        assert_eq!(tasks.len(), 5);
        assert_eq!(tasks[0].title, "Address Financial Obligation");
        assert!(tasks[0]
            .description
            .starts_with("Address the compliance obligation: Submit"));
        let days: Vec<i64> = tasks.iter().map(due_in_days).collect();
        assert_eq!(days, vec![30, 60, 90, 60, 120]);
        assert_eq!(tasks[2].priority, TaskPriority::Low);
    }

    #[test]
    fn test_base_generation_is_deterministic() {
        let obligations = vec![
            obligation(
                "obl_1",
                ObligationCategory::Reporting,
                ObligationSeverity::Medium,
                DeadlineType::Recurring,
            ),
            obligation(
                "obl_2",
                ObligationCategory::Financial,
                ObligationSeverity::Low,
                DeadlineType::OneTime,
            ),
        ];
        let planner = TaskPlanner::new();
        let first = planner.generate_base_tasks(&obligations, now()).unwrap();
        let second = planner.generate_base_tasks(&obligations, now()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 6);
    }

    #[test]
    fn test_long_descriptions_are_truncated() {
        let long = "x".repeat(300);
        let truncated = truncate_description(&long);
        assert_eq!(truncated.chars().count(), MAX_DESCRIPTION_CHARS);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncate_description("short"), "short");
    }

    #[test]
    fn test_obligation_type_keywords() {
        assert_eq!(obligation_type("Quarterly REPORTING duty"), "Report");
        assert_eq!(obligation_type("Maintain monitoring of emissions"), "Monitoring");
        assert_eq!(obligation_type("Pay annual fees"), "Compliance");
        assert_eq!(obligation_type("Internal audit each year"), "Audit");
    }

    #[test]
    fn test_invalid_obligation_is_a_planning_error() {
        let mut bad = obligation(
            "obl_bad",
            ObligationCategory::Reporting,
            ObligationSeverity::Low,
            DeadlineType::OneTime,
        );
        bad.description = "  ".to_string();
        let err = TaskPlanner::new().generate_base_tasks(&[bad], now()).unwrap_err();
        assert_eq!(err.obligation_id.as_deref(), Some("obl_bad"));
    }

    #[test]
    fn test_scaled_days() {
        assert_eq!(scaled_days(7, ObligationSeverity::Critical), 5);
        assert_eq!(scaled_days(1, ObligationSeverity::Critical), 1);
        assert_eq!(scaled_days(10, ObligationSeverity::Low), 13);
        assert_eq!(scaled_days(10, ObligationSeverity::Medium), 10);
    }

    #[tokio::test]
    async fn test_plan_orders_and_summarises() {
        let obligations = vec![
            obligation(
                "obl_1",
                ObligationCategory::Monitoring,
                ObligationSeverity::Low,
                DeadlineType::Ongoing,
            ),
            obligation(
                "obl_2",
                ObligationCategory::Reporting,
                ObligationSeverity::Critical,
                DeadlineType::OneTime,
            ),
        ];
        let result = TaskPlanner::new().plan(&obligations, false, now()).await.unwrap();

        assert_eq!(result.tasks.len(), 6);
        assert!(!result.enhanced);
        assert_eq!(result.statistics.total_tasks, 6);
        assert_eq!(result.statistics.count_for("high"), 4);
        assert_eq!(result.tasks[0].obligation_id, "obl_2");
        assert_eq!(due_in_days(&result.tasks[0]), 1);
        assert_eq!(result.tasks.last().map(|t| t.priority), Some(TaskPriority::Medium));
    }

    #[tokio::test]
    async fn test_plan_empty_input() {
        let result = TaskPlanner::new().plan(&[], true, now()).await.unwrap();
        assert!(result.tasks.is_empty());
        assert_eq!(result.statistics.total_tasks, 0);
    }

    #[tokio::test]
    async fn test_enhancement_failure_falls_back_to_base_list() {
        let obligations = vec![obligation(
            "obl_1",
            ObligationCategory::Reporting,
            ObligationSeverity::Medium,
            DeadlineType::Recurring,
        )];
        let generator = Arc::new(
            ScriptedTextGenerator::new()
                .fail(Fault::from_model_code("ModelNotReadyException", "warming up")),
        );
        let planner = TaskPlanner::new().with_generator(generator.clone());

        let enhanced = planner.plan(&obligations, true, now()).await.unwrap();
        let plain = planner.plan(&obligations, false, now()).await.unwrap();

        assert!(!enhanced.enhanced);
        assert_eq!(enhanced.tasks, plain.tasks);
        assert_eq!(generator.prompts().len(), 1);
    }

    #[tokio::test]
    async fn test_unparseable_reply_falls_back() {
        let obligations = vec![obligation(
            "obl_1",
            ObligationCategory::Financial,
            ObligationSeverity::Medium,
            DeadlineType::OneTime,
        )];
        let generator = Arc::new(ScriptedTextGenerator::new().respond("I cannot help with that."));
        let result = TaskPlanner::new()
            .with_generator(generator)
            .plan(&obligations, true, now())
            .await
            .unwrap();
        assert_eq!(result.tasks.len(), 3);
        assert!(!result.enhanced);
    }

    #[tokio::test]
    async fn test_suggestions_are_merged() {
        let obligations = vec![obligation(
            "obl_1",
            ObligationCategory::Reporting,
            ObligationSeverity::Medium,
            DeadlineType::Recurring,
        )];
        let reply = format!(
            "Sure. {}",
            json!({"additional_tasks": [{
                "title": "Book external review",
                "description": "Engage reviewer",
                "priority": "low",
                "estimated_days": 40
            }]})
        );
        let generator = Arc::new(ScriptedTextGenerator::new().respond(reply));
        let result = TaskPlanner::new()
            .with_generator(generator)
            .plan(&obligations, true, now())
            .await
            .unwrap();

        assert!(result.enhanced);
        assert_eq!(result.tasks.len(), 4);
        let last = result.tasks.last().unwrap();
        assert_eq!(last.title, "Book external review");
        assert_eq!(last.obligation_id, "obl_1");
    }

    #[tokio::test]
    async fn test_generator_is_skipped_when_disabled() {
        let mut generator = MockTextGenerator::new();
        generator.expect_generate().times(0);
        let obligations = vec![obligation(
            "obl_1",
            ObligationCategory::Operational,
            ObligationSeverity::Low,
            DeadlineType::Ongoing,
        )];
        let result = TaskPlanner::new()
            .with_generator(Arc::new(generator))
            .plan(&obligations, false, now())
            .await
            .unwrap();
        assert_eq!(result.tasks.len(), 3);
    }

    #[tokio::test]
    async fn test_generator_fault_through_mock() {
        let mut generator = MockTextGenerator::new();
        generator
            .expect_generate()
            .times(1)
            .returning(|_| Err(Fault::throttled("rate limited", None).into()));
        let obligations = vec![obligation(
            "obl_1",
            ObligationCategory::Reporting,
            ObligationSeverity::High,
            DeadlineType::OneTime,
        )];
        let result = TaskPlanner::new()
            .with_generator(Arc::new(generator))
            .plan(&obligations, true, now())
            .await
            .unwrap();
        assert_eq!(result.tasks.len(), 3);
        assert!(!result.enhanced);
    }
}
