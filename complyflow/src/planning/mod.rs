//! Obligation-to-task planning.
//!
//! [`TaskPlanner`] turns a document's obligations into tasks in four steps:
//! template expansion with severity-based priority and due dates, optional
//! enhancement through a [`TextGenerator`](crate::ports::TextGenerator),
//! prioritization, and statistics. [`PlanningStage`] wires the planner into
//! the orchestrator as the planning stage's handler.
//!
//! ```rust,ignore
//! use complyflow::planning::TaskPlanner;
//!
//! let result = TaskPlanner::new().plan(&obligations, false, now_utc()).await?;
//! for task in &result.tasks {
//!     println!("{} ({})", task.title, task.priority);
//! }
//! ```

mod engine;
pub mod enhancement;
mod schedule;
mod stage;
mod stats;
mod templates;

pub use engine::{
    escalate_priority, fallback_days, obligation_type, scaled_days, truncate_description,
    PlanningContext, PlanningResult, TaskPlanner, MAX_DESCRIPTION_CHARS,
};
pub use enhancement::{MergeSummary, SuggestionPayload};
pub use schedule::{analyze_dependencies, prioritize};
pub use stage::{PlanningStage, PLANNER_SOURCE, TASKS_GENERATED};
pub use stats::TaskStatistics;
pub use templates::{TaskTemplate, TemplateCatalog, DESCRIPTION_PLACEHOLDER, TYPE_PLACEHOLDER};
