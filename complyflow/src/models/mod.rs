//! Domain records shared by the orchestrator and the planner.

mod obligation;
mod status;
mod task;

pub use obligation::{DeadlineType, Obligation, ObligationCategory, ObligationSeverity};
pub use status::{ProcessingStage, ProcessingStatus, ProcessingStatusRecord, StatusUpdate};
pub use task::{Task, TaskPriority, TaskStatus};
