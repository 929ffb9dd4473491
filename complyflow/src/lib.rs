//! # Complyflow
//!
//! The processing core of a compliance-document pipeline.
//!
//! Documents move through `upload → analysis → planning → reporting`; each
//! stage is a stateless worker fed by a queue. Complyflow provides:
//!
//! - **Resilient calls**: error classification, exponential backoff, retries,
//!   and per-dependency circuit breakers composed explicitly at the call site
//! - **Stage orchestration**: status records, next-stage triggers,
//!   dead-lettering, notifications, redrive, and stale-record reconciliation
//! - **Task planning**: template-driven tasks from extracted obligations,
//!   optionally refined by a text-generation service
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use complyflow::prelude::*;
//! use std::sync::Arc;
//!
//! let config = Arc::new(PipelineConfig::from_env()?);
//! let planning = PlanningStage::new(obligations, tasks, config.clone())
//!     .with_generator(generator);
//! let orchestrator = StageOrchestrator::new(
//!     Arc::new(planning),
//!     status_store,
//!     publisher,
//!     notifier,
//!     config,
//! );
//!
//! let report = orchestrator.handle_batch(&messages).await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod errors;
pub mod messages;
pub mod models;
pub mod observability;
pub mod orchestrator;
pub mod planning;
pub mod ports;
pub mod resilience;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{PipelineConfig, PLANNER_DEPENDENCY, TEXT_GENERATION_DEPENDENCY};
    pub use crate::errors::{CircuitOpenError, ComplyflowError, Fault, PlanningError};
    pub use crate::messages::{
        DeadLetterMessage, NotificationEvent, NotificationMessage, StageTrigger,
    };
    pub use crate::models::{
        DeadlineType, Obligation, ObligationCategory, ObligationSeverity, ProcessingStage,
        ProcessingStatus, ProcessingStatusRecord, Task, TaskPriority, TaskStatus,
    };
    pub use crate::observability::{init_tracing, ErrorMetrics, LogFormat};
    pub use crate::orchestrator::{
        BatchReport, DeadLetterProcessor, MessageOutcome, StageHandler, StageOrchestrator,
        StageOutcome, StaleRecordReconciler, StatusTracker,
    };
    pub use crate::planning::{PlanningResult, PlanningStage, TaskPlanner, TaskStatistics};
    pub use crate::ports::{
        NotificationSink, ObligationStore, QueuePublisher, StatusStore, TaskStore, TextGenerator,
    };
    pub use crate::resilience::{
        CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, Classify, ErrorCategory,
        ExponentialBackoff, ResilientCaller, RetryExecutor,
    };
    pub use crate::utils::{iso_timestamp, now_utc, Timestamp};
}
