//! Stage orchestration.
//!
//! Each pipeline stage is a stateless, message-driven worker: a
//! [`StageOrchestrator`] takes trigger messages off the stage's queue, runs
//! the stage's [`StageHandler`] under the dependency's circuit breaker and the
//! retry policy, and records every attempt in the processing status store,
//! which is the only durable pipeline state.
//!
//! [`StaleRecordReconciler`] and [`DeadLetterProcessor`] are the two recovery
//! paths: one for workers that died mid-stage, one for triggers that failed
//! terminally.

mod dead_letter;
mod reconcile;
mod runner;
mod stage;
mod tracker;


pub use dead_letter::{
    DeadLetterProcessor, DeadLetterReport, RecoveryAction, RecoveryResult, MAX_RECOVERY_ATTEMPTS,
};
pub use reconcile::{ReconcileReport, StaleRecordReconciler, TIMED_OUT_MESSAGE};
pub use runner::{BatchReport, MessageOutcome, SkipReason, StageOrchestrator, STATUS_MESSAGE_LIMIT};
pub use stage::{Invocation, StageHandler, StageOutcome};
pub use tracker::{BeginOutcome, StatusTracker};
