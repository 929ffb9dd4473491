//! In-memory collaborators for unit and integration tests.
//!
//! Every port in [`crate::ports`] has an implementation here that records
//! what it was asked to do and can be scripted to fail.

mod channels;
mod stages;
mod stores;

pub use channels::{RecordingNotificationSink, RecordingQueuePublisher, ScriptedTextGenerator};
pub use stages::ScriptedStage;
pub use stores::{InMemoryObligationStore, InMemoryStatusStore, InMemoryTaskStore};
