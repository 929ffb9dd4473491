//! Recording queue/notification channels and a scripted text generator.

use crate::errors::{ComplyflowError, Fault};
use crate::messages::{NotificationEvent, NotificationMessage};
use crate::ports::{NotificationSink, QueuePublisher, TextGenerator};
use crate::resilience::ErrorCategory;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

/// Queue publisher that keeps every published body.
#[derive(Debug, Default)]
pub struct RecordingQueuePublisher {
    published: Mutex<Vec<(String, Value)>>,
    failing: AtomicBool,
}

impl RecordingQueuePublisher {
    /// Creates an empty publisher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every publish fail while `failing` is set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns the bodies published to `queue`, in order.
    #[must_use]
    pub fn messages(&self, queue: &str) -> Vec<Value> {
        self.published
            .lock()
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, body)| body.clone())
            .collect()
    }

    /// Returns every `(queue, body)` pair, in order.
    #[must_use]
    pub fn all(&self) -> Vec<(String, Value)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl QueuePublisher for RecordingQueuePublisher {
    async fn publish(&self, queue: &str, body: &Value) -> Result<(), ComplyflowError> {
        if self.failing.load(Ordering::SeqCst) {
            let message = format!("queue {queue} unavailable");
            return Err(Fault::from_code("ServiceUnavailable", message).into());
        }
        self.published.lock().push((queue.to_string(), body.clone()));
        Ok(())
    }
}

/// Notification sink that keeps every notification.
#[derive(Debug, Default)]
pub struct RecordingNotificationSink {
    sent: Mutex<Vec<NotificationMessage>>,
}

impl RecordingNotificationSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every notification, in order.
    #[must_use]
    pub fn all(&self) -> Vec<NotificationMessage> {
        self.sent.lock().clone()
    }

    /// Returns the event kinds, in order.
    #[must_use]
    pub fn events(&self) -> Vec<NotificationEvent> {
        self.sent.lock().iter().map(|n| n.event_type).collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotificationSink {
    async fn notify(&self, notification: &NotificationMessage) -> Result<(), ComplyflowError> {
        self.sent.lock().push(notification.clone());
        Ok(())
    }
}

/// Text generator that replays scripted responses and records prompts.
///
/// Once the script runs out every call fails with a service-unavailable
/// fault.
#[derive(Debug, Default)]
pub struct ScriptedTextGenerator {
    responses: Mutex<VecDeque<Result<String, Fault>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedTextGenerator {
    /// Creates a generator with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a successful response.
    #[must_use]
    pub fn respond(self, text: impl Into<String>) -> Self {
        self.responses.lock().push_back(Ok(text.into()));
        self
    }

    /// Queues a failure.
    #[must_use]
    pub fn fail(self, fault: Fault) -> Self {
        self.responses.lock().push_back(Err(fault));
        self
    }

    /// Returns every prompt received.
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedTextGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, ComplyflowError> {
        self.prompts.lock().push(prompt.to_string());
        let next = self.responses.lock().pop_front();
        match next {
            Some(Ok(text)) => Ok(text),
            Some(Err(fault)) => Err(fault.into()),
            None => {
                Err(Fault::new(ErrorCategory::ServiceUnavailable, "no scripted response").into())
            }
        }
    }
}
