//! Client trait and receive options for queue operations.

use crate::error::{QueueError, ValidationError};
use crate::message::{ReceiptHandle, ReceivedMessage};
use async_trait::async_trait;
use std::time::Duration;

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// Largest batch a single receive may return (SQS limit)
pub const MAX_RECEIVE_BATCH: u32 = 10;

/// Longest long-poll wait a single receive may request (SQS limit)
pub const MAX_WAIT_TIME: Duration = Duration::from_secs(20);

/// Interface the relay needs from a queue service.
///
/// Implementations are shared read-only across all delivery tasks.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Long-poll for up to `options.max_messages` messages.
    ///
    /// An empty vector means the wait elapsed with nothing available.
    async fn receive_messages(
        &self,
        options: &ReceiveOptions,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    /// Acknowledge one delivery of a message by removing it from the queue.
    ///
    /// A receipt that is already deleted or past its visibility timeout
    /// yields [`QueueError::MessageNotFound`].
    async fn delete_message(&self, receipt: &ReceiptHandle) -> Result<(), QueueError>;

    /// The locator of the queue this client reads from
    fn queue_url(&self) -> &str;
}

/// Configuration options for receiving messages from queues
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// Maximum number of messages to receive in a batch
    pub max_messages: u32,
    /// Long-poll wait before an empty receive returns
    pub wait_time: Duration,
    /// How long received messages stay hidden from other receivers
    pub visibility_timeout: Duration,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            max_messages: 1,
            wait_time: MAX_WAIT_TIME,
            visibility_timeout: Duration::from_secs(60),
        }
    }
}

impl ReceiveOptions {
    /// Create new receive options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum number of messages to receive
    pub fn with_max_messages(mut self, max: u32) -> Self {
        self.max_messages = max;
        self
    }

    /// Set long-poll wait time
    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    /// Set visibility timeout requested on receive
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Check the options against the limits of the queue service
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_messages == 0 || self.max_messages > MAX_RECEIVE_BATCH {
            return Err(ValidationError::OutOfRange {
                field: "max_messages".to_string(),
                message: format!("must be 1-{}", MAX_RECEIVE_BATCH),
            });
        }

        if self.wait_time > MAX_WAIT_TIME {
            return Err(ValidationError::OutOfRange {
                field: "wait_time".to_string(),
                message: format!("must be at most {} seconds", MAX_WAIT_TIME.as_secs()),
            });
        }

        // SQS caps visibility at 12 hours
        if self.visibility_timeout > Duration::from_secs(12 * 60 * 60) {
            return Err(ValidationError::OutOfRange {
                field: "visibility_timeout".to_string(),
                message: "must be at most 43200 seconds".to_string(),
            });
        }

        Ok(())
    }
}
