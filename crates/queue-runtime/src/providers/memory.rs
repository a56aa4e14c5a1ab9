//! In-memory queue for testing and development.
//!
//! Mirrors the SQS behaviour the relay depends on:
//! - Long-poll receives that wait for a send or the wait time to elapse
//! - Visibility timeouts; unacknowledged messages reappear once they lapse
//! - `ApproximateReceiveCount` and `ApproximateFirstReceiveTimestamp`
//! - A fresh receipt handle per delivery, with stale receipts rejected
//!
//! Time is measured with `tokio::time`, so tests may pause and advance the
//! clock.

use crate::client::{QueueClient, ReceiveOptions};
use crate::error::QueueError;
use crate::message::{
    MessageAttributeValue, MessageId, ReceiptHandle, ReceivedMessage,
    ATTR_FIRST_RECEIVE_TIMESTAMP, ATTR_RECEIVE_COUNT,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Upper bound on a single sleep while long-polling, so lapsed visibility
/// timeouts are noticed without a send
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Number of deleted message ids kept for [`InMemoryQueue::deleted_ids`]
pub const DELETED_HISTORY_LIMIT: usize = 1024;

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// A message stored in the queue with delivery metadata
#[derive(Clone)]
struct StoredMessage {
    message_id: MessageId,
    body: Bytes,
    message_attributes: HashMap<String, MessageAttributeValue>,
    receive_count: u32,
    first_received_at: Option<DateTime<Utc>>,
}

/// A message received but not yet deleted
struct InFlightMessage {
    message: StoredMessage,
    visible_at: Instant,
}

#[derive(Default)]
struct QueueState {
    /// Visible messages in send order
    messages: VecDeque<StoredMessage>,
    /// In-flight messages keyed by their current receipt handle
    in_flight: HashMap<String, InFlightMessage>,
    /// Most recent deletions, oldest first, at most `DELETED_HISTORY_LIMIT`
    deleted: VecDeque<MessageId>,
    next_receipt: u64,
}

impl QueueState {
    /// Return lapsed in-flight messages to the visible queue
    fn release_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, m)| m.visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in expired {
            if let Some(entry) = self.in_flight.remove(&receipt) {
                trace!(message_id = %entry.message.message_id, "Visibility timeout lapsed");
                self.messages.push_back(entry.message);
            }
        }
    }

    fn take_batch(
        &mut self,
        max_messages: usize,
        visibility_timeout: Duration,
        now: Instant,
    ) -> Vec<ReceivedMessage> {
        let mut batch = Vec::new();

        while batch.len() < max_messages {
            let Some(mut stored) = self.messages.pop_front() else {
                break;
            };

            stored.receive_count += 1;
            let first_received_at = *stored.first_received_at.get_or_insert_with(Utc::now);

            self.next_receipt += 1;
            let receipt = format!("{}#{}", stored.message_id, self.next_receipt);

            let mut received = ReceivedMessage::new(
                stored.message_id.clone(),
                stored.body.clone(),
                ReceiptHandle::new(receipt.clone()),
            )
            .with_attribute(ATTR_RECEIVE_COUNT, stored.receive_count.to_string())
            .with_attribute(
                ATTR_FIRST_RECEIVE_TIMESTAMP,
                first_received_at.timestamp_millis().to_string(),
            );
            received.message_attributes = stored.message_attributes.clone();

            self.in_flight.insert(
                receipt,
                InFlightMessage {
                    message: stored,
                    visible_at: now + visibility_timeout,
                },
            );
            batch.push(received);
        }

        batch
    }
}

// ============================================================================
// In-Memory Queue
// ============================================================================

/// In-memory queue implementing [`QueueClient`].
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct InMemoryQueue {
    queue_url: String,
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl InMemoryQueue {
    /// Create an empty queue identified by `queue_url`
    pub fn new(queue_url: impl Into<String>) -> Self {
        Self {
            queue_url: queue_url.into(),
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Enqueue a message body without attributes
    pub fn send(&self, body: impl Into<Bytes>) -> MessageId {
        self.send_with_attributes(body, HashMap::new())
    }

    /// Enqueue a message with user-defined attributes
    pub fn send_with_attributes(
        &self,
        body: impl Into<Bytes>,
        message_attributes: HashMap<String, MessageAttributeValue>,
    ) -> MessageId {
        let message_id = MessageId::generate();
        self.lock().messages.push_back(StoredMessage {
            message_id: message_id.clone(),
            body: body.into(),
            message_attributes,
            receive_count: 0,
            first_received_at: None,
        });
        self.notify.notify_waiters();

        message_id
    }

    /// Number of messages currently receivable
    pub fn visible_len(&self) -> usize {
        let mut state = self.lock();
        state.release_expired(Instant::now());
        state.messages.len()
    }

    /// Number of messages received and neither deleted nor lapsed
    pub fn in_flight_len(&self) -> usize {
        let mut state = self.lock();
        state.release_expired(Instant::now());
        state.in_flight.len()
    }

    /// Ids of the most recently deleted messages, in deletion order.
    ///
    /// Only the last [`DELETED_HISTORY_LIMIT`] deletions are kept.
    pub fn deleted_ids(&self) -> Vec<MessageId> {
        self.lock().deleted.iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panic while holding the lock leaves the state consistent
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryQueue")
            .field("queue_url", &self.queue_url)
            .finish()
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn receive_messages(
        &self,
        options: &ReceiveOptions,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        options.validate()?;

        let deadline = Instant::now() + options.wait_time;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let batch = {
                let mut state = self.lock();
                state.release_expired(now);
                state.take_batch(
                    options.max_messages as usize,
                    options.visibility_timeout,
                    now,
                )
            };

            if !batch.is_empty() || now >= deadline {
                return Ok(batch);
            }

            let nap = (deadline - now).min(POLL_INTERVAL);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    async fn delete_message(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let mut state = self.lock();
        state.release_expired(Instant::now());

        match state.in_flight.remove(receipt.as_str()) {
            Some(entry) => {
                if state.deleted.len() == DELETED_HISTORY_LIMIT {
                    state.deleted.pop_front();
                }
                state.deleted.push_back(entry.message.message_id);
                Ok(())
            }
            None => Err(QueueError::MessageNotFound {
                receipt: receipt.as_str().to_string(),
            }),
        }
    }

    fn queue_url(&self) -> &str {
        &self.queue_url
    }
}
