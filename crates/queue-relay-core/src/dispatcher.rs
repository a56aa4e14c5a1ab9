//! # Dispatcher
//!
//! The receive loop. Each iteration long-polls the queue and hands every
//! received message to its own task, after waiting for a slot on the
//! [`ConcurrencyGate`]. A task delivers the message and deletes it only after
//! a successful delivery; anything else leaves the message to reappear once
//! its visibility timeout lapses.
//!
//! Failed deliveries are never retried here. Redelivery is the queue's job.

use crate::delivery::MessageDelivery;
use crate::gate::ConcurrencyGate;
use queue_runtime::{MessageId, QueueClient, QueueError, ReceiveOptions, ReceivedMessage};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub receive: ReceiveOptions,
    /// Pause after a failed receive before polling again
    pub receive_error_backoff: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            receive: ReceiveOptions::default(),
            receive_error_backoff: Duration::from_secs(2),
        }
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Result of one message's delivery task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Delivered and deleted from the queue
    Acknowledged { message_id: MessageId },

    /// Delivered, but the delete failed; the message will be delivered again
    DeliveredNotAcknowledged { message_id: MessageId },

    /// Delivery failed; the message stays on the queue
    Failed { message_id: MessageId },
}

impl DeliveryOutcome {
    pub fn message_id(&self) -> &MessageId {
        match self {
            Self::Acknowledged { message_id }
            | Self::DeliveredNotAcknowledged { message_id }
            | Self::Failed { message_id } => message_id,
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        matches!(self, Self::Acknowledged { .. })
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

pub struct Dispatcher {
    queue: Arc<dyn QueueClient>,
    delivery: Arc<dyn MessageDelivery>,
    gate: Arc<ConcurrencyGate>,
    settings: DispatcherSettings,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn QueueClient>,
        delivery: Arc<dyn MessageDelivery>,
        gate: Arc<ConcurrencyGate>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            queue,
            delivery,
            gate,
            settings,
        }
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    /// Receive once and spawn a delivery task per message, in receive order.
    ///
    /// Returns the number of messages dispatched.
    pub async fn poll_once(
        &self,
        tasks: &mut JoinSet<DeliveryOutcome>,
    ) -> Result<usize, QueueError> {
        let messages = self.queue.receive_messages(&self.settings.receive).await?;
        let count = messages.len();

        for message in messages {
            let permit = self.gate.acquire().await;
            let queue = Arc::clone(&self.queue);
            let delivery = Arc::clone(&self.delivery);

            debug!(
                message_id = %message.message_id,
                open_deliveries = self.gate.value(),
                "Dispatching message"
            );

            tasks.spawn(async move {
                let outcome = process_message(queue.as_ref(), delivery.as_ref(), message).await;
                // Held until the delete has completed
                drop(permit);
                outcome
            });
        }

        Ok(count)
    }

    /// Poll forever
    pub async fn run(&self) {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Poll until `shutdown` resolves, then wait for in-flight deliveries.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut tasks = JoinSet::new();

        info!(
            queue_url = %self.queue.queue_url(),
            max_connections = self.gate.limit(),
            "Dispatcher started"
        );

        loop {
            reap_finished(&mut tasks);

            tokio::select! {
                biased;

                _ = &mut shutdown => break,

                result = self.poll_once(&mut tasks) => {
                    if let Err(e) = result {
                        error!(
                            queue_url = %self.queue.queue_url(),
                            error = %e,
                            backoff_ms = self.settings.receive_error_backoff.as_millis() as u64,
                            "Failed to receive messages"
                        );
                        tokio::select! {
                            biased;
                            _ = &mut shutdown => break,
                            _ = tokio::time::sleep(self.settings.receive_error_backoff) => {}
                        }
                    }
                }
            }
        }

        info!(
            in_flight = tasks.len(),
            "Shutdown requested, waiting for in-flight deliveries"
        );
        while let Some(joined) = tasks.join_next().await {
            log_join_result(joined);
        }
        info!("Dispatcher stopped");
    }
}

/// Deliver `message` and delete it if the consumer accepted it
pub async fn process_message(
    queue: &dyn QueueClient,
    delivery: &dyn MessageDelivery,
    message: ReceivedMessage,
) -> DeliveryOutcome {
    let message_id = message.message_id.clone();

    if let Err(e) = delivery.deliver(&message).await {
        warn!(
            message_id = %message_id,
            receive_count = message.approximate_receive_count(),
            error = %e,
            "Delivery failed, message left for redelivery"
        );
        return DeliveryOutcome::Failed { message_id };
    }

    match queue.delete_message(&message.receipt_handle).await {
        Ok(()) => {
            debug!(message_id = %message_id, "Message delivered and deleted");
            DeliveryOutcome::Acknowledged { message_id }
        }
        Err(e) if e.is_stale_receipt() => {
            warn!(
                message_id = %message_id,
                error = %e,
                "Message delivered but its receipt had expired; it will be delivered again"
            );
            DeliveryOutcome::DeliveredNotAcknowledged { message_id }
        }
        Err(e) => {
            error!(
                message_id = %message_id,
                error = %e,
                "Message delivered but could not be deleted"
            );
            DeliveryOutcome::DeliveredNotAcknowledged { message_id }
        }
    }
}

fn reap_finished(tasks: &mut JoinSet<DeliveryOutcome>) {
    while let Some(joined) = tasks.try_join_next() {
        log_join_result(joined);
    }
}

fn log_join_result(joined: Result<DeliveryOutcome, tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Delivery task panicked or was cancelled");
    }
}
