//! Relay daemon wiring: configuration to a running dispatcher.

use crate::config::{ConfigError, RelayConfig};
use crate::delivery::{DeliveryError, HttpDeliveryConfig, HttpDeliveryExecutor, MessageDelivery};
use crate::dispatcher::Dispatcher;
use crate::gate::ConcurrencyGate;
use queue_runtime::{AwsError, AwsSqsProvider, QueueClient};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;

/// Errors starting or stopping the relay
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Failed to create queue client: {0}")]
    QueueClient(#[from] AwsError),

    #[error("Failed to create delivery client: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Relay task failed: {message}")]
    Runtime { message: String },
}

/// Entry point for starting a relay
pub struct RelayDaemon;

impl RelayDaemon {
    /// Start relaying from the SQS queue in `config`.
    ///
    /// Must be called within a Tokio runtime. Any failure to build the queue
    /// or HTTP client is returned here; nothing is retried.
    pub async fn start(config: RelayConfig) -> Result<RelayHandle, RelayError> {
        config.validate()?;
        let queue = AwsSqsProvider::new(&config.aws, config.queue_url.clone()).await?;
        Self::start_with_queue(config, Arc::new(queue))
    }

    /// Start relaying from an already constructed queue client
    pub fn start_with_queue(
        config: RelayConfig,
        queue: Arc<dyn QueueClient>,
    ) -> Result<RelayHandle, RelayError> {
        config.validate()?;
        let queue_name = config.queue_name()?;

        let delivery = HttpDeliveryExecutor::new(HttpDeliveryConfig {
            target_url: config.target_url()?,
            content_type: config.content_type.clone(),
            timeout: config.http_timeout(),
            queue_name: queue_name.as_str().to_string(),
            verbose: config.verbose,
        })?;

        Ok(Self::start_with(config, queue, Arc::new(delivery)))
    }

    /// Start relaying with explicit queue and delivery implementations
    pub fn start_with(
        config: RelayConfig,
        queue: Arc<dyn QueueClient>,
        delivery: Arc<dyn MessageDelivery>,
    ) -> RelayHandle {
        let gate = Arc::new(ConcurrencyGate::new(config.max_connections));
        let dispatcher = Dispatcher::new(
            Arc::clone(&queue),
            delivery,
            Arc::clone(&gate),
            config.dispatcher_settings(),
        );

        info!(
            queue_url = %config.queue_url,
            http_url = %config.http_url,
            max_connections = config.max_connections,
            "Starting relay"
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            dispatcher
                .run_until(async {
                    // A dropped sender also stops the dispatcher
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        RelayHandle {
            queue_url: config.queue_url,
            gate,
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

/// Handle to a running relay
#[derive(Debug)]
pub struct RelayHandle {
    queue_url: String,
    gate: Arc<ConcurrencyGate>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    /// Number of deliveries currently in progress
    pub fn open_deliveries(&self) -> usize {
        self.gate.value()
    }

    /// Whether the dispatcher has stopped
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop receiving and wait for in-flight deliveries to finish
    pub async fn shutdown(mut self) -> Result<(), RelayError> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }

        (&mut self.task).await.map_err(|e| RelayError::Runtime {
            message: e.to_string(),
        })?;

        info!(queue_url = %self.queue_url, "Relay stopped");
        Ok(())
    }
}
