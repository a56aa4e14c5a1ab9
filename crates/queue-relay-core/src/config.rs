//! Relay configuration.

use crate::dispatcher::DispatcherSettings;
use queue_runtime::{AwsSqsConfig, QueueName, ReceiveOptions};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Configuration errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },
}

/// Complete relay configuration.
///
/// Every field has a default except `queue_url`, which must be supplied or
/// produced by provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// URL of the queue to read from
    pub queue_url: String,

    /// Where messages are POSTed
    pub http_url: String,

    /// `Content-Type` sent with every delivery
    pub content_type: String,

    pub http_timeout_seconds: u64,

    /// How long a received message stays hidden from other receivers
    pub visibility_timeout_seconds: u64,

    /// Maximum number of concurrent open deliveries
    pub max_connections: usize,

    pub max_messages_per_receive: u32,

    pub wait_time_seconds: u64,

    pub receive_error_backoff_millis: u64,

    /// Log delivery request headers and responses
    pub verbose: bool,

    pub aws: AwsSqsConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            queue_url: String::new(),
            http_url: "http://localhost:9900/sqs".to_string(),
            content_type: "application/json".to_string(),
            http_timeout_seconds: 30,
            visibility_timeout_seconds: 60,
            max_connections: 50,
            max_messages_per_receive: 1,
            wait_time_seconds: 20,
            receive_error_backoff_millis: 2000,
            verbose: false,
            aws: AwsSqsConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Check that the configuration can start a relay
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_url.trim().is_empty() {
            return Err(ConfigError::Missing {
                key: "queue_url".to_string(),
            });
        }
        self.queue_name()?;
        self.target_url()?;

        if self.content_type.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "content_type cannot be empty".to_string(),
            });
        }

        if self.http_timeout_seconds == 0 {
            return Err(ConfigError::Invalid {
                message: "http_timeout_seconds must be greater than 0".to_string(),
            });
        }

        if self.max_connections == 0 {
            return Err(ConfigError::Invalid {
                message: "max_connections must be greater than 0".to_string(),
            });
        }

        if self.receive_error_backoff_millis == 0 {
            return Err(ConfigError::Invalid {
                message: "receive_error_backoff_millis must be greater than 0".to_string(),
            });
        }

        self.receive_options()
            .validate()
            .map_err(|e| ConfigError::Invalid {
                message: e.to_string(),
            })?;

        Ok(())
    }

    /// Queue name taken from the last path segment of the queue URL
    pub fn queue_name(&self) -> Result<QueueName, ConfigError> {
        QueueName::from_queue_url(&self.queue_url).map_err(|e| ConfigError::Invalid {
            message: format!("queue_url '{}': {}", self.queue_url, e),
        })
    }

    pub fn target_url(&self) -> Result<url::Url, ConfigError> {
        let parsed = url::Url::parse(&self.http_url).map_err(|e| ConfigError::Invalid {
            message: format!("http_url '{}': {}", self.http_url, e),
        })?;

        match parsed.scheme() {
            "http" | "https" => Ok(parsed),
            other => Err(ConfigError::Invalid {
                message: format!("http_url must use http or https, not '{}'", other),
            }),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }

    pub fn receive_options(&self) -> ReceiveOptions {
        ReceiveOptions::new()
            .with_max_messages(self.max_messages_per_receive)
            .with_wait_time(Duration::from_secs(self.wait_time_seconds))
            .with_visibility_timeout(Duration::from_secs(self.visibility_timeout_seconds))
    }

    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            receive: self.receive_options(),
            receive_error_backoff: Duration::from_millis(self.receive_error_backoff_millis),
        }
    }
}
