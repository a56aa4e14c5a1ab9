//! HTTP delivery of queue messages to the target service.
//!
//! Each message becomes one `POST` carrying the raw body and the `X-Aws-Sqsd-*`
//! headers a Beanstalk worker expects. Only a `200 OK` counts as success.

use async_trait::async_trait;
use chrono::SecondsFormat;
use queue_runtime::{MessageAttributeValue, ReceivedMessage};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "delivery_tests.rs"]
mod tests;

pub const SQSD_USER_AGENT: &str = "aws-sqsd";
pub const HEADER_MESSAGE_ID: &str = "x-aws-sqsd-msgid";
pub const HEADER_QUEUE: &str = "x-aws-sqsd-queue";
pub const HEADER_RECEIVE_COUNT: &str = "x-aws-sqsd-receive-count";
pub const HEADER_FIRST_RECEIVED_AT: &str = "x-aws-sqsd-first-received-at";
/// Prefix for headers carrying custom message attributes
pub const HEADER_ATTRIBUTE_PREFIX: &str = "x-aws-sqsd-attr-";

// ============================================================================
// Error Types
// ============================================================================

/// Failure of a single delivery attempt
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Target responded with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Delivery timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Invalid delivery request: {message}")]
    InvalidRequest { message: String },
}

impl DeliveryError {
    /// HTTP status of a rejected delivery
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

// ============================================================================
// Delivery Interface
// ============================================================================

/// Hands one message to the consumer.
#[async_trait]
pub trait MessageDelivery: Send + Sync {
    /// `Ok` only when the consumer accepted the message
    async fn deliver(&self, message: &ReceivedMessage) -> Result<(), DeliveryError>;
}

/// Settings for [`HttpDeliveryExecutor`]
#[derive(Debug, Clone)]
pub struct HttpDeliveryConfig {
    pub target_url: url::Url,
    pub content_type: String,
    /// Whole-request timeout, connection through response body
    pub timeout: Duration,
    /// Queue name sent in `X-Aws-Sqsd-Queue`
    pub queue_name: String,
    /// Log request headers and response status at debug level
    pub verbose: bool,
}

/// Delivers messages as HTTP `POST` requests
#[derive(Debug, Clone)]
pub struct HttpDeliveryExecutor {
    client: reqwest::Client,
    config: HttpDeliveryConfig,
}

impl HttpDeliveryExecutor {
    pub fn new(config: HttpDeliveryConfig) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DeliveryError::InvalidRequest {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpDeliveryConfig {
        &self.config
    }
}

#[async_trait]
impl MessageDelivery for HttpDeliveryExecutor {
    async fn deliver(&self, message: &ReceivedMessage) -> Result<(), DeliveryError> {
        let headers = build_headers(message, &self.config.queue_name, &self.config.content_type)?;

        if self.config.verbose {
            debug!(
                message_id = %message.message_id,
                url = %self.config.target_url,
                headers = ?headers,
                "Sending message to target"
            );
        }

        let response = self
            .client
            .post(self.config.target_url.clone())
            .headers(headers)
            .body(message.body.clone())
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if self.config.verbose {
            debug!(
                message_id = %message.message_id,
                status = status.as_u16(),
                "Target responded"
            );
        }

        // The body of an accepted delivery is never read
        if status == StatusCode::OK {
            return Ok(());
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => format!("<failed to read response body: {}>", e),
        };

        Err(DeliveryError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

impl HttpDeliveryExecutor {
    fn classify(&self, error: reqwest::Error) -> DeliveryError {
        if error.is_timeout() {
            DeliveryError::Timeout {
                timeout: self.config.timeout,
            }
        } else {
            DeliveryError::Transport {
                message: error.to_string(),
            }
        }
    }
}

// ============================================================================
// Header Mapping
// ============================================================================

/// Build the request headers for `message`.
///
/// Binary attributes are not forwarded. A custom attribute whose name or value
/// cannot be carried in an HTTP header is skipped with a warning.
pub fn build_headers(
    message: &ReceivedMessage,
    queue_name: &str,
    content_type: &str,
) -> Result<HeaderMap, DeliveryError> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(SQSD_USER_AGENT));
    headers.insert(CONTENT_TYPE, header_value("Content-Type", content_type)?);
    headers.insert(
        HeaderName::from_static(HEADER_MESSAGE_ID),
        header_value("message id", message.message_id.as_str())?,
    );
    headers.insert(
        HeaderName::from_static(HEADER_QUEUE),
        header_value("queue name", queue_name)?,
    );
    headers.insert(
        HeaderName::from_static(HEADER_RECEIVE_COUNT),
        header_value("receive count", message.approximate_receive_count())?,
    );
    headers.insert(
        HeaderName::from_static(HEADER_FIRST_RECEIVED_AT),
        header_value("first received at", &first_received_at(message))?,
    );

    for (name, value) in &message.message_attributes {
        let MessageAttributeValue::String { value, .. } = value else {
            continue;
        };

        let header_name = HeaderName::try_from(format!("{}{}", HEADER_ATTRIBUTE_PREFIX, name));
        let header_value = HeaderValue::from_str(value);
        match (header_name, header_value) {
            (Ok(header_name), Ok(header_value)) => {
                headers.insert(header_name, header_value);
            }
            _ => warn!(
                message_id = %message.message_id,
                attribute = %name,
                "Skipping message attribute that is not a valid HTTP header"
            ),
        }
    }

    Ok(headers)
}

/// `ApproximateFirstReceiveTimestamp` as RFC 3339 in UTC, e.g. `2023-11-14T22:13:20Z`
pub fn first_received_at(message: &ReceivedMessage) -> String {
    message
        .approximate_first_receive_timestamp()
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn header_value(field: &str, value: &str) -> Result<HeaderValue, DeliveryError> {
    HeaderValue::from_str(value).map_err(|e| DeliveryError::InvalidRequest {
        message: format!("{} is not a valid header value: {}", field, e),
    })
}
