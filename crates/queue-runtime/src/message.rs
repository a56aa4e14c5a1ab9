//! Message types for queue operations including core domain identifiers.

use crate::error::ValidationError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// System attribute carrying the epoch-millisecond time of the first receive.
pub const ATTR_FIRST_RECEIVE_TIMESTAMP: &str = "ApproximateFirstReceiveTimestamp";

/// System attribute carrying how many times the message has been received.
pub const ATTR_RECEIVE_COUNT: &str = "ApproximateReceiveCount";

/// Maximum length of an SQS queue name, including any `.fifo` suffix.
const MAX_QUEUE_NAME_LENGTH: usize = 80;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated queue name with length and character restrictions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        if name.is_empty() || name.len() > MAX_QUEUE_NAME_LENGTH {
            return Err(ValidationError::OutOfRange {
                field: "queue_name".to_string(),
                message: format!("must be 1-{} characters", MAX_QUEUE_NAME_LENGTH),
            });
        }

        let base = name.strip_suffix(".fifo").unwrap_or(&name);
        if base.is_empty()
            || !base
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "only ASCII alphanumeric, hyphens, underscores and a .fifo suffix allowed"
                    .to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Resolve the queue name from a queue URL.
    ///
    /// The name is the final path segment, e.g.
    /// `https://sqs.eu-west-1.amazonaws.com/123456789012/orders` yields `orders`.
    pub fn from_queue_url(queue_url: &str) -> Result<Self, ValidationError> {
        let segment = queue_url.rsplit('/').next().unwrap_or_default();
        if segment.is_empty() {
            return Err(ValidationError::InvalidFormat {
                field: "queue_url".to_string(),
                message: format!("'{}' has no trailing queue name segment", queue_url),
            });
        }

        Self::new(segment.to_string())
    }

    /// Get queue name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// Queue-assigned identifier of a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate a random message ID (used by the in-memory provider)
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Opaque token for acknowledging one specific delivery of a message.
///
/// Only valid until the visibility timeout of that delivery elapses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Get handle string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Message Attributes
// ============================================================================

/// Typed value of a user-defined message attribute.
///
/// SQS data types are `String`, `Number` or `Binary`, optionally followed by a
/// custom label (`Number.float`, `Binary.png`). The label is kept in
/// `data_type`; the variant follows the base type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageAttributeValue {
    String { data_type: String, value: String },
    Binary { data_type: String, value: Bytes },
}

impl MessageAttributeValue {
    /// Plain `String` attribute
    pub fn string(value: impl Into<String>) -> Self {
        Self::String {
            data_type: "String".to_string(),
            value: value.into(),
        }
    }

    /// Plain `Binary` attribute
    pub fn binary(value: impl Into<Bytes>) -> Self {
        Self::Binary {
            data_type: "Binary".to_string(),
            value: value.into(),
        }
    }

    /// Build an attribute from the raw parts of a receive response.
    pub fn from_parts(
        data_type: String,
        string_value: Option<String>,
        binary_value: Option<Bytes>,
    ) -> Self {
        if is_binary_type(&data_type) {
            Self::Binary {
                data_type,
                value: binary_value.unwrap_or_default(),
            }
        } else {
            Self::String {
                data_type,
                value: string_value.unwrap_or_default(),
            }
        }
    }

    pub fn data_type(&self) -> &str {
        match self {
            Self::String { data_type, .. } | Self::Binary { data_type, .. } => data_type,
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary { .. })
    }

    /// String form of the value; `None` for binary attributes
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String { value, .. } => Some(value),
            Self::Binary { .. } => None,
        }
    }
}

fn is_binary_type(data_type: &str) -> bool {
    data_type.split('.').next() == Some("Binary")
}

// ============================================================================
// Message Types
// ============================================================================

/// A message received from the queue.
///
/// Immutable once received. It ends either deleted through its receipt handle
/// or abandoned until the visibility timeout makes it receivable again.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub body: Bytes,
    pub receipt_handle: ReceiptHandle,
    /// System attributes, keyed by attribute name
    pub attributes: HashMap<String, String>,
    /// User-defined attributes
    pub message_attributes: HashMap<String, MessageAttributeValue>,
}

impl ReceivedMessage {
    pub fn new(message_id: MessageId, body: Bytes, receipt_handle: ReceiptHandle) -> Self {
        Self {
            message_id,
            body,
            receipt_handle,
            attributes: HashMap::new(),
            message_attributes: HashMap::new(),
        }
    }

    /// Add a system attribute
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Add a user-defined attribute
    pub fn with_message_attribute(
        mut self,
        name: impl Into<String>,
        value: MessageAttributeValue,
    ) -> Self {
        self.message_attributes.insert(name.into(), value);
        self
    }

    /// The `ApproximateReceiveCount` attribute verbatim, empty when absent
    pub fn approximate_receive_count(&self) -> &str {
        self.attributes
            .get(ATTR_RECEIVE_COUNT)
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// The `ApproximateFirstReceiveTimestamp` attribute as a UTC time.
    ///
    /// Lenient: an absent, non-numeric or out-of-range value yields the Unix
    /// epoch rather than an error.
    pub fn approximate_first_receive_timestamp(&self) -> DateTime<Utc> {
        self.attributes
            .get(ATTR_FIRST_RECEIVE_TIMESTAMP)
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
