//! # Queue Runtime
//!
//! Queue access for the relay: a provider-agnostic [`QueueClient`] trait, an
//! AWS SQS implementation over the HTTP query API, an in-memory queue for
//! tests, and the provisioning flow that creates a queue and subscribes it to
//! SNS topics.
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all queue operations
//! - [`message`] - Received messages, attributes and receipt handles
//! - [`client`] - The client trait and receive options
//! - [`provider`] - AWS configuration and credential resolution
//! - [`provisioning`] - Queue creation and topic subscription
//! - [`providers`] - Concrete queue implementations

pub mod client;
pub mod error;
pub mod message;
pub mod provider;
pub mod providers;
pub mod provisioning;

// Re-export commonly used types at crate root for convenience
pub use client::{QueueClient, ReceiveOptions, MAX_RECEIVE_BATCH, MAX_WAIT_TIME};
pub use error::{ConfigurationError, QueueError, ValidationError};
pub use message::{
    MessageAttributeValue, MessageId, QueueName, ReceiptHandle, ReceivedMessage,
    ATTR_FIRST_RECEIVE_TIMESTAMP, ATTR_RECEIVE_COUNT,
};
pub use provider::{AwsCredentials, AwsSqsConfig};
pub use providers::{
    AwsError, AwsProvisioningClient, AwsSqsProvider, CredentialSource, InMemoryQueue,
};
pub use provisioning::{
    create_and_subscribe, send_policy_document, CreateQueueOptions, CreateRetryPolicy,
    ProvisioningApi, ProvisioningError,
};
