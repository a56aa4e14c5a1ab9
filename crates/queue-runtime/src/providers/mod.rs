//! Queue provider implementations.
//!
//! - [`aws`]: AWS SQS over the HTTP query API
//! - [`aws_credentials`]: credential sources for request signing
//! - [`aws_provisioning`]: queue creation and SNS subscription for AWS
//! - [`memory`]: in-process queue for tests and local development

pub mod aws;
pub mod aws_credentials;
pub mod aws_provisioning;
pub mod memory;

pub use aws::{AwsError, AwsSqsProvider};
pub use aws_credentials::CredentialSource;
pub use aws_provisioning::AwsProvisioningClient;
pub use memory::InMemoryQueue;
