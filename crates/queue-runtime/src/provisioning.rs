//! Queue provisioning: create a queue and subscribe it to SNS topics.
//!
//! [`create_and_subscribe`] drives the sequence over the [`ProvisioningApi`]
//! primitives. The AWS implementation lives in
//! [`crate::providers::AwsProvisioningClient`].

use crate::error::{QueueError, ValidationError};
use crate::message::QueueName;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "provisioning_tests.rs"]
mod tests;

/// Long-poll wait configured on provisioned queues
pub const QUEUE_RECEIVE_WAIT_SECONDS: u64 = 20;

/// Queue attribute names set after subscription
pub const ATTR_POLICY: &str = "Policy";
pub const ATTR_VISIBILITY_TIMEOUT: &str = "VisibilityTimeout";
pub const ATTR_RECEIVE_WAIT_TIME: &str = "ReceiveMessageWaitTimeSeconds";

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while provisioning a queue
#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    #[error("Queue {queue_name} was deleted recently and cannot be recreated yet")]
    QueueDeletedRecently { queue_name: String },

    #[error("Gave up creating queue {queue_name} after {attempts} attempts")]
    RetriesExhausted { queue_name: String, attempts: u32 },

    #[error("Invalid SNS topic ARN '{arn}': {message}")]
    InvalidTopicArn { arn: String, message: String },

    #[error("{operation} returned no {field}")]
    MissingResponseField { operation: String, field: String },

    #[error("Policy document could not be rendered: {message}")]
    Policy { message: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

// ============================================================================
// Provisioning Primitives
// ============================================================================

/// Service operations needed to provision a queue
#[async_trait]
pub trait ProvisioningApi: Send + Sync {
    /// URL of the queue named exactly `queue_name`, if it exists
    async fn find_queue_url(&self, queue_name: &str) -> Result<Option<String>, ProvisioningError>;

    /// Create the queue and return its URL.
    ///
    /// A queue deleted within the last minute yields
    /// [`ProvisioningError::QueueDeletedRecently`].
    async fn create_queue(&self, queue_name: &str) -> Result<String, ProvisioningError>;

    /// ARN of the queue at `queue_url`
    async fn queue_arn(&self, queue_url: &str) -> Result<String, ProvisioningError>;

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<(), ProvisioningError>;

    /// Subscribe the queue to an SNS topic, returning the subscription ARN
    async fn subscribe(
        &self,
        topic_arn: &str,
        queue_arn: &str,
    ) -> Result<String, ProvisioningError>;

    /// Deliver SNS messages to the queue without the SNS JSON envelope
    async fn enable_raw_delivery(&self, subscription_arn: &str) -> Result<(), ProvisioningError>;
}

// ============================================================================
// Options
// ============================================================================

/// Retry policy for `CreateQueue` while a deleted queue of the same name is
/// still being purged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateRetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for CreateRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 12,
            delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateQueueOptions {
    pub queue_name: String,
    pub topic_arns: Vec<String>,
    pub visibility_timeout: Duration,
    pub retry: CreateRetryPolicy,
}

impl CreateQueueOptions {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            topic_arns: Vec::new(),
            visibility_timeout: Duration::from_secs(60),
            retry: CreateRetryPolicy::default(),
        }
    }

    pub fn with_topic_arns(mut self, topic_arns: Vec<String>) -> Self {
        self.topic_arns = topic_arns;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: CreateRetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

// ============================================================================
// Provisioning Flow
// ============================================================================

/// Create the queue, subscribe it to the topics, and return its URL.
///
/// An existing queue of the same name is returned untouched: no
/// subscriptions are added and no attributes change.
pub async fn create_and_subscribe(
    api: &dyn ProvisioningApi,
    options: &CreateQueueOptions,
) -> Result<String, ProvisioningError> {
    let queue_name = QueueName::new(options.queue_name.clone())?;
    for topic_arn in &options.topic_arns {
        topic_region(topic_arn)?;
    }

    debug!(queue = %queue_name, "Looking for existing queue");
    if let Some(url) = api
        .find_queue_url(queue_name.as_str())
        .await?
        .filter(|url| is_exact_queue_url(url, queue_name.as_str()))
    {
        info!(queue = %queue_name, queue_url = %url, "Using existing queue");
        return Ok(url);
    }

    let queue_url = create_with_retry(api, queue_name.as_str(), &options.retry).await?;
    info!(queue = %queue_name, queue_url = %queue_url, "Created queue");

    let queue_arn = api.queue_arn(&queue_url).await?;

    for topic_arn in &options.topic_arns {
        let subscription_arn = api.subscribe(topic_arn, &queue_arn).await?;
        api.enable_raw_delivery(&subscription_arn).await?;
        info!(
            queue_arn = %queue_arn,
            topic_arn = %topic_arn,
            "Subscribed queue to topic"
        );
    }

    let mut attributes = BTreeMap::new();
    attributes.insert(
        ATTR_POLICY.to_string(),
        send_policy_document(&queue_arn, &options.topic_arns)?,
    );
    attributes.insert(
        ATTR_VISIBILITY_TIMEOUT.to_string(),
        options.visibility_timeout.as_secs().to_string(),
    );
    attributes.insert(
        ATTR_RECEIVE_WAIT_TIME.to_string(),
        QUEUE_RECEIVE_WAIT_SECONDS.to_string(),
    );
    api.set_queue_attributes(&queue_url, &attributes).await?;

    debug!(queue_url = %queue_url, "Queue attributes set, provisioning complete");
    Ok(queue_url)
}

async fn create_with_retry(
    api: &dyn ProvisioningApi,
    queue_name: &str,
    retry: &CreateRetryPolicy,
) -> Result<String, ProvisioningError> {
    for attempt in 1..=retry.max_attempts {
        match api.create_queue(queue_name).await {
            Ok(url) => return Ok(url),
            Err(ProvisioningError::QueueDeletedRecently { .. }) => {
                warn!(
                    queue = %queue_name,
                    attempt,
                    delay_secs = retry.delay.as_secs(),
                    "Queue was deleted recently, waiting before retrying"
                );
                if attempt < retry.max_attempts {
                    tokio::time::sleep(retry.delay).await;
                }
            }
            Err(e) => return Err(e),
        }
    }

    Err(ProvisioningError::RetriesExhausted {
        queue_name: queue_name.to_string(),
        attempts: retry.max_attempts,
    })
}

/// Whether `url` names the queue `queue_name` rather than one sharing its prefix
pub fn is_exact_queue_url(url: &str, queue_name: &str) -> bool {
    url.ends_with(&format!("/{}", queue_name))
}

/// Region embedded in an SNS topic ARN (`arn:<partition>:sns:<region>:<account>:<topic>`)
pub fn topic_region(topic_arn: &str) -> Result<String, ProvisioningError> {
    let invalid = |message: &str| ProvisioningError::InvalidTopicArn {
        arn: topic_arn.to_string(),
        message: message.to_string(),
    };

    let parts: Vec<&str> = topic_arn.splitn(6, ':').collect();
    match parts.as_slice() {
        ["arn", partition, "sns", region, account, topic]
            if !partition.is_empty() && !account.is_empty() && !topic.is_empty() =>
        {
            if region.is_empty() {
                Err(invalid("missing region"))
            } else {
                Ok(region.to_string())
            }
        }
        ["arn", _, service, ..] if *service != "sns" => Err(invalid("not an SNS ARN")),
        _ => Err(invalid("expected arn:<partition>:sns:<region>:<account>:<topic>")),
    }
}

// ============================================================================
// Send Policy
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct PolicyDocument<'a> {
    version: &'static str,
    id: String,
    statement: Vec<PolicyStatement<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct PolicyStatement<'a> {
    sid: &'static str,
    effect: &'static str,
    principal: PolicyPrincipal,
    action: &'static str,
    resource: &'a str,
    condition: PolicyCondition<'a>,
}

#[derive(Serialize)]
struct PolicyPrincipal {
    #[serde(rename = "AWS")]
    aws: &'static str,
}

#[derive(Serialize)]
struct PolicyCondition<'a> {
    #[serde(rename = "ArnEquals")]
    arn_equals: SourceArnCondition<'a>,
}

#[derive(Serialize)]
struct SourceArnCondition<'a> {
    #[serde(rename = "aws:SourceArn")]
    source_arn: &'a [String],
}

/// JSON policy allowing the given SNS topics to send to the queue
pub fn send_policy_document(
    queue_arn: &str,
    topic_arns: &[String],
) -> Result<String, ProvisioningError> {
    let document = PolicyDocument {
        version: "2012-10-17",
        id: format!("{}/SQSDefaultPolicy", queue_arn),
        statement: vec![PolicyStatement {
            sid: "",
            effect: "Allow",
            principal: PolicyPrincipal { aws: "*" },
            action: "SQS:SendMessage",
            resource: queue_arn,
            condition: PolicyCondition {
                arn_equals: SourceArnCondition {
                    source_arn: topic_arns,
                },
            },
        }],
    };

    serde_json::to_string(&document).map_err(|e| ProvisioningError::Policy {
        message: e.to_string(),
    })
}
