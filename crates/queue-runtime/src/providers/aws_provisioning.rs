//! SQS and SNS query-API implementation of [`ProvisioningApi`].
//!
//! SQS calls go to the configured region. SNS calls are signed for the region
//! embedded in each topic (or subscription) ARN, so topics in other regions
//! can be subscribed.

use super::aws::{xml_name_values, xml_values, AwsError, AwsHttpTransport};
use super::aws_credentials::CredentialSource;
use crate::provider::AwsSqsConfig;
use crate::provisioning::{topic_region, ProvisioningApi, ProvisioningError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::debug;

#[cfg(test)]
#[path = "aws_provisioning_tests.rs"]
mod tests;

const SQS_API_VERSION: &str = "2012-11-05";
const SNS_API_VERSION: &str = "2010-03-31";

/// Provisioning client for AWS SQS and SNS
pub struct AwsProvisioningClient {
    sqs: AwsHttpTransport,
    config: AwsSqsConfig,
    credentials: CredentialSource,
}

impl AwsProvisioningClient {
    /// Create a client, resolving credentials and the SQS region from
    /// `config`, the environment and the AWS credential chain.
    pub async fn new(config: &AwsSqsConfig) -> Result<Self, AwsError> {
        let region = config.region(None)?;
        let credentials = CredentialSource::from_config(config, &region).await?;
        let sqs = AwsHttpTransport::new(
            "sqs",
            &config.service_endpoint("sqs", &region),
            credentials.clone(),
            region,
        )?;

        Ok(Self {
            sqs,
            config: config.clone(),
            credentials,
        })
    }

    /// SNS transport for the region named in `arn`
    fn sns_for(&self, arn: &str) -> Result<AwsHttpTransport, ProvisioningError> {
        let region = topic_region(arn)?;
        AwsHttpTransport::new(
            "sns",
            &self.config.service_endpoint("sns", &region),
            self.credentials.clone(),
            region,
        )
        .map_err(into_provisioning_error)
    }
}

impl std::fmt::Debug for AwsProvisioningClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsProvisioningClient")
            .field("credentials", &self.credentials)
            .finish()
    }
}

fn into_provisioning_error(err: AwsError) -> ProvisioningError {
    ProvisioningError::Queue(err.to_queue_error())
}

fn sqs_params(action: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    params.insert("Action".to_string(), action.to_string());
    params.insert("Version".to_string(), SQS_API_VERSION.to_string());
    params
}

fn sns_params(action: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    params.insert("Action".to_string(), action.to_string());
    params.insert("Version".to_string(), SNS_API_VERSION.to_string());
    params
}

/// First value of `element` in a response, or a missing-field error
fn required_value(xml: &str, element: &str, operation: &str) -> Result<String, ProvisioningError> {
    xml_values(xml, element)
        .map_err(into_provisioning_error)?
        .into_iter()
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
        .ok_or_else(|| ProvisioningError::MissingResponseField {
            operation: operation.to_string(),
            field: element.to_string(),
        })
}

#[async_trait]
impl ProvisioningApi for AwsProvisioningClient {
    async fn find_queue_url(&self, queue_name: &str) -> Result<Option<String>, ProvisioningError> {
        let mut params = sqs_params("ListQueues");
        params.insert("QueueNamePrefix".to_string(), queue_name.to_string());

        let response = self.sqs.call(&params).await.map_err(into_provisioning_error)?;
        let urls = xml_values(&response, "QueueUrl").map_err(into_provisioning_error)?;
        debug!(queue = %queue_name, candidates = urls.len(), "Listed queues by prefix");

        let suffix = format!("/{}", queue_name);
        Ok(urls
            .into_iter()
            .map(|url| url.trim().to_string())
            .find(|url| url.ends_with(&suffix)))
    }

    async fn create_queue(&self, queue_name: &str) -> Result<String, ProvisioningError> {
        let mut params = sqs_params("CreateQueue");
        params.insert("QueueName".to_string(), queue_name.to_string());

        let response = self.sqs.call(&params).await.map_err(|e| match e {
            AwsError::QueueDeletedRecently(_) => ProvisioningError::QueueDeletedRecently {
                queue_name: queue_name.to_string(),
            },
            other => into_provisioning_error(other),
        })?;

        required_value(&response, "QueueUrl", "CreateQueue")
    }

    async fn queue_arn(&self, queue_url: &str) -> Result<String, ProvisioningError> {
        let mut params = sqs_params("GetQueueAttributes");
        params.insert("QueueUrl".to_string(), queue_url.to_string());
        params.insert("AttributeName.1".to_string(), "QueueArn".to_string());

        let response = self.sqs.call(&params).await.map_err(into_provisioning_error)?;
        xml_name_values(&response, "Attribute")
            .map_err(into_provisioning_error)?
            .remove("QueueArn")
            .filter(|arn| !arn.is_empty())
            .ok_or_else(|| ProvisioningError::MissingResponseField {
                operation: "GetQueueAttributes".to_string(),
                field: "QueueArn".to_string(),
            })
    }

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<(), ProvisioningError> {
        let mut params = sqs_params("SetQueueAttributes");
        params.insert("QueueUrl".to_string(), queue_url.to_string());
        for (i, (name, value)) in attributes.iter().enumerate() {
            params.insert(format!("Attribute.{}.Name", i + 1), name.clone());
            params.insert(format!("Attribute.{}.Value", i + 1), value.clone());
        }

        self.sqs.call(&params).await.map_err(into_provisioning_error)?;
        Ok(())
    }

    async fn subscribe(
        &self,
        topic_arn: &str,
        queue_arn: &str,
    ) -> Result<String, ProvisioningError> {
        let sns = self.sns_for(topic_arn)?;
        let mut params = sns_params("Subscribe");
        params.insert("TopicArn".to_string(), topic_arn.to_string());
        params.insert("Protocol".to_string(), "sqs".to_string());
        params.insert("Endpoint".to_string(), queue_arn.to_string());

        let response = sns.call(&params).await.map_err(into_provisioning_error)?;
        required_value(&response, "SubscriptionArn", "Subscribe")
    }

    async fn enable_raw_delivery(&self, subscription_arn: &str) -> Result<(), ProvisioningError> {
        let sns = self.sns_for(subscription_arn)?;
        let mut params = sns_params("SetSubscriptionAttributes");
        params.insert("SubscriptionArn".to_string(), subscription_arn.to_string());
        params.insert("AttributeName".to_string(), "RawMessageDelivery".to_string());
        params.insert("AttributeValue".to_string(), "true".to_string());

        sns.call(&params).await.map_err(into_provisioning_error)?;
        Ok(())
    }
}
