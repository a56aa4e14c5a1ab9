//! AWS provider configuration and credential resolution.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};

/// AWS SQS configuration
///
/// Every field is optional. Without explicit keys, credentials come from the
/// standard AWS chain: environment variables, shared config and credentials
/// files, web identity, ECS task role, then EC2 instance metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsSqsConfig {
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    /// Endpoint override for SQS and SNS (LocalStack, tests)
    pub endpoint_url: Option<String>,
    /// Named profile in the shared config files, instead of `AWS_PROFILE`
    pub profile: Option<String>,
    /// Shared credentials file, instead of `~/.aws/credentials`
    pub shared_credentials_file: Option<String>,
}

impl AwsSqsConfig {
    /// Whether explicit keys are configured or set in the environment, in
    /// which case the credential chain is not consulted
    pub fn has_static_credentials_with<F>(&self, lookup: F) -> bool
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.is_empty());
        set(&self.access_key_id)
            || set(&self.secret_access_key)
            || set(&lookup("AWS_ACCESS_KEY_ID"))
    }

    /// Resolve the region from config, the environment, then the queue URL host
    pub fn region(&self, queue_url: Option<&str>) -> Result<String, ConfigurationError> {
        resolve_region_with(self, queue_url, |key| std::env::var(key).ok())
    }

    /// Base URL for an AWS service in a region, honouring the endpoint override
    pub fn service_endpoint(&self, service: &str, region: &str) -> String {
        match &self.endpoint_url {
            Some(endpoint) if !endpoint.is_empty() => endpoint.trim_end_matches('/').to_string(),
            _ => format!("https://{}.{}.amazonaws.com", service, region),
        }
    }
}

/// Static AWS credentials used for request signing
#[derive(Clone, PartialEq, Eq)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl AwsCredentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    /// Resolve credentials using `lookup` for environment variables.
    ///
    /// Explicit configuration wins over `AWS_ACCESS_KEY_ID`,
    /// `AWS_SECRET_ACCESS_KEY` and `AWS_SESSION_TOKEN`.
    pub fn resolve_with<F>(config: &AwsSqsConfig, lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let pick = |configured: &Option<String>, env_key: &str| {
            configured
                .clone()
                .filter(|v| !v.is_empty())
                .or_else(|| lookup(env_key).filter(|v| !v.is_empty()))
        };

        let access_key_id =
            pick(&config.access_key_id, "AWS_ACCESS_KEY_ID").ok_or(ConfigurationError::Missing {
                key: "AWS_ACCESS_KEY_ID".to_string(),
            })?;
        let secret_access_key = pick(&config.secret_access_key, "AWS_SECRET_ACCESS_KEY").ok_or(
            ConfigurationError::Missing {
                key: "AWS_SECRET_ACCESS_KEY".to_string(),
            },
        )?;
        let session_token = pick(&config.session_token, "AWS_SESSION_TOKEN");

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Region resolution with an injectable environment lookup
pub fn resolve_region_with<F>(
    config: &AwsSqsConfig,
    queue_url: Option<&str>,
    lookup: F,
) -> Result<String, ConfigurationError>
where
    F: Fn(&str) -> Option<String>,
{
    config
        .region
        .clone()
        .filter(|r| !r.is_empty())
        .or_else(|| lookup("AWS_REGION").filter(|r| !r.is_empty()))
        .or_else(|| lookup("AWS_DEFAULT_REGION").filter(|r| !r.is_empty()))
        .or_else(|| queue_url.and_then(region_from_queue_url))
        .ok_or(ConfigurationError::Missing {
            key: "AWS_REGION".to_string(),
        })
}

/// Extract the region from `sqs.<region>.amazonaws.com` or the legacy
/// `<region>.queue.amazonaws.com` host.
pub fn region_from_queue_url(queue_url: &str) -> Option<String> {
    let parsed = url::Url::parse(queue_url).ok()?;
    let host = parsed.host_str()?;
    let labels: Vec<&str> = host.split('.').collect();

    match labels.as_slice() {
        ["sqs", region, "amazonaws", ..] => Some(region.to_string()),
        [region, "queue", "amazonaws", ..] => Some(region.to_string()),
        _ => None,
    }
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
