//! Credential sources for signing SQS and SNS requests.
//!
//! Explicit keys (configuration or `AWS_ACCESS_KEY_ID`) are used as given.
//! Otherwise credentials come from the default AWS provider chain: shared
//! config and credentials files (honouring `AWS_PROFILE`), web identity, the
//! ECS task role and EC2 instance metadata. Chain credentials are cached and
//! refreshed shortly before they expire.

use super::aws::AwsError;
use crate::provider::{AwsCredentials, AwsSqsConfig};
use aws_config::BehaviorVersion;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_credential_types::Credentials;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tracing::{debug, info};

#[cfg(test)]
#[path = "aws_credentials_tests.rs"]
mod tests;

/// Cached chain credentials are refreshed once they expire within this window
pub const REFRESH_BEFORE_EXPIRY: Duration = Duration::from_secs(300);

/// Where request-signing credentials come from
#[derive(Clone)]
pub enum CredentialSource {
    /// Fixed keys from configuration or the environment
    Static(AwsCredentials),
    /// A provider from the AWS credential chain
    Provider(Arc<ProviderCredentials>),
}

/// Chain provider plus the last credentials it returned
pub struct ProviderCredentials {
    provider: SharedCredentialsProvider,
    cached: Mutex<Option<Credentials>>,
}

impl CredentialSource {
    /// Resolve the credential source for `config`, signing for `region`.
    ///
    /// Chain credentials are fetched once here so a missing or broken chain
    /// fails at startup rather than on the first request.
    pub async fn from_config(config: &AwsSqsConfig, region: &str) -> Result<Self, AwsError> {
        Self::resolve_with(config, region, |key| std::env::var(key).ok()).await
    }

    /// Resolve with an injectable environment lookup for explicit keys
    pub async fn resolve_with<F>(
        config: &AwsSqsConfig,
        region: &str,
        lookup: F,
    ) -> Result<Self, AwsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if config.has_static_credentials_with(&lookup) {
            let credentials = AwsCredentials::resolve_with(config, &lookup)?;
            debug!("Using explicitly configured AWS credentials");
            return Ok(Self::Static(credentials));
        }

        let provider = chain_provider(config, region).await?;
        let source = Self::from_provider(provider);
        source.current().await?;
        info!(
            profile = config.profile.as_deref().unwrap_or("default"),
            "Resolved AWS credentials from the provider chain"
        );
        Ok(source)
    }

    /// Wrap any credentials provider
    pub fn from_provider(provider: SharedCredentialsProvider) -> Self {
        Self::Provider(Arc::new(ProviderCredentials {
            provider,
            cached: Mutex::new(None),
        }))
    }

    /// Credentials to sign the next request with
    pub async fn current(&self) -> Result<AwsCredentials, AwsError> {
        match self {
            Self::Static(credentials) => Ok(credentials.clone()),
            Self::Provider(inner) => inner.current().await,
        }
    }
}

impl ProviderCredentials {
    async fn current(&self) -> Result<AwsCredentials, AwsError> {
        let mut cached = self.cached.lock().await;
        if let Some(credentials) = cached.as_ref().filter(|c| !expires_soon(c)) {
            return Ok(to_signing_credentials(credentials));
        }

        let fresh = self
            .provider
            .provide_credentials()
            .await
            .map_err(|e| AwsError::Authentication(format!("Failed to load AWS credentials: {}", e)))?;
        debug!(expiry = ?fresh.expiry(), "Loaded AWS credentials");

        let signing = to_signing_credentials(&fresh);
        *cached = Some(fresh);
        Ok(signing)
    }
}

impl fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(credentials) => f.debug_tuple("Static").field(credentials).finish(),
            Self::Provider(_) => f.write_str("Provider"),
        }
    }
}

fn expires_soon(credentials: &Credentials) -> bool {
    match credentials.expiry() {
        Some(expiry) => expiry <= SystemTime::now() + REFRESH_BEFORE_EXPIRY,
        None => false,
    }
}

fn to_signing_credentials(credentials: &Credentials) -> AwsCredentials {
    AwsCredentials {
        access_key_id: credentials.access_key_id().to_string(),
        secret_access_key: credentials.secret_access_key().to_string(),
        session_token: credentials.session_token().map(str::to_string),
    }
}

// `ProfileFiles` is a deprecated alias for the type `profile_files` takes.
#[allow(deprecated)]
async fn chain_provider(
    config: &AwsSqsConfig,
    region: &str,
) -> Result<SharedCredentialsProvider, AwsError> {
    use aws_config::profile::profile_file::{ProfileFileKind, ProfileFiles};

    let mut loader =
        aws_config::defaults(BehaviorVersion::latest()).region(aws_config::Region::new(region.to_string()));

    if let Some(profile) = config.profile.as_deref().filter(|p| !p.is_empty()) {
        loader = loader.profile_name(profile);
    }

    if let Some(path) = config.shared_credentials_file.as_deref().filter(|p| !p.is_empty()) {
        let files = ProfileFiles::builder()
            .include_default_config_file(true)
            .with_file(ProfileFileKind::Credentials, path)
            .build();
        loader = loader.profile_files(files);
    }

    loader
        .load()
        .await
        .credentials_provider()
        .ok_or_else(|| AwsError::Authentication("No AWS credentials provider available".to_string()))
}
