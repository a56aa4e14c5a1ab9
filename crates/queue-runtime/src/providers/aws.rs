//! AWS SQS provider implementation using the HTTP query API.
//!
//! Requests go straight to the SQS (and, for provisioning, SNS) query
//! endpoints over reqwest and are signed with AWS Signature Version 4. This
//! keeps the provider testable against a mocked HTTP endpoint and avoids the
//! weight of the full AWS SDK.
//!
//! ## Authentication
//!
//! Each request is signed with credentials from a [`CredentialSource`]:
//! explicit keys, or the default AWS provider chain (profiles, web identity,
//! ECS task role, instance metadata). A session token is sent as
//! `x-amz-security-token` and included in the signature.
//!
//! ## Message bodies
//!
//! Bodies are forwarded exactly as stored in the queue. They are not
//! base64-decoded; only `Binary` message attributes are, because SQS always
//! transports those as base64.

use crate::client::{QueueClient, ReceiveOptions};
use crate::error::{ConfigurationError, QueueError};
use crate::message::{
    MessageAttributeValue, MessageId, ReceiptHandle, ReceivedMessage,
    ATTR_FIRST_RECEIVE_TIMESTAMP, ATTR_RECEIVE_COUNT,
};
use super::aws_credentials::CredentialSource;
use crate::provider::{AwsCredentials, AwsSqsConfig};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client as HttpClient;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, trace};

#[cfg(test)]
#[path = "aws_tests.rs"]
mod tests;

/// SQS query API version
const SQS_API_VERSION: &str = "2012-11-05";

/// Whole-request timeout for queue service calls. Must exceed the longest
/// long-poll wait (20 seconds).
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Error Types
// ============================================================================

/// AWS specific errors
#[derive(Debug, thiserror::Error)]
pub enum AwsError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("AWS service error: {code}: {message}")]
    ServiceError { code: String, message: String },

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Queue was deleted recently: {0}")]
    QueueDeletedRecently(String),

    #[error("Invalid receipt handle: {0}")]
    InvalidReceipt(String),

    #[error("Invalid configuration: {0}")]
    ConfigurationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl AwsError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Authentication(_) => false,
            Self::NetworkError(_) => true,
            Self::ServiceError { .. } => true, // Most SQS errors are transient
            Self::QueueNotFound(_) => false,
            Self::QueueDeletedRecently(_) => true,
            Self::InvalidReceipt(_) => false,
            Self::ConfigurationError(_) => false,
            Self::SerializationError(_) => false,
        }
    }

    /// Map AWS error to QueueError
    pub fn to_queue_error(self) -> QueueError {
        match self {
            Self::Authentication(msg) => QueueError::AuthenticationFailed { message: msg },
            Self::NetworkError(msg) => QueueError::ConnectionFailed { message: msg },
            Self::ServiceError { code, message } => QueueError::ProviderError {
                provider: "AwsSqs".to_string(),
                code,
                message,
            },
            Self::QueueNotFound(queue) => QueueError::QueueNotFound { queue_name: queue },
            Self::QueueDeletedRecently(msg) => QueueError::ProviderError {
                provider: "AwsSqs".to_string(),
                code: "QueueDeletedRecently".to_string(),
                message: msg,
            },
            Self::InvalidReceipt(receipt) => QueueError::MessageNotFound { receipt },
            Self::ConfigurationError(msg) => {
                QueueError::Configuration(ConfigurationError::Invalid { message: msg })
            }
            Self::SerializationError(msg) => QueueError::Serialization { message: msg },
        }
    }
}

impl From<ConfigurationError> for AwsError {
    fn from(err: ConfigurationError) -> Self {
        Self::ConfigurationError(err.to_string())
    }
}

// ============================================================================
// AWS Signature V4 Signing
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// AWS Signature Version 4 signer for request authentication
///
/// Implements the AWS Signature V4 signing process:
/// 1. Create canonical request (method, URI, query, headers, payload)
/// 2. Create string to sign (algorithm, timestamp, scope, request hash)
/// 3. Derive signing key (4-level HMAC chain)
/// 4. Calculate signature and build Authorization header
///
/// ## References
///
/// - [AWS Signature V4](https://docs.aws.amazon.com/general/latest/gr/signature-version-4.html)
#[derive(Clone)]
pub(crate) struct AwsV4Signer {
    credentials: AwsCredentials,
    region: String,
    service: String,
}

impl AwsV4Signer {
    pub(crate) fn new(credentials: AwsCredentials, region: String, service: &str) -> Self {
        Self {
            credentials,
            region,
            service: service.to_string(),
        }
    }

    /// Sign an HTTP request with AWS Signature V4
    ///
    /// Returns the headers to add to the request: `Authorization`,
    /// `x-amz-date`, `host` and, with a session token,
    /// `x-amz-security-token`.
    pub(crate) fn sign_request(
        &self,
        method: &str,
        host: &str,
        path: &str,
        query_params: &BTreeMap<String, String>,
        body: &str,
        timestamp: &DateTime<Utc>,
    ) -> Vec<(String, String)> {
        let date_stamp = timestamp.format("%Y%m%d").to_string();
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();

        // Task 1: Create canonical request
        let canonical_query_string = canonical_query(query_params);

        // Canonical headers (must be sorted)
        let mut canonical_headers = format!("host:{}\nx-amz-date:{}\n", host, amz_date);
        let mut signed_headers = "host;x-amz-date".to_string();
        if let Some(token) = &self.credentials.session_token {
            canonical_headers.push_str(&format!("x-amz-security-token:{}\n", token));
            signed_headers.push_str(";x-amz-security-token");
        }

        let payload_hash = format!("{:x}", Sha256::digest(body.as_bytes()));

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, path, canonical_query_string, canonical_headers, signed_headers, payload_hash
        );

        // Task 2: Create string to sign
        let algorithm = "AWS4-HMAC-SHA256";
        let credential_scope = format!(
            "{}/{}/{}/aws4_request",
            date_stamp, self.region, self.service
        );
        let canonical_request_hash = format!("{:x}", Sha256::digest(canonical_request.as_bytes()));

        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            algorithm, amz_date, credential_scope, canonical_request_hash
        );

        // Task 3: Calculate signature
        let signature = self.calculate_signature(&string_to_sign, &date_stamp);

        // Task 4: Build authorization header
        let authorization_header = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            algorithm, self.credentials.access_key_id, credential_scope, signed_headers, signature
        );

        let mut headers = vec![
            ("Authorization".to_string(), authorization_header),
            ("x-amz-date".to_string(), amz_date),
            ("host".to_string(), host.to_string()),
        ];
        if let Some(token) = &self.credentials.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }

        headers
    }

    /// Derive the signing key with the HMAC chain and sign `string_to_sign`
    fn calculate_signature(&self, string_to_sign: &str, date_stamp: &str) -> String {
        let k_secret = format!("AWS4{}", self.credentials.secret_access_key);
        let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, self.service.as_bytes());
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        let signature = hmac_sha256(&k_signing, string_to_sign.as_bytes());

        hex::encode(signature)
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// URI-encoded `k=v` pairs joined by `&`, in key order
fn canonical_query(query_params: &BTreeMap<String, String>) -> String {
    query_params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

// ============================================================================
// Signed HTTP Transport
// ============================================================================

/// Signed query-API transport for one AWS service endpoint.
///
/// Shared by the SQS provider and the provisioning client.
#[derive(Clone)]
pub(crate) struct AwsHttpTransport {
    http_client: HttpClient,
    credentials: CredentialSource,
    service: String,
    region: String,
    endpoint: url::Url,
}

impl AwsHttpTransport {
    pub(crate) fn new(
        service: &str,
        endpoint: &str,
        credentials: CredentialSource,
        region: String,
    ) -> Result<Self, AwsError> {
        let endpoint = url::Url::parse(endpoint).map_err(|e| {
            AwsError::ConfigurationError(format!("Invalid {} endpoint '{}': {}", service, endpoint, e))
        })?;

        if endpoint.host_str().is_none() {
            return Err(AwsError::ConfigurationError(format!(
                "{} endpoint '{}' has no host",
                service, endpoint
            )));
        }

        let http_client = HttpClient::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AwsError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            credentials,
            service: service.to_string(),
            region,
            endpoint,
        })
    }

    /// `host[:port]` as it must appear in the signed `host` header
    fn host(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// Send a signed query-API call and return the XML response body
    pub(crate) async fn call(&self, query_params: &BTreeMap<String, String>) -> Result<String, AwsError> {
        let path = match self.endpoint.path() {
            "" => "/",
            p => p,
        };
        let host = self.host();
        let signer = AwsV4Signer::new(
            self.credentials.current().await?,
            self.region.clone(),
            &self.service,
        );
        let timestamp = Utc::now();
        let auth_headers = signer.sign_request("POST", &host, path, query_params, "", &timestamp);

        let mut url = self.endpoint.clone();
        url.set_query(Some(&canonical_query(query_params)));

        let mut request = self.http_client.post(url);
        for (key, value) in auth_headers {
            request = request.header(key, value);
        }

        trace!(
            action = query_params.get("Action").map(String::as_str).unwrap_or_default(),
            host = %host,
            "Sending AWS query API request"
        );

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AwsError::NetworkError(format!("Request timeout: {}", e))
            } else if e.is_connect() {
                AwsError::NetworkError(format!("Connection failed: {}", e))
            } else {
                AwsError::NetworkError(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status();
        let response_body = response
            .text()
            .await
            .map_err(|e| AwsError::NetworkError(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(parse_error_response(&response_body, status.as_u16()));
        }

        Ok(response_body)
    }
}

// ============================================================================
// XML Response Parsing
// ============================================================================

/// Walk an XML document, reporting each element's text content on close.
///
/// `on_end` receives the element path (outermost first) and the accumulated
/// text of the element that just closed.
fn walk_xml<F>(xml: &str, mut on_end: F) -> Result<(), AwsError>
where
    F: FnMut(&[String], String),
{
    let mut reader = Reader::from_str(xml);
    let mut path: Vec<String> = Vec::new();
    let mut text = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                path.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
                text.clear();
            }
            Ok(Event::Text(e)) => {
                let unescaped = e.unescape().map_err(|e| {
                    AwsError::SerializationError(format!("Failed to parse XML: {}", e))
                })?;
                text.push_str(&unescaped);
            }
            Ok(Event::CData(e)) => {
                text.push_str(&String::from_utf8_lossy(&e.into_inner()));
            }
            Ok(Event::End(_)) => {
                on_end(&path, std::mem::take(&mut text));
                path.pop();
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(AwsError::SerializationError(format!(
                    "XML parsing error: {}",
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(())
}

/// Text of every element with the given local name, in document order
pub(crate) fn xml_values(xml: &str, element: &str) -> Result<Vec<String>, AwsError> {
    let mut values = Vec::new();
    walk_xml(xml, |path, text| {
        if path.last().map(String::as_str) == Some(element) {
            values.push(text);
        }
    })?;
    Ok(values)
}

/// `Name`/`Value` pairs of every `<container>` element (e.g. `Attribute`)
pub(crate) fn xml_name_values(
    xml: &str,
    container: &str,
) -> Result<HashMap<String, String>, AwsError> {
    let mut pairs = HashMap::new();
    let mut name: Option<String> = None;
    let mut value: Option<String> = None;

    walk_xml(xml, |path, text| match tail(path).as_slice() {
        [.., c, "Name"] if *c == container => name = Some(text),
        [.., c, "Value"] if *c == container => value = Some(text),
        [.., c] if *c == container => {
            if let Some(n) = name.take() {
                pairs.insert(n, value.take().unwrap_or_default());
            }
            value = None;
        }
        _ => {}
    })?;

    Ok(pairs)
}

/// The innermost three elements of `path`
fn tail(path: &[String]) -> Vec<&str> {
    path[path.len().saturating_sub(3)..]
        .iter()
        .map(String::as_str)
        .collect()
}

/// Parse an AWS query API error response into an [`AwsError`]
pub(crate) fn parse_error_response(xml: &str, status_code: u16) -> AwsError {
    let code = xml_values(xml, "Code")
        .ok()
        .and_then(|v| v.into_iter().next())
        .unwrap_or_else(|| "Unknown".to_string());
    let message = xml_values(xml, "Message")
        .ok()
        .and_then(|v| v.into_iter().next())
        .unwrap_or_else(|| "Unknown error".to_string());

    match code.as_str() {
        "AWS.SimpleQueueService.NonExistentQueue" | "QueueDoesNotExist" => {
            AwsError::QueueNotFound(message)
        }
        "AWS.SimpleQueueService.QueueDeletedRecently" | "QueueDeletedRecently" => {
            AwsError::QueueDeletedRecently(message)
        }
        "InvalidClientTokenId" | "UnrecognizedClientException" | "SignatureDoesNotMatch" => {
            AwsError::Authentication(format!("{}: {}", code, message))
        }
        "InvalidReceiptHandle" | "ReceiptHandleIsInvalid" => AwsError::InvalidReceipt(message),
        _ if status_code == 401 || status_code == 403 => {
            AwsError::Authentication(format!("{}: {}", code, message))
        }
        _ => AwsError::ServiceError { code, message },
    }
}

/// Message fields collected while parsing a `ReceiveMessage` response
#[derive(Default)]
struct MessageParts {
    message_id: Option<String>,
    receipt_handle: Option<String>,
    body: String,
    attributes: HashMap<String, String>,
    message_attributes: HashMap<String, MessageAttributeValue>,
}

/// One `<MessageAttribute>` in progress
#[derive(Default)]
struct AttributeParts {
    name: Option<String>,
    data_type: Option<String>,
    string_value: Option<String>,
    binary_value: Option<String>,
}

/// Parse a `ReceiveMessage` XML response
pub(crate) fn parse_receive_message_response(
    xml: &str,
) -> Result<Vec<ReceivedMessage>, AwsError> {
    let mut messages = Vec::new();
    let mut current = MessageParts::default();
    let mut attribute_name: Option<String> = None;
    let mut attribute_value: Option<String> = None;
    let mut message_attribute = AttributeParts::default();
    let mut failure: Option<AwsError> = None;

    walk_xml(xml, |path, text| match tail(path).as_slice() {
        [_, "Message", "MessageId"] => current.message_id = Some(text),
        [_, "Message", "ReceiptHandle"] => current.receipt_handle = Some(text),
        [_, "Message", "Body"] => current.body = text,
        [_, "Attribute", "Name"] => attribute_name = Some(text),
        [_, "Attribute", "Value"] => attribute_value = Some(text),
        [_, "Message", "Attribute"] => {
            if let Some(name) = attribute_name.take() {
                current
                    .attributes
                    .insert(name, attribute_value.take().unwrap_or_default());
            }
        }
        [_, "MessageAttribute", "Name"] => message_attribute.name = Some(text),
        ["MessageAttribute", "Value", "DataType"] => message_attribute.data_type = Some(text),
        ["MessageAttribute", "Value", "StringValue"] => {
            message_attribute.string_value = Some(text)
        }
        ["MessageAttribute", "Value", "BinaryValue"] => {
            message_attribute.binary_value = Some(text)
        }
        [_, "Message", "MessageAttribute"] => {
            let parts = std::mem::take(&mut message_attribute);
            let Some(name) = parts.name else { return };
            let binary = match parts.binary_value.map(|v| STANDARD.decode(v.trim())) {
                Some(Ok(decoded)) => Some(Bytes::from(decoded)),
                Some(Err(e)) => {
                    failure.get_or_insert(AwsError::SerializationError(format!(
                        "Base64 decode of attribute '{}' failed: {}",
                        name, e
                    )));
                    None
                }
                None => None,
            };
            let value = MessageAttributeValue::from_parts(
                parts.data_type.unwrap_or_else(|| "String".to_string()),
                parts.string_value,
                binary,
            );
            current.message_attributes.insert(name, value);
        }
        [.., "Message"] => {
            let parts = std::mem::take(&mut current);
            match (parts.message_id, parts.receipt_handle) {
                (Some(id), Some(receipt)) => match MessageId::from_str(&id) {
                    Ok(message_id) => messages.push(ReceivedMessage {
                        message_id,
                        body: Bytes::from(parts.body),
                        receipt_handle: ReceiptHandle::new(receipt),
                        attributes: parts.attributes,
                        message_attributes: parts.message_attributes,
                    }),
                    Err(e) => {
                        failure.get_or_insert(AwsError::SerializationError(e.to_string()));
                    }
                },
                _ => {
                    failure.get_or_insert(AwsError::SerializationError(
                        "Message without MessageId or ReceiptHandle".to_string(),
                    ));
                }
            }
        }
        _ => {}
    })?;

    match failure {
        Some(err) => Err(err),
        None => Ok(messages),
    }
}

// ============================================================================
// AWS SQS Provider
// ============================================================================

/// AWS SQS queue client bound to a single queue URL.
///
/// Thread-safe and cheap to share across tasks through `Arc`.
pub struct AwsSqsProvider {
    transport: AwsHttpTransport,
    queue_url: String,
}

impl AwsSqsProvider {
    /// Create a provider for `queue_url`, resolving credentials and region
    /// from `config`, the environment and the AWS credential chain.
    ///
    /// # Errors
    ///
    /// Returns error if credentials or region cannot be resolved or the
    /// endpoint is not a valid URL. These are fatal at startup.
    pub async fn new(config: &AwsSqsConfig, queue_url: impl Into<String>) -> Result<Self, AwsError> {
        let queue_url = queue_url.into();
        let region = config.region(Some(&queue_url))?;
        let credentials = CredentialSource::from_config(config, &region).await?;
        let endpoint = config.service_endpoint("sqs", &region);

        Self::with_source(&endpoint, credentials, region, queue_url)
    }

    /// Create a provider with explicit endpoint, credentials and region
    pub fn with_credentials(
        endpoint: &str,
        credentials: AwsCredentials,
        region: String,
        queue_url: impl Into<String>,
    ) -> Result<Self, AwsError> {
        Self::with_source(endpoint, CredentialSource::Static(credentials), region, queue_url)
    }

    /// Create a provider signing with any credential source
    pub fn with_source(
        endpoint: &str,
        credentials: CredentialSource,
        region: String,
        queue_url: impl Into<String>,
    ) -> Result<Self, AwsError> {
        let queue_url = queue_url.into();
        if queue_url.is_empty() {
            return Err(AwsError::ConfigurationError(
                "Queue URL cannot be empty".to_string(),
            ));
        }

        Ok(Self {
            transport: AwsHttpTransport::new("sqs", endpoint, credentials, region)?,
            queue_url,
        })
    }

    fn base_params(&self, action: &str) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("Action".to_string(), action.to_string());
        params.insert("Version".to_string(), SQS_API_VERSION.to_string());
        params.insert("QueueUrl".to_string(), self.queue_url.clone());
        params
    }
}

impl fmt::Debug for AwsSqsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsSqsProvider")
            .field("queue_url", &self.queue_url)
            .field("region", &self.transport.region)
            .finish()
    }
}

#[async_trait]
impl QueueClient for AwsSqsProvider {
    async fn receive_messages(
        &self,
        options: &ReceiveOptions,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        options.validate()?;

        let mut params = self.base_params("ReceiveMessage");
        params.insert(
            "MaxNumberOfMessages".to_string(),
            options.max_messages.to_string(),
        );
        params.insert(
            "WaitTimeSeconds".to_string(),
            options.wait_time.as_secs().to_string(),
        );
        params.insert(
            "VisibilityTimeout".to_string(),
            options.visibility_timeout.as_secs().to_string(),
        );
        params.insert(
            "AttributeName.1".to_string(),
            ATTR_FIRST_RECEIVE_TIMESTAMP.to_string(),
        );
        params.insert("AttributeName.2".to_string(), ATTR_RECEIVE_COUNT.to_string());
        params.insert("MessageAttributeName.1".to_string(), "All".to_string());

        let response = self
            .transport
            .call(&params)
            .await
            .map_err(|e| e.to_queue_error())?;

        let messages = parse_receive_message_response(&response).map_err(|e| e.to_queue_error())?;
        debug!(
            queue_url = %self.queue_url,
            count = messages.len(),
            "Received messages from SQS"
        );

        Ok(messages)
    }

    async fn delete_message(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let mut params = self.base_params("DeleteMessage");
        params.insert("ReceiptHandle".to_string(), receipt.as_str().to_string());

        // DeleteMessage returns an empty result on success
        self.transport
            .call(&params)
            .await
            .map_err(|e| e.to_queue_error())?;

        Ok(())
    }

    fn queue_url(&self) -> &str {
        &self.queue_url
    }
}
