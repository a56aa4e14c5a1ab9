//! Tests for the queue provisioning flow.

use super::*;
use std::collections::VecDeque;
use std::sync::Mutex;

const QUEUE_URL: &str = "https://sqs.us-east-1.amazonaws.com/123456789012/orders";
const QUEUE_ARN: &str = "arn:aws:sqs:us-east-1:123456789012:orders";
const TOPIC_A: &str = "arn:aws:sns:us-east-1:123456789012:topic-a";
const TOPIC_B: &str = "arn:aws:sns:eu-west-1:123456789012:topic-b";

/// Records every call and answers from scripted results.
///
/// A successfully created queue is found by later lookups.
#[derive(Default)]
struct FakeApi {
    existing: Option<String>,
    created: Mutex<Option<String>>,
    create_results: Mutex<VecDeque<Result<String, ProvisioningError>>>,
    calls: Mutex<Vec<String>>,
    attributes: Mutex<Option<BTreeMap<String, String>>>,
}

impl FakeApi {
    fn with_create_results(results: Vec<Result<String, ProvisioningError>>) -> Self {
        Self {
            create_results: Mutex::new(results.into()),
            ..Default::default()
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

fn deleted_recently() -> Result<String, ProvisioningError> {
    Err(ProvisioningError::QueueDeletedRecently {
        queue_name: "orders".to_string(),
    })
}

#[async_trait]
impl ProvisioningApi for FakeApi {
    async fn find_queue_url(&self, queue_name: &str) -> Result<Option<String>, ProvisioningError> {
        self.record(format!("find:{}", queue_name));
        Ok(self
            .existing
            .clone()
            .or_else(|| self.created.lock().unwrap().clone()))
    }

    async fn create_queue(&self, queue_name: &str) -> Result<String, ProvisioningError> {
        self.record(format!("create:{}", queue_name));
        let result = self
            .create_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(QUEUE_URL.to_string()));
        if let Ok(url) = &result {
            *self.created.lock().unwrap() = Some(url.clone());
        }
        result
    }

    async fn queue_arn(&self, queue_url: &str) -> Result<String, ProvisioningError> {
        self.record(format!("arn:{}", queue_url));
        Ok(QUEUE_ARN.to_string())
    }

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<(), ProvisioningError> {
        self.record(format!("attributes:{}", queue_url));
        *self.attributes.lock().unwrap() = Some(attributes.clone());
        Ok(())
    }

    async fn subscribe(
        &self,
        topic_arn: &str,
        queue_arn: &str,
    ) -> Result<String, ProvisioningError> {
        self.record(format!("subscribe:{}:{}", topic_arn, queue_arn));
        Ok(format!("{}:sub", topic_arn))
    }

    async fn enable_raw_delivery(&self, subscription_arn: &str) -> Result<(), ProvisioningError> {
        self.record(format!("raw:{}", subscription_arn));
        Ok(())
    }
}

fn options() -> CreateQueueOptions {
    CreateQueueOptions::new("orders")
        .with_topic_arns(vec![TOPIC_A.to_string(), TOPIC_B.to_string()])
        .with_visibility_timeout(Duration::from_secs(90))
        .with_retry(CreateRetryPolicy {
            max_attempts: 3,
            delay: Duration::ZERO,
        })
}

mod flow {
    use super::*;

    #[tokio::test]
    async fn test_existing_queue_is_returned_untouched() {
        let api = FakeApi {
            existing: Some(QUEUE_URL.to_string()),
            ..Default::default()
        };

        let url = create_and_subscribe(&api, &options()).await.unwrap();

        assert_eq!(url, QUEUE_URL);
        assert_eq!(api.calls(), vec!["find:orders".to_string()]);
    }

    #[tokio::test]
    async fn test_second_run_reuses_created_queue() {
        let api = FakeApi::default();

        let first = create_and_subscribe(&api, &options()).await.unwrap();
        let calls_after_first = api.calls().len();
        let second = create_and_subscribe(&api, &options()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(api.count("create:"), 1);
        assert_eq!(api.count("subscribe:"), 2);
        assert_eq!(
            api.calls()[calls_after_first..],
            ["find:orders".to_string()]
        );
    }

    #[tokio::test]
    async fn test_prefix_match_is_not_treated_as_existing() {
        let api = FakeApi {
            existing: Some("https://sqs.us-east-1.amazonaws.com/1/orders-archive".to_string()),
            ..Default::default()
        };

        let url = create_and_subscribe(&api, &options()).await.unwrap();

        assert_eq!(url, QUEUE_URL);
        assert_eq!(api.count("create:"), 1);
    }

    #[tokio::test]
    async fn test_new_queue_is_subscribed_and_configured() {
        let api = FakeApi::default();

        let url = create_and_subscribe(&api, &options()).await.unwrap();

        assert_eq!(url, QUEUE_URL);
        assert_eq!(
            api.calls(),
            vec![
                "find:orders".to_string(),
                "create:orders".to_string(),
                format!("arn:{}", QUEUE_URL),
                format!("subscribe:{}:{}", TOPIC_A, QUEUE_ARN),
                format!("raw:{}:sub", TOPIC_A),
                format!("subscribe:{}:{}", TOPIC_B, QUEUE_ARN),
                format!("raw:{}:sub", TOPIC_B),
                format!("attributes:{}", QUEUE_URL),
            ]
        );

        let attributes = api.attributes.lock().unwrap().clone().unwrap();
        assert_eq!(attributes.get("VisibilityTimeout").map(String::as_str), Some("90"));
        assert_eq!(
            attributes
                .get("ReceiveMessageWaitTimeSeconds")
                .map(String::as_str),
            Some("20")
        );
        assert_eq!(
            attributes.get("Policy"),
            Some(
                &send_policy_document(QUEUE_ARN, &[TOPIC_A.to_string(), TOPIC_B.to_string()])
                    .unwrap()
            )
        );
    }

    #[tokio::test]
    async fn test_create_retries_while_deleted_recently() {
        let api = FakeApi::with_create_results(vec![
            deleted_recently(),
            Ok(QUEUE_URL.to_string()),
        ]);

        let url = create_and_subscribe(&api, &options()).await.unwrap();

        assert_eq!(url, QUEUE_URL);
        // Stops at the first success
        assert_eq!(api.count("create:"), 2);
    }

    #[tokio::test]
    async fn test_create_gives_up_after_max_attempts() {
        let api = FakeApi::with_create_results(vec![
            deleted_recently(),
            deleted_recently(),
            deleted_recently(),
            Ok(QUEUE_URL.to_string()),
        ]);

        let err = create_and_subscribe(&api, &options()).await.unwrap_err();

        match err {
            ProvisioningError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("Expected retries exhausted, got {:?}", other),
        }
        assert_eq!(api.count("create:"), 3);
        assert_eq!(api.count("subscribe:"), 0);
    }

    #[tokio::test]
    async fn test_other_create_errors_are_not_retried() {
        let api = FakeApi::with_create_results(vec![Err(ProvisioningError::Queue(
            QueueError::AuthenticationFailed {
                message: "denied".to_string(),
            },
        ))]);

        let err = create_and_subscribe(&api, &options()).await.unwrap_err();

        assert!(matches!(err, ProvisioningError::Queue(_)));
        assert_eq!(api.count("create:"), 1);
    }

    #[tokio::test]
    async fn test_invalid_topic_arn_fails_before_any_call() {
        let api = FakeApi::default();
        let options = options().with_topic_arns(vec!["not-an-arn".to_string()]);

        let err = create_and_subscribe(&api, &options).await.unwrap_err();

        assert!(matches!(err, ProvisioningError::InvalidTopicArn { .. }));
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_queue_name_is_rejected() {
        let api = FakeApi::default();

        let err = create_and_subscribe(&api, &CreateQueueOptions::new("bad name!"))
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisioningError::Validation(_)));
        assert!(api.calls().is_empty());
    }
}

mod helpers {
    use super::*;

    #[test]
    fn test_default_retry_policy() {
        let policy = CreateRetryPolicy::default();
        assert_eq!(policy.max_attempts, 12);
        assert_eq!(policy.delay, Duration::from_secs(10));
    }

    #[test]
    fn test_exact_queue_url() {
        assert!(is_exact_queue_url(QUEUE_URL, "orders"));
        assert!(!is_exact_queue_url(QUEUE_URL, "ord"));
        assert!(!is_exact_queue_url(
            "https://sqs.us-east-1.amazonaws.com/1/my-orders",
            "orders"
        ));
    }

    #[test]
    fn test_topic_region() {
        assert_eq!(topic_region(TOPIC_B).unwrap(), "eu-west-1");
        assert_eq!(
            topic_region("arn:aws-cn:sns:cn-north-1:123456789012:t").unwrap(),
            "cn-north-1"
        );
        assert!(matches!(
            topic_region("arn:aws:sqs:us-east-1:123456789012:q"),
            Err(ProvisioningError::InvalidTopicArn { .. })
        ));
        assert!(topic_region("arn:aws:sns::123456789012:t").is_err());
        assert!(topic_region("arn:aws:sns:us-east-1").is_err());
    }

    #[test]
    fn test_send_policy_document() {
        let policy = send_policy_document(QUEUE_ARN, &[TOPIC_A.to_string()]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&policy).unwrap();

        assert_eq!(
            value,
            serde_json::json!({
                "Version": "2012-10-17",
                "Id": format!("{}/SQSDefaultPolicy", QUEUE_ARN),
                "Statement": [{
                    "Sid": "",
                    "Effect": "Allow",
                    "Principal": { "AWS": "*" },
                    "Action": "SQS:SendMessage",
                    "Resource": QUEUE_ARN,
                    "Condition": {
                        "ArnEquals": { "aws:SourceArn": [TOPIC_A] }
                    }
                }]
            })
        );
    }
}
