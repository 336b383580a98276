//! SQS broker
//!
//! Each channel is one standard queue named after the channel. Acks delete
//! the message, requeues reset its visibility to zero, and the attempt number
//! comes from `ApproximateReceiveCount`.

use super::broker::{Broker, Connector, Delivery, Headers, OutboundMessage};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use aws_sdk_sqs::error::{DisplayErrorContext, SdkError};
use aws_sdk_sqs::types::{Message, MessageAttributeValue, MessageSystemAttributeName};
use aws_sdk_sqs::Client as SqsClient;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// SQS caps a single receive at ten messages
const MAX_RECEIVE_BATCH: usize = 10;

#[derive(Debug, Clone)]
pub struct SqsSettings {
    /// Visibility timeout in seconds
    pub visibility_timeout: i32,
    /// Wait time for long polling (seconds)
    pub wait_time_seconds: i32,
    /// Custom endpoint, e.g. a local emulator
    pub endpoint: Option<String>,
}

pub struct SqsConnector {
    settings: SqsSettings,
    /// Queue urls survive reconnects
    urls: Arc<RwLock<HashMap<String, String>>>,
}

impl SqsConnector {
    pub fn new(settings: SqsSettings) -> Self {
        Self {
            settings,
            urls: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl Connector for SqsConnector {
    async fn connect(&self) -> Result<Arc<dyn Broker>> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(ref endpoint) = self.settings.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let aws_config = loader.load().await;
        let client = SqsClient::new(&aws_config);

        Ok(Arc::new(SqsBroker {
            client,
            settings: self.settings.clone(),
            urls: self.urls.clone(),
        }))
    }

    fn backend(&self) -> &'static str {
        "sqs"
    }
}

struct SqsBroker {
    client: SqsClient,
    settings: SqsSettings,
    urls: Arc<RwLock<HashMap<String, String>>>,
}

/// SQS queue names allow alphanumerics, hyphens and underscores only
fn queue_name(channel: &str) -> String {
    channel
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

/// Transport failures mean the session is gone; everything else is a queue error
fn sqs_error<E, R>(operation: &str, err: SdkError<E, R>) -> AppError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = format!("Failed to {}: {}", operation, DisplayErrorContext(&err));
    match err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
            AppError::ConnectionLost { message }
        }
        _ => AppError::QueueError { message },
    }
}

impl SqsBroker {
    async fn url(&self, channel: &str) -> Result<String> {
        self.urls
            .read()
            .await
            .get(channel)
            .cloned()
            .ok_or_else(|| AppError::QueueError {
                message: format!("channel '{}' is not declared", channel),
            })
    }

    fn to_delivery(channel: &str, message: Message) -> Option<Delivery> {
        let receipt = message.receipt_handle?;
        let attempt = message
            .attributes
            .as_ref()
            .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
            .and_then(|count| count.parse().ok())
            .unwrap_or(1);
        let headers: Headers = message
            .message_attributes
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(key, value)| value.string_value.map(|v| (key, v)))
            .collect();

        Some(Delivery {
            id: message.message_id.unwrap_or_default(),
            channel: channel.to_string(),
            body: message.body.unwrap_or_default(),
            headers,
            attempt,
            receipt,
        })
    }
}

#[async_trait]
impl Broker for SqsBroker {
    async fn declare(&self, channel: &str) -> Result<()> {
        let result = self
            .client
            .create_queue()
            .queue_name(queue_name(channel))
            .send()
            .await
            .map_err(|e| sqs_error("create queue", e))?;

        let url = result.queue_url.ok_or_else(|| AppError::QueueError {
            message: format!("SQS returned no url for '{}'", channel),
        })?;
        debug!(channel, url = %url, "Queue declared");
        self.urls.write().await.insert(channel.to_string(), url);
        Ok(())
    }

    async fn publish(&self, channel: &str, message: OutboundMessage) -> Result<()> {
        let url = self.url(channel).await?;
        let mut request = self
            .client
            .send_message()
            .queue_url(&url)
            .message_body(&message.body);

        for (key, value) in &message.headers {
            let attribute = MessageAttributeValue::builder()
                .data_type("String")
                .string_value(value)
                .build()
                .map_err(|e| AppError::QueueError {
                    message: format!("Invalid message attribute '{}': {}", key, e),
                })?;
            request = request.message_attributes(key, attribute);
        }

        let result = request
            .send()
            .await
            .map_err(|e| sqs_error("send message", e))?;

        debug!(channel, message_id = ?result.message_id, "Message sent to queue");
        Ok(())
    }

    async fn receive(&self, channel: &str, max: usize) -> Result<Vec<Delivery>> {
        let url = self.url(channel).await?;
        let result = self
            .client
            .receive_message()
            .queue_url(&url)
            .max_number_of_messages(max.clamp(1, MAX_RECEIVE_BATCH) as i32)
            .visibility_timeout(self.settings.visibility_timeout)
            .wait_time_seconds(self.settings.wait_time_seconds)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|e| sqs_error("receive messages", e))?;

        let messages = result.messages.unwrap_or_default();
        debug!(channel, count = messages.len(), "Received messages from queue");

        Ok(messages
            .into_iter()
            .filter_map(|m| Self::to_delivery(channel, m))
            .collect())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let url = self.url(&delivery.channel).await?;
        self.client
            .delete_message()
            .queue_url(&url)
            .receipt_handle(&delivery.receipt)
            .send()
            .await
            .map_err(|e| sqs_error("delete message", e))?;
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery) -> Result<()> {
        let url = self.url(&delivery.channel).await?;
        self.client
            .change_message_visibility()
            .queue_url(&url)
            .receipt_handle(&delivery.receipt)
            .visibility_timeout(0)
            .send()
            .await
            .map_err(|e| sqs_error("change visibility", e))?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .list_queues()
            .max_results(1)
            .send()
            .await
            .map_err(|e| sqs_error("list queues", e))?;
        Ok(())
    }
}
