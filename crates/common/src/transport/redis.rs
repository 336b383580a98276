//! Redis list broker
//!
//! Reliable queue pattern: a message moves atomically from the channel list
//! to this consumer's processing list on receive and is removed from there on
//! ack. At startup anything a previous run left in the processing list is
//! returned to the channel, which is how unacknowledged deliveries are
//! redelivered after a crash. A reconnect within one run leaves the list
//! alone: its handlers still hold those deliveries.

use super::broker::{Broker, Connector, Delivery, Headers, OutboundMessage};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Stored form of a message inside the lists
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMessage {
    id: String,
    body: String,
    #[serde(default)]
    headers: Headers,
    /// Times the message has been handed out before
    #[serde(default)]
    deliveries: u32,
}

fn processing_key(prefix: &str, channel: &str, consumer_id: &str) -> String {
    format!("{}:queue:{}:processing:{}", prefix, channel, consumer_id)
}

pub struct RedisConnector {
    client: Client,
    key_prefix: String,
    consumer_id: String,
}

impl RedisConnector {
    /// `consumer_id` names this process's processing lists. It must be
    /// unique per replica and stable across restarts of the same replica.
    pub fn new(url: &str, key_prefix: &str, consumer_id: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|e| AppError::Configuration {
            message: format!("Invalid Redis URL: {}", e),
        })?;
        Ok(Self {
            client,
            key_prefix: key_prefix.to_string(),
            consumer_id: consumer_id.to_string(),
        })
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn Broker>> {
        let connection = self.client.get_multiplexed_async_connection().await?;
        Ok(Arc::new(RedisBroker {
            connection,
            key_prefix: self.key_prefix.clone(),
            consumer_id: self.consumer_id.clone(),
        }))
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

struct RedisBroker {
    connection: MultiplexedConnection,
    key_prefix: String,
    consumer_id: String,
}

impl RedisBroker {
    fn ready_key(&self, channel: &str) -> String {
        format!("{}:queue:{}", self.key_prefix, channel)
    }

    fn processing_key(&self, channel: &str) -> String {
        processing_key(&self.key_prefix, channel, &self.consumer_id)
    }

    fn parse(raw: &str) -> Result<StoredMessage> {
        serde_json::from_str(raw).map_err(|e| AppError::QueueError {
            message: format!("Unreadable message in queue: {}", e),
        })
    }

    /// Atomically move `raw` from the processing list back to the channel
    async fn return_to_ready(&self, channel: &str, raw: &str, message: StoredMessage) -> Result<()> {
        let updated = serde_json::to_string(&message)?;
        let mut conn = self.connection.clone();
        let _: () = redis::pipe()
            .atomic()
            .lrem(self.processing_key(channel), 1, raw)
            .ignore()
            .lpush(self.ready_key(channel), updated)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn declare(&self, _channel: &str) -> Result<()> {
        // Lists need no creation
        Ok(())
    }

    async fn recover(&self, channel: &str) -> Result<usize> {
        let mut conn = self.connection.clone();
        let leftovers: Vec<String> = conn.lrange(self.processing_key(channel), 0, -1).await?;
        for raw in &leftovers {
            match Self::parse(raw) {
                Ok(mut message) => {
                    message.deliveries += 1;
                    self.return_to_ready(channel, raw, message).await?;
                }
                Err(e) => {
                    warn!(channel, error = %e, "Dropping unreadable message from processing list");
                    let _: i64 = conn.lrem(self.processing_key(channel), 1, raw).await?;
                }
            }
        }
        if !leftovers.is_empty() {
            info!(channel, count = leftovers.len(), "Recovered unacknowledged messages");
        }
        Ok(leftovers.len())
    }

    async fn publish(&self, channel: &str, message: OutboundMessage) -> Result<()> {
        let stored = StoredMessage {
            id: Uuid::new_v4().to_string(),
            body: message.body,
            headers: message.headers,
            deliveries: 0,
        };
        let raw = serde_json::to_string(&stored)?;
        let mut conn = self.connection.clone();
        let _: i64 = conn.lpush(self.ready_key(channel), raw).await?;
        debug!(channel, message_id = %stored.id, "Message published");
        Ok(())
    }

    async fn receive(&self, channel: &str, max: usize) -> Result<Vec<Delivery>> {
        let mut conn = self.connection.clone();
        let mut deliveries = Vec::new();

        while deliveries.len() < max {
            let raw: Option<String> = redis::cmd("LMOVE")
                .arg(self.ready_key(channel))
                .arg(self.processing_key(channel))
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await?;
            let Some(raw) = raw else { break };

            let message = match Self::parse(&raw) {
                Ok(m) => m,
                Err(e) => {
                    warn!(channel, error = %e, "Discarding unreadable message");
                    let _: i64 = conn.lrem(self.processing_key(channel), 1, &raw).await?;
                    continue;
                }
            };
            deliveries.push(Delivery {
                id: message.id,
                channel: channel.to_string(),
                body: message.body,
                headers: message.headers,
                attempt: message.deliveries + 1,
                receipt: raw,
            });
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut conn = self.connection.clone();
        let removed: i64 = conn
            .lrem(self.processing_key(&delivery.channel), 1, &delivery.receipt)
            .await?;
        if removed == 0 {
            return Err(AppError::QueueError {
                message: format!("delivery {} is no longer in flight", delivery.id),
            });
        }
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery) -> Result<()> {
        let mut message = Self::parse(&delivery.receipt)?;
        message.deliveries += 1;
        self.return_to_ready(&delivery.channel, &delivery.receipt, message).await
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_message_tolerates_missing_fields() {
        let message: StoredMessage = serde_json::from_str(r#"{"id":"a","body":"[]"}"#).unwrap();
        assert_eq!(message.deliveries, 0);
        assert!(message.headers.is_empty());
    }

    #[test]
    fn test_processing_list_is_per_consumer() {
        assert_eq!(
            processing_key("newswire", "news_articles", "ingestion-a"),
            "newswire:queue:news_articles:processing:ingestion-a"
        );
        assert_ne!(
            processing_key("newswire", "news_articles", "ingestion-a"),
            processing_key("newswire", "news_articles", "ingestion-b")
        );
    }

    #[test]
    fn test_invalid_url_is_configuration_error() {
        let err = RedisConnector::new("not-a-url", "newswire", "worker-1").err().unwrap();
        assert!(matches!(err, AppError::Configuration { .. }));
    }
}
