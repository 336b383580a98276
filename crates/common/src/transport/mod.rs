//! Queue transport
//!
//! Provides:
//! - A narrow [`Broker`] session trait with SQS, Redis and in-memory backends
//! - [`Connection`], which replaces a dead session and redeclares topology
//! - [`BatchPublisher`] for validated, buffered envelope publishing
//! - [`Consumer`] for prefetch-bounded consumption with dead-lettering

mod batch;
mod broker;
mod connection;
mod consumer;
mod memory;
mod redis;
mod sqs;

pub use batch::{BatchPublisher, BatchSettings, PublishOutcome};
pub use broker::{
    dead_letter_channel, inspection_channel, Broker, Connector, Delivery, Headers,
    OutboundMessage, HEADER_ATTEMPTS, HEADER_BATCH_ID, HEADER_ERROR, HEADER_ERROR_CODE,
    HEADER_MESSAGE_COUNT,
};
pub use connection::Connection;
pub use consumer::{Consumer, ConsumerSettings, MessageHandler, Settlement};
pub use memory::MemoryBroker;
pub use self::redis::RedisConnector;
pub use sqs::{SqsConnector, SqsSettings};

use crate::config::{AppConfig, QueueBackend};
use crate::errors::{AppError, Result};
use std::sync::Arc;
use tracing::warn;

/// Build the connector selected by `queue.backend`
pub fn connector(config: &AppConfig, consumer_id: &str) -> Result<Arc<dyn Connector>> {
    match config.queue.backend {
        QueueBackend::Redis => {
            let url = config
                .redis
                .url
                .as_deref()
                .ok_or_else(|| AppError::configuration("redis.url is required"))?;
            Ok(Arc::new(RedisConnector::new(url, &config.redis.key_prefix, consumer_id)?))
        }
        QueueBackend::Sqs => Ok(Arc::new(SqsConnector::new(SqsSettings {
            visibility_timeout: config.queue.visibility_timeout_secs as i32,
            wait_time_seconds: config.queue.poll_wait_secs as i32,
            endpoint: config.queue.sqs_endpoint.clone(),
        }))),
        QueueBackend::Memory => {
            warn!("Using the in-memory broker; messages do not leave this process");
            Ok(Arc::new(MemoryBroker::new()))
        }
    }
}

/// Open a connection and declare the given channels
pub async fn connect(config: &AppConfig, consumer_id: &str, channels: &[&str]) -> Result<Arc<Connection>> {
    let connection = Connection::open(
        connector(config, consumer_id)?,
        config.queue.reconnect_retry.clone(),
        config.operation_timeout(),
    )
    .await?;
    for channel in channels {
        connection.declare_channel(channel).await?;
    }
    Ok(Arc::new(connection))
}
