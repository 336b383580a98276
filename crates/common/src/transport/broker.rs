//! Broker session abstraction
//!
//! A [`Broker`] is one live session with a message broker. Sessions are
//! produced by a [`Connector`] and owned by a [`super::Connection`], which
//! replaces them when they fail.

use crate::errors::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Message headers, ordered for stable serialization
pub type Headers = BTreeMap<String, String>;

pub const HEADER_MESSAGE_COUNT: &str = "message-count";
pub const HEADER_BATCH_ID: &str = "batch-id";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_ERROR: &str = "x-error";
pub const HEADER_ERROR_CODE: &str = "x-error-code";
pub const HEADER_ATTEMPTS: &str = "x-attempts";
pub const HEADER_SOURCE_CHANNEL: &str = "x-source-channel";

/// Channel holding messages that exhausted their redeliveries
pub fn dead_letter_channel(channel: &str) -> String {
    format!("{}.dead", channel)
}

/// Channel holding envelopes rejected by validation
pub fn inspection_channel(channel: &str) -> String {
    format!("{}.invalid", channel)
}

/// A message about to be published
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub body: String,
    pub headers: Headers,
}

impl OutboundMessage {
    pub fn new(body: String) -> Self {
        Self { body, headers: Headers::new() }
    }

    /// Serialize `value` as a JSON body
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self::new(serde_json::to_string(value)?)
            .with_header(HEADER_CONTENT_TYPE, "application/json"))
    }

    pub fn with_header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.insert(key.to_string(), value.into());
        self
    }
}

/// A message handed to a consumer. It stays in flight until acknowledged
/// or negatively acknowledged.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker message id, stable across redeliveries
    pub id: String,
    pub channel: String,
    pub body: String,
    pub headers: Headers,
    /// 1 on first delivery, incremented on every redelivery
    pub attempt: u32,
    /// Backend specific token needed to settle the delivery
    pub(crate) receipt: String,
}

impl Delivery {
    /// Rebuild the message for republishing elsewhere
    pub fn to_outbound(&self) -> OutboundMessage {
        OutboundMessage {
            body: self.body.clone(),
            headers: self.headers.clone(),
        }
    }
}

/// One session with a broker.
///
/// Implementations report a broken session as `AppError::ConnectionLost` so
/// the owning connection knows to replace it.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Create the durable queue backing `channel` if it does not exist
    async fn declare(&self, channel: &str) -> Result<()>;

    /// Return deliveries a previous run of this consumer left unacknowledged.
    /// Only called once per channel when the process starts; brokers that
    /// redeliver on their own keep the default.
    async fn recover(&self, _channel: &str) -> Result<usize> {
        Ok(0)
    }

    async fn publish(&self, channel: &str, message: OutboundMessage) -> Result<()>;

    /// Take up to `max` messages; an empty result means nothing is ready
    async fn receive(&self, channel: &str, max: usize) -> Result<Vec<Delivery>>;

    /// Remove a delivered message for good
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Return a delivered message to its channel for redelivery
    async fn requeue(&self, delivery: &Delivery) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}

/// Opens broker sessions
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Broker>>;

    /// Backend name for logs
    fn backend(&self) -> &'static str;
}
