//! Validating, buffering envelope publisher

use super::broker::{inspection_channel, OutboundMessage, HEADER_BATCH_ID, HEADER_ERROR, HEADER_MESSAGE_COUNT, HEADER_SOURCE_CHANNEL};
use super::connection::Connection;
use crate::errors::Result;
use crate::metrics;
use crate::models::{validate_envelope, BatchEnvelope};
use crate::retry::RetryPolicy;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What happened to a published envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Accepted into the buffer; it reaches the broker with the next
    /// successful flush
    Buffered,
    /// Failed validation and was diverted to the inspection channel
    Rejected { reason: String },
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub channel: String,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub retry: RetryPolicy,
}

#[derive(Default)]
struct Buffer {
    envelopes: Vec<BatchEnvelope>,
    /// Bumped on every flush so a stale timer never flushes a newer batch
    generation: u64,
}

/// Buffers valid envelopes and publishes them as one broker message when
/// `batch_size` is reached or `batch_timeout` has passed since the first
/// envelope entered an empty buffer.
///
/// A flush that exhausts its retries puts its envelopes back at the front of
/// the buffer, so they go out with the next flush.
pub struct BatchPublisher {
    connection: Arc<Connection>,
    settings: BatchSettings,
    buffer: Mutex<Buffer>,
}

impl BatchPublisher {
    pub fn new(connection: Arc<Connection>, settings: BatchSettings) -> Arc<Self> {
        Arc::new(Self {
            connection,
            settings,
            buffer: Mutex::new(Buffer::default()),
        })
    }

    /// Validate and buffer one envelope. Invalid envelopes never reach the
    /// channel.
    pub async fn publish(self: &Arc<Self>, envelope: BatchEnvelope) -> Result<PublishOutcome> {
        if let Err(e) = validate_envelope(&envelope) {
            let reason = e.to_string();
            self.divert(&envelope, &reason).await;
            return Ok(PublishOutcome::Rejected { reason });
        }

        let (ready, timer_generation) = {
            let mut buffer = self.buffer.lock().await;
            buffer.envelopes.push(envelope);
            let starts_batch = buffer.envelopes.len() == 1;

            if buffer.envelopes.len() >= self.settings.batch_size {
                buffer.generation += 1;
                (Some(std::mem::take(&mut buffer.envelopes)), None)
            } else if starts_batch {
                (None, Some(buffer.generation))
            } else {
                (None, None)
            }
        };
        metrics::record_envelope(&self.settings.channel, "buffered", 1);

        if let Some(generation) = timer_generation {
            self.arm_timer(generation);
        }

        if let Some(batch) = ready {
            if self.send(&batch, "size").await.is_err() {
                self.restore(batch).await;
            }
        }
        Ok(PublishOutcome::Buffered)
    }

    /// Publish whatever is buffered. Called on shutdown. On failure the
    /// envelopes stay buffered.
    pub async fn flush(self: &Arc<Self>) -> Result<usize> {
        let batch = {
            let mut buffer = self.buffer.lock().await;
            buffer.generation += 1;
            std::mem::take(&mut buffer.envelopes)
        };
        let count = batch.len();
        if count > 0 {
            if let Err(e) = self.send(&batch, "shutdown").await {
                self.restore(batch).await;
                return Err(e);
            }
        }
        Ok(count)
    }

    pub async fn buffered(&self) -> usize {
        self.buffer.lock().await.envelopes.len()
    }

    fn arm_timer(self: &Arc<Self>, generation: u64) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(this.settings.batch_timeout).await;
            this.flush_generation(generation).await;
        });
    }

    async fn flush_generation(self: &Arc<Self>, generation: u64) {
        let batch = {
            let mut buffer = self.buffer.lock().await;
            if buffer.generation != generation || buffer.envelopes.is_empty() {
                return;
            }
            buffer.generation += 1;
            std::mem::take(&mut buffer.envelopes)
        };
        if self.send(&batch, "timeout").await.is_err() {
            self.restore(batch).await;
        }
    }

    /// Put an unsent batch back in front of anything buffered since. A timer
    /// is armed when the buffer was empty; otherwise one is already pending.
    async fn restore(self: &Arc<Self>, mut batch: Vec<BatchEnvelope>) {
        let count = batch.len();
        let timer_generation = {
            let mut buffer = self.buffer.lock().await;
            let was_empty = buffer.envelopes.is_empty();
            batch.append(&mut buffer.envelopes);
            buffer.envelopes = batch;
            was_empty.then_some(buffer.generation)
        };
        metrics::record_envelope(&self.settings.channel, "rebuffered", count);
        warn!(channel = %self.settings.channel, count, "Unsent envelopes kept for the next flush");

        if let Some(generation) = timer_generation {
            self.arm_timer(generation);
        }
    }

    async fn send(&self, batch: &[BatchEnvelope], trigger: &'static str) -> Result<()> {
        let channel = &self.settings.channel;
        let count = batch.len();
        let batch_id = Uuid::new_v4().to_string();
        let message = OutboundMessage::json(batch)?
            .with_header(HEADER_MESSAGE_COUNT, count.to_string())
            .with_header(HEADER_BATCH_ID, batch_id.clone());

        let result = self
            .settings
            .retry
            .retry("publish batch", || self.connection.publish(channel, message.clone()))
            .await;

        metrics::record_flush(channel, trigger);
        match result {
            Ok(()) => {
                metrics::record_envelope(channel, "published", count);
                info!(channel = %channel, batch_id = %batch_id, count, trigger, "Batch published");
                Ok(())
            }
            Err(e) => {
                error!(
                    channel = %channel,
                    batch_id = %batch_id,
                    count,
                    trigger,
                    error = %e,
                    "Batch publish failed"
                );
                Err(e)
            }
        }
    }

    /// Log the rejection and park the envelope for manual inspection
    async fn divert(&self, envelope: &BatchEnvelope, reason: &str) {
        let channel = &self.settings.channel;
        let inspection = inspection_channel(channel);
        error!(
            channel = %channel,
            portal = %envelope.portal_name,
            declared = envelope.total_articles,
            actual = envelope.articles.len(),
            urls = ?envelope.urls(),
            error = %reason,
            "Rejected invalid envelope"
        );
        metrics::record_envelope(channel, "rejected", 1);

        let message = match OutboundMessage::json(&json!({ "error": reason, "envelope": envelope })) {
            Ok(m) => m
                .with_header(HEADER_ERROR, reason)
                .with_header(HEADER_SOURCE_CHANNEL, channel.as_str()),
            Err(e) => {
                warn!(error = %e, "Could not serialize rejected envelope");
                return;
            }
        };

        match self.connection.publish(&inspection, message).await {
            Ok(()) => debug!(channel = %inspection, "Rejected envelope parked"),
            Err(e) => warn!(channel = %inspection, error = %e, "Could not park rejected envelope"),
        }
    }
}
