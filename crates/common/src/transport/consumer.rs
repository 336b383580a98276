//! Prefetch-bounded consumer loop with ack / requeue / dead-letter settlement

use super::broker::{dead_letter_channel, Delivery, HEADER_ATTEMPTS, HEADER_ERROR, HEADER_ERROR_CODE, HEADER_SOURCE_CHANNEL};
use super::connection::Connection;
use crate::errors::{AppError, Result};
use crate::metrics;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Consecutive receive failures before the loop backs off
const MAX_FAILURES: u32 = 5;
const CIRCUIT_BREAK_DURATION: Duration = Duration::from_secs(30);
const RECEIVE_ERROR_PAUSE: Duration = Duration::from_secs(5);

/// Processes one delivery. Returning an error settles the delivery as failed.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub channel: String,
    /// Deliveries held unacknowledged at once
    pub prefetch: usize,
    /// Redeliveries granted after the first failed attempt
    pub max_redeliveries: u32,
    /// Pause after an empty receive
    pub idle_poll: Duration,
}

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    /// Processed, but the ack did not reach the broker; expect a redelivery
    AckFailed,
    Requeued,
    DeadLettered,
}

pub struct Consumer<H> {
    connection: Arc<Connection>,
    handler: Arc<H>,
    settings: ConsumerSettings,
}

impl<H: MessageHandler> Consumer<H> {
    pub fn new(connection: Arc<Connection>, handler: Arc<H>, settings: ConsumerSettings) -> Self {
        Self { connection, handler, settings }
    }

    /// Consume until `shutdown` resolves. Deliveries already taken are
    /// processed and settled before returning.
    pub async fn run(&self, shutdown: impl Future<Output = ()> + Send) {
        tokio::pin!(shutdown);
        let channel = self.settings.channel.as_str();
        let mut consecutive_failures = 0;
        info!(channel, prefetch = self.settings.prefetch, "Consumer started");

        loop {
            if consecutive_failures >= MAX_FAILURES {
                warn!(channel, failures = consecutive_failures, "Circuit breaker open, pausing...");
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(CIRCUIT_BREAK_DURATION) => {}
                }
                consecutive_failures = 0;
                info!(channel, "Circuit breaker reset, resuming...");
            }

            let received = tokio::select! {
                _ = &mut shutdown => break,
                result = self.connection.receive(channel, self.settings.prefetch) => result,
            };

            match received {
                Ok(deliveries) if deliveries.is_empty() => {
                    consecutive_failures = 0;
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(self.settings.idle_poll) => {}
                    }
                }
                Ok(deliveries) => {
                    consecutive_failures = 0;
                    self.process(deliveries).await;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    error!(channel, error = %e, failures = consecutive_failures, "Failed to receive messages");
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(RECEIVE_ERROR_PAUSE) => {}
                    }
                }
            }
        }

        info!(channel, "Consumer stopped");
    }

    /// Receive and settle at most one prefetch window. Returns the number of
    /// deliveries handled.
    pub async fn poll_once(&self) -> Result<usize> {
        let deliveries = self
            .connection
            .receive(&self.settings.channel, self.settings.prefetch)
            .await?;
        let count = deliveries.len();
        self.process(deliveries).await;
        Ok(count)
    }

    async fn process(&self, deliveries: Vec<Delivery>) {
        stream::iter(deliveries)
            .for_each_concurrent(self.settings.prefetch, |delivery| async move {
                let result = self.handler.handle(&delivery).await;
                self.settle(&delivery, result).await;
            })
            .await;
    }

    async fn settle(&self, delivery: &Delivery, result: Result<()>) -> Settlement {
        let channel = delivery.channel.as_str();
        let settlement = match result {
            Ok(()) => match self.connection.ack(delivery).await {
                Ok(()) => {
                    debug!(channel, delivery_id = %delivery.id, "Delivery acknowledged");
                    Settlement::Acked
                }
                Err(e) => {
                    warn!(channel, delivery_id = %delivery.id, error = %e, "Ack failed, message will be redelivered");
                    Settlement::AckFailed
                }
            },
            Err(e) if redeliverable(&e) && delivery.attempt <= self.settings.max_redeliveries => {
                warn!(
                    channel,
                    delivery_id = %delivery.id,
                    attempt = delivery.attempt,
                    max_redeliveries = self.settings.max_redeliveries,
                    error = %e,
                    "Processing failed, requeueing"
                );
                if let Err(requeue_err) = self.connection.requeue(delivery).await {
                    warn!(channel, delivery_id = %delivery.id, error = %requeue_err, "Requeue failed, broker will redeliver");
                }
                Settlement::Requeued
            }
            Err(e) => self.dead_letter(delivery, &e).await,
        };

        let outcome = match settlement {
            Settlement::Acked => "ack",
            Settlement::AckFailed => "ack_failed",
            Settlement::Requeued => "requeue",
            Settlement::DeadLettered => "dead_letter",
        };
        metrics::record_delivery(channel, outcome);
        settlement
    }

    async fn dead_letter(&self, delivery: &Delivery, err: &AppError) -> Settlement {
        let channel = delivery.channel.as_str();
        let dead = dead_letter_channel(channel);
        let message = delivery
            .to_outbound()
            .with_header(HEADER_ERROR, err.to_string())
            .with_header(HEADER_ERROR_CODE, err.code().as_code().to_string())
            .with_header(HEADER_ATTEMPTS, delivery.attempt.to_string())
            .with_header(HEADER_SOURCE_CHANNEL, channel);

        if let Err(e) = self.connection.publish(&dead, message).await {
            error!(channel, delivery_id = %delivery.id, error = %e, "Dead-letter publish failed, requeueing");
            if let Err(requeue_err) = self.connection.requeue(delivery).await {
                warn!(channel, delivery_id = %delivery.id, error = %requeue_err, "Requeue failed, broker will redeliver");
            }
            return Settlement::Requeued;
        }

        error!(
            channel,
            delivery_id = %delivery.id,
            attempt = delivery.attempt,
            error = %err,
            "Delivery dead-lettered"
        );
        if let Err(e) = self.connection.ack(delivery).await {
            warn!(channel, delivery_id = %delivery.id, error = %e, "Ack after dead-letter failed");
        }
        Settlement::DeadLettered
    }
}

/// Malformed messages fail the same way on every attempt
fn redeliverable(err: &AppError) -> bool {
    !matches!(
        err,
        AppError::Validation { .. } | AppError::InvalidFormat { .. } | AppError::Serialization(_)
    )
}
