//! Newswire Ingestion Service
//!
//! Consumes batches from the articles channel:
//! 1. Drops articles whose url is already stored
//! 2. Stores the rest in one transaction
//! 3. Publishes a notification trigger per stored article
//! 4. Acks the delivery, or leaves it to redelivery / dead-lettering

mod errors;
mod processor;

use crate::processor::IngestionProcessor;
use anyhow::Context;
use newswire_common::{
    config::AppConfig,
    db, metrics, service,
    transport::{self, Consumer, ConsumerSettings},
    VERSION,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("Failed to load configuration")?;
    service::init_tracing(&config.observability);
    info!("Starting Newswire Ingestion Service v{}", VERSION);

    config.validate()?;
    metrics::install_exporter(config.observability.metrics_port)?;
    metrics::register_metrics();

    info!("Connecting to database...");
    let repository = db::connect(&config.database).await?;

    let articles = config.queue.articles_channel.as_str();
    let notifications = config.queue.notifications_channel.as_str();
    let consumer_id = config.consumer_id("ingestion");
    let connection = transport::connect(&config, &consumer_id, &[articles, notifications]).await?;
    info!(backend = connection.backend(), consumer_id = %consumer_id, "Connected to broker");

    let processor = Arc::new(IngestionProcessor::new(
        Arc::new(repository),
        connection.clone(),
        notifications.to_string(),
        config.queue.publish_retry.clone(),
    ));

    let consumer = Consumer::new(
        connection,
        processor,
        ConsumerSettings {
            channel: articles.to_string(),
            prefetch: config.queue.ingestion_prefetch,
            max_redeliveries: config.queue.max_redeliveries,
            idle_poll: Duration::from_secs(1),
        },
    );

    info!(channel = articles, prefetch = config.queue.ingestion_prefetch, "Ingestion service ready");
    consumer.run(service::shutdown_signal()).await;

    info!("Ingestion service shutting down");
    Ok(())
}
