//! Newswire Scraper
//!
//! Scrapes the configured portals on a fixed schedule:
//! 1. Fetches every portal section through its adapter
//! 2. Publishes one envelope per non-empty section to the articles channel
//! 3. Flushes the batch buffer on shutdown
//!
//! `scraper run-once` executes a single cycle and exits.

mod adapters;
mod http;
mod orchestrator;

use crate::http::HttpFetcher;
use crate::orchestrator::Orchestrator;
use anyhow::Context;
use newswire_common::{
    config::AppConfig,
    metrics, service,
    transport::{self, BatchPublisher, BatchSettings},
    VERSION,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("Failed to load configuration")?;
    service::init_tracing(&config.observability);
    info!("Starting Newswire Scraper v{}", VERSION);

    config.validate_scraper()?;
    metrics::install_exporter(config.observability.metrics_port)?;
    metrics::register_metrics();

    let run_once = std::env::args().nth(1).as_deref() == Some("run-once");

    let channel = config.queue.articles_channel.clone();
    let connection = transport::connect(&config, &config.consumer_id("scraper"), &[channel.as_str()]).await?;
    info!(backend = connection.backend(), channel = %channel, "Connected to broker");

    let publisher = BatchPublisher::new(
        connection,
        BatchSettings {
            channel,
            batch_size: config.queue.batch_size,
            batch_timeout: config.batch_timeout(),
            retry: config.queue.publish_retry.clone(),
        },
    );

    let http = Arc::new(HttpFetcher::new(&config.http, config.scraper.requests_per_second)?);
    let orchestrator = Orchestrator::new(&config.scraper, http, publisher.clone());
    info!(
        portals = config.scraper.portals.len(),
        interval_secs = config.scraper.interval_secs,
        "Scraper ready"
    );

    if run_once {
        info!("Running a single cycle...");
        orchestrator.run_cycle().await;
    } else {
        let mut shutdown = service::shutdown_channel();
        let period = Duration::from_secs(config.scraper.interval_secs.max(1));
        let mut ticker = if config.scraper.run_on_startup {
            tokio::time::interval(period)
        } else {
            tokio::time::interval_at(tokio::time::Instant::now() + period, period)
        };
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = orchestrator.run_cycle() => {}
                        _ = shutdown.changed() => {
                            info!("Shutdown signal received, abandoning cycle");
                            break;
                        }
                    }
                }
            }
        }
    }

    match publisher.flush().await {
        Ok(count) => info!(envelopes = count, "Flushed batch buffer"),
        Err(e) => error!(error = %e, "Failed to flush batch buffer"),
    }

    info!("Scraper shutting down");
    Ok(())
}
