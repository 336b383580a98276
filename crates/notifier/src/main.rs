//! Newswire Notifier
//!
//! Consumes notification triggers and fans them out:
//! 1. Resolves the subscribers of the article's section
//! 2. Persists one unread notification per subscriber
//! 3. Pushes new notifications to connected WebSocket clients
//!
//! Also serves `/ws`, `/health` and `/ready`.

mod gateway;
mod health;
mod processor;

use crate::health::Probe;
use crate::processor::FanoutProcessor;
use anyhow::Context;
use axum::{routing::get, Router};
use newswire_common::{
    config::AppConfig,
    db::{self, NotificationStore},
    live::LiveRegistry,
    metrics, service,
    transport::{self, Consumer, ConsumerSettings},
    VERSION,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: LiveRegistry,
    pub notifications: Arc<dyn NotificationStore>,
    pub probes: Arc<Vec<Arc<dyn Probe>>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("Failed to load configuration")?;
    service::init_tracing(&config.observability);
    info!("Starting Newswire Notifier v{}", VERSION);

    config.validate()?;
    metrics::install_exporter(config.observability.metrics_port)?;
    metrics::register_metrics();

    info!("Connecting to database...");
    let repository = Arc::new(db::connect(&config.database).await?);

    let channel = config.queue.notifications_channel.clone();
    let connection = transport::connect(&config, &config.consumer_id("notifier"), &[channel.as_str()]).await?;
    info!(backend = connection.backend(), channel = %channel, "Connected to broker");

    let registry = LiveRegistry::new(config.notifier.connection_buffer);
    let processor = Arc::new(FanoutProcessor::new(
        repository.clone(),
        repository.clone(),
        registry.clone(),
    ));

    let shutdown = service::shutdown_channel();

    let consumer = Consumer::new(
        connection.clone(),
        processor,
        ConsumerSettings {
            channel,
            prefetch: config.queue.notification_prefetch,
            max_redeliveries: config.queue.max_redeliveries,
            idle_poll: Duration::from_secs(1),
        },
    );
    let consumer_shutdown = shutdown.clone();
    let consumer_task = tokio::spawn(async move {
        consumer.run(service::wait_for_shutdown(consumer_shutdown)).await;
    });

    // Open sockets end once their registration is dropped
    let closing_registry = registry.clone();
    let closing_shutdown = shutdown.clone();
    tokio::spawn(async move {
        service::wait_for_shutdown(closing_shutdown).await;
        closing_registry.close_all().await;
    });

    let state = AppState {
        registry,
        notifications: repository.clone(),
        probes: Arc::new(vec![
            repository as Arc<dyn Probe>,
            connection as Arc<dyn Probe>,
        ]),
    };

    let host: std::net::IpAddr = config
        .notifier
        .host
        .parse()
        .with_context(|| format!("Invalid notifier.host '{}'", config.notifier.host))?;
    let addr = SocketAddr::from((host, config.notifier.port));
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(service::wait_for_shutdown(shutdown))
        .await?;

    if tokio::time::timeout(config.shutdown_timeout(), consumer_task)
        .await
        .is_err()
    {
        warn!("Consumer did not stop within the shutdown timeout");
    }

    info!("Notifier shutdown complete");
    Ok(())
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(gateway::ws_handler))
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
