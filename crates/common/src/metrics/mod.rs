//! Metrics and observability utilities
//!
//! Prometheus metrics for every pipeline stage, with standardized naming.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Instant;

/// Metrics prefix for all Newswire metrics
pub const METRICS_PREFIX: &str = "newswire";

/// Buckets for scrape cycle and section fetch latency (in seconds)
pub const SCRAPE_BUCKETS: &[f64] = &[
    0.250, 0.500, 1.000, 2.500, 5.000, 10.00, 30.00, 60.00, 120.0, 300.0,
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Scrape metrics
    describe_counter!(
        format!("{}_sections_scraped_total", METRICS_PREFIX),
        Unit::Count,
        "Section fetches by outcome"
    );

    describe_counter!(
        format!("{}_articles_scraped_total", METRICS_PREFIX),
        Unit::Count,
        "Articles returned by adapters"
    );

    describe_histogram!(
        format!("{}_scrape_cycle_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Scrape cycle latency in seconds"
    );

    describe_counter!(
        format!("{}_scrape_cycles_skipped_total", METRICS_PREFIX),
        Unit::Count,
        "Triggers skipped because a cycle was still running"
    );

    // Transport metrics
    describe_counter!(
        format!("{}_envelopes_published_total", METRICS_PREFIX),
        Unit::Count,
        "Envelopes published by outcome"
    );

    describe_counter!(
        format!("{}_batches_flushed_total", METRICS_PREFIX),
        Unit::Count,
        "Batch flushes by trigger"
    );

    describe_counter!(
        format!("{}_queue_messages_processed_total", METRICS_PREFIX),
        Unit::Count,
        "Deliveries handled by outcome"
    );

    describe_counter!(
        format!("{}_queue_reconnects_total", METRICS_PREFIX),
        Unit::Count,
        "Broker reconnect attempts by outcome"
    );

    // Ingestion metrics
    describe_counter!(
        format!("{}_articles_stored_total", METRICS_PREFIX),
        Unit::Count,
        "Articles committed to storage"
    );

    describe_counter!(
        format!("{}_articles_duplicate_total", METRICS_PREFIX),
        Unit::Count,
        "Articles dropped as already stored"
    );

    describe_histogram!(
        format!("{}_ingestion_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Envelope ingestion latency in seconds"
    );

    // Notification metrics
    describe_counter!(
        format!("{}_notifications_created_total", METRICS_PREFIX),
        Unit::Count,
        "Notification records created"
    );

    describe_counter!(
        format!("{}_live_pushes_total", METRICS_PREFIX),
        Unit::Count,
        "Live pushes by outcome"
    );

    describe_gauge!(
        format!("{}_live_connections", METRICS_PREFIX),
        Unit::Count,
        "Currently registered live connections"
    );

    tracing::info!("Metrics registered");
}

/// Install the Prometheus exporter on `0.0.0.0:port`. Port 0 disables it.
pub fn install_exporter(port: u16) -> crate::Result<()> {
    if port == 0 {
        return Ok(());
    }
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full(format!("{}_scrape_cycle_duration_seconds", METRICS_PREFIX)),
            SCRAPE_BUCKETS,
        )
        .and_then(|builder| builder.install())
        .map_err(|e| crate::AppError::configuration(format!("metrics exporter: {}", e)))?;
    register_metrics();
    tracing::info!(port, "Metrics exporter listening");
    Ok(())
}

/// Times one scrape cycle
pub struct CycleTimer {
    start: Instant,
}

impl CycleTimer {
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    pub fn finish(self, sections_failed: usize) {
        histogram!(
            format!("{}_scrape_cycle_duration_seconds", METRICS_PREFIX),
            "partial" => (sections_failed > 0).to_string()
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}

pub fn record_section(portal: &str, success: bool, articles: usize) {
    let status = if success { "success" } else { "error" };
    counter!(
        format!("{}_sections_scraped_total", METRICS_PREFIX),
        "portal" => portal.to_string(),
        "status" => status
    )
    .increment(1);

    if success {
        counter!(
            format!("{}_articles_scraped_total", METRICS_PREFIX),
            "portal" => portal.to_string()
        )
        .increment(articles as u64);
    }
}

pub fn record_cycle_skipped() {
    counter!(format!("{}_scrape_cycles_skipped_total", METRICS_PREFIX)).increment(1);
}

/// `outcome` is one of buffered, rejected, published, failed
pub fn record_envelope(channel: &str, outcome: &'static str, count: usize) {
    counter!(
        format!("{}_envelopes_published_total", METRICS_PREFIX),
        "channel" => channel.to_string(),
        "outcome" => outcome
    )
    .increment(count as u64);
}

/// `trigger` is one of size, timeout, shutdown
pub fn record_flush(channel: &str, trigger: &'static str) {
    counter!(
        format!("{}_batches_flushed_total", METRICS_PREFIX),
        "channel" => channel.to_string(),
        "trigger" => trigger
    )
    .increment(1);
}

/// `outcome` is one of ack, ack_failed, requeue, dead_letter
pub fn record_delivery(channel: &str, outcome: &'static str) {
    counter!(
        format!("{}_queue_messages_processed_total", METRICS_PREFIX),
        "channel" => channel.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_reconnect(success: bool) {
    let status = if success { "success" } else { "error" };
    counter!(
        format!("{}_queue_reconnects_total", METRICS_PREFIX),
        "status" => status
    )
    .increment(1);
}

pub fn record_ingestion(duration_secs: f64, stored: usize, duplicates: usize, portal: &str) {
    counter!(
        format!("{}_articles_stored_total", METRICS_PREFIX),
        "portal" => portal.to_string()
    )
    .increment(stored as u64);

    counter!(
        format!("{}_articles_duplicate_total", METRICS_PREFIX),
        "portal" => portal.to_string()
    )
    .increment(duplicates as u64);

    histogram!(format!("{}_ingestion_duration_seconds", METRICS_PREFIX)).record(duration_secs);
}

pub fn record_notifications(section: &str, created: usize) {
    counter!(
        format!("{}_notifications_created_total", METRICS_PREFIX),
        "section" => section.to_string()
    )
    .increment(created as u64);
}

pub fn record_push(delivered: bool) {
    let outcome = if delivered { "delivered" } else { "offline" };
    counter!(
        format!("{}_live_pushes_total", METRICS_PREFIX),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn set_live_connections(count: usize) {
    gauge!(format!("{}_live_connections", METRICS_PREFIX)).set(count as f64);
}
