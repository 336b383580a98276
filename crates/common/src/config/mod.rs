//! Configuration management for Newswire services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default.toml, config/{APP_ENV}.toml, config/local.toml)
//! - Default values
//!
//! Missing required settings are a startup failure, never a silent fallback.

use crate::errors::{AppError, Result};
use crate::retry::RetryPolicy;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Redis configuration (required by the redis queue backend)
    #[serde(default)]
    pub redis: RedisConfig,

    /// Queue transport configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Scrape orchestrator configuration
    #[serde(default)]
    pub scraper: ScraperConfig,

    /// Outbound HTTP configuration
    #[serde(default)]
    pub http: HttpConfig,

    /// Notifier (live delivery) server configuration
    #[serde(default)]
    pub notifier: NotifierConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Postgres URL
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Apply pending migrations on startup
    #[serde(default = "default_enabled")]
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    /// Redis URL
    pub url: Option<String>,

    /// Key prefix for queue lists
    #[serde(default = "default_redis_prefix")]
    pub key_prefix: String,
}

/// Which broker carries the two pipeline channels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    /// In-process broker; only useful when every stage runs in one process
    Memory,
    /// Redis lists with a per-consumer processing list
    #[default]
    Redis,
    /// AWS SQS, one standard queue per channel
    Sqs,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub backend: QueueBackend,

    /// Channel carrying scraped batch envelopes
    #[serde(default = "default_articles_channel")]
    pub articles_channel: String,

    /// Channel carrying per-article notification triggers
    #[serde(default = "default_notifications_channel")]
    pub notifications_channel: String,

    /// Envelopes buffered before a flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Milliseconds after the first buffered envelope before a flush
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout_ms: u64,

    /// Unacknowledged deliveries held by the ingestion consumer
    #[serde(default = "default_ingestion_prefetch")]
    pub ingestion_prefetch: usize,

    /// Unacknowledged deliveries held by the notification consumer
    #[serde(default = "default_notification_prefetch")]
    pub notification_prefetch: usize,

    /// Redeliveries after a failed processing before dead-lettering
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,

    /// Timeout applied to every single broker operation
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,

    /// Long polling wait for brokers that support it
    #[serde(default = "default_poll_wait")]
    pub poll_wait_secs: u64,

    /// SQS visibility timeout
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,

    /// Custom SQS endpoint (localstack, elasticmq)
    #[serde(default)]
    pub sqs_endpoint: Option<String>,

    /// Names this instance's in-flight lists on the redis backend. Must be
    /// unique per replica and stable across its restarts; defaults to
    /// `<service>-<hostname>`.
    #[serde(default)]
    pub consumer_id: Option<String>,

    /// Retry policy applied when flushing a batch
    #[serde(default = "RetryPolicy::publish")]
    pub publish_retry: RetryPolicy,

    /// Retry policy applied when re-establishing the broker connection
    #[serde(default = "RetryPolicy::reconnect")]
    pub reconnect_retry: RetryPolicy,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScraperConfig {
    /// Seconds between scrape cycles
    #[serde(default = "default_scrape_interval")]
    pub interval_secs: u64,

    /// Start a cycle immediately instead of waiting one interval
    #[serde(default = "default_enabled")]
    pub run_on_startup: bool,

    /// Skip sections not started within this many seconds of the cycle start
    #[serde(default)]
    pub cycle_deadline_secs: Option<u64>,

    /// Sections fetched in parallel
    #[serde(default = "default_max_concurrent_sections")]
    pub max_concurrent_sections: usize,

    /// Outbound requests per second across all adapters
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,

    /// Retry policy wrapped around every section fetch
    #[serde(default = "RetryPolicy::scrape")]
    pub retry: RetryPolicy,

    /// Portals to scrape
    #[serde(default)]
    pub portals: Vec<PortalConfig>,
}

/// One news portal and the sections scraped from it
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PortalConfig {
    pub name: String,

    /// Base used to resolve relative links
    pub base_url: String,

    pub adapter: AdapterKind,

    pub sections: Vec<SectionConfig>,
}

/// Extraction strategy for a portal
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterKind {
    /// Collection endpoint returning stories with text cards
    JsonApi {
        /// Prefix for hero image keys
        image_base_url: Option<String>,
    },
    /// JSON listing plus one HTML detail page per article
    ListingWithDetail {
        /// CSS selector for the article body on the detail page
        content_selector: String,
    },
    /// Static HTML page with per-section selectors
    HtmlSelector,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SectionConfig {
    pub name: String,

    /// Absolute URL or path relative to the portal base
    pub url: String,

    /// Required by the html_selector adapter
    #[serde(default)]
    pub selectors: Option<SelectorConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SelectorConfig {
    pub article: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    /// Request timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotifierConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port serving the websocket and health endpoints
    #[serde(default = "default_notifier_port")]
    pub port: u16,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Buffered pushes per live connection
    #[serde(default = "default_connection_buffer")]
    pub connection_buffer: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log filter (debug, info, warn, error or an EnvFilter directive)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for logs
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_notifier_port() -> u16 { 8081 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_connection_buffer() -> usize { 64 }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_redis_prefix() -> String { "newswire".to_string() }
fn default_articles_channel() -> String { "news_articles".to_string() }
fn default_notifications_channel() -> String { "news_notifications".to_string() }
fn default_batch_size() -> usize { 100 }
fn default_batch_timeout() -> u64 { 5_000 }
fn default_ingestion_prefetch() -> usize { 10 }
fn default_notification_prefetch() -> usize { 20 }
fn default_max_redeliveries() -> u32 { 3 }
fn default_operation_timeout() -> u64 { 30 }
fn default_poll_wait() -> u64 { 20 }
fn default_visibility_timeout() -> u64 { 300 }
fn default_scrape_interval() -> u64 { 3_600 }
fn default_max_concurrent_sections() -> usize { 4 }
fn default_requests_per_second() -> u32 { 5 }
fn default_http_timeout() -> u64 { 30 }
fn default_user_agent() -> String { format!("newswire/{}", crate::VERSION) }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "newswire".to_string() }
fn default_enabled() -> bool { true }

fn host_name() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self { url: None, key_prefix: default_redis_prefix() }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            articles_channel: default_articles_channel(),
            notifications_channel: default_notifications_channel(),
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout(),
            ingestion_prefetch: default_ingestion_prefetch(),
            notification_prefetch: default_notification_prefetch(),
            max_redeliveries: default_max_redeliveries(),
            operation_timeout_secs: default_operation_timeout(),
            poll_wait_secs: default_poll_wait(),
            visibility_timeout_secs: default_visibility_timeout(),
            sqs_endpoint: None,
            consumer_id: None,
            publish_retry: RetryPolicy::publish(),
            reconnect_retry: RetryPolicy::reconnect(),
        }
    }
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_scrape_interval(),
            run_on_startup: default_enabled(),
            cycle_deadline_secs: None,
            max_concurrent_sections: default_max_concurrent_sections(),
            requests_per_second: default_requests_per_second(),
            retry: RetryPolicy::scrape(),
            portals: Vec::new(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_notifier_port(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            connection_buffer: default_connection_buffer(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> std::result::Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__QUEUE__BACKEND=sqs
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific file
    pub fn from_file(path: &str) -> std::result::Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Reject settings the pipeline cannot run without
    pub fn validate(&self) -> Result<()> {
        if self.database.url.trim().is_empty() {
            return Err(AppError::configuration("database.url is required"));
        }
        if self.queue.backend == QueueBackend::Redis
            && self.redis.url.as_deref().map_or(true, |u| u.trim().is_empty())
        {
            return Err(AppError::configuration(
                "redis.url is required when queue.backend = \"redis\"",
            ));
        }
        if self.queue.batch_size == 0 {
            return Err(AppError::configuration("queue.batch_size must be at least 1"));
        }
        if self.queue.ingestion_prefetch == 0 || self.queue.notification_prefetch == 0 {
            return Err(AppError::configuration("queue prefetch must be at least 1"));
        }
        if self.queue.articles_channel == self.queue.notifications_channel {
            return Err(AppError::configuration(
                "queue.articles_channel and queue.notifications_channel must differ",
            ));
        }
        Ok(())
    }

    /// Additional checks for the scraper service
    pub fn validate_scraper(&self) -> Result<()> {
        self.validate()?;
        if self.scraper.portals.is_empty() {
            return Err(AppError::configuration("scraper.portals must list at least one portal"));
        }
        for portal in &self.scraper.portals {
            if portal.sections.is_empty() {
                return Err(AppError::configuration(format!(
                    "portal '{}' has no sections",
                    portal.name
                )));
            }
            if portal.adapter == AdapterKind::HtmlSelector {
                if let Some(section) = portal.sections.iter().find(|s| s.selectors.is_none()) {
                    return Err(AppError::configuration(format!(
                        "section '{}' of portal '{}' needs selectors for the html_selector adapter",
                        section.name, portal.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.queue.batch_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.queue.operation_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.notifier.shutdown_timeout_secs)
    }

    /// Consumer id for `service`: `queue.consumer_id` when set, otherwise
    /// the service name qualified by the host name
    pub fn consumer_id(&self, service: &str) -> String {
        match self.queue.consumer_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => match host_name() {
                Some(host) => format!("{}-{}", service, host),
                None => service.to_string(),
            },
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgres://localhost/newswire".to_string(),
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                connect_timeout_secs: default_connect_timeout(),
                idle_timeout_secs: default_idle_timeout(),
                run_migrations: default_enabled(),
            },
            redis: RedisConfig {
                url: Some("redis://localhost:6379".to_string()),
                key_prefix: default_redis_prefix(),
            },
            queue: QueueConfig::default(),
            scraper: ScraperConfig::default(),
            http: HttpConfig::default(),
            notifier: NotifierConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}
