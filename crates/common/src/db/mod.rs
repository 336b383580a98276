//! Database layer for Newswire
//!
//! Provides:
//! - SeaORM entity models
//! - Storage traits consumed by the ingestion and fan-out stages
//! - Postgres repository and an in-memory store with the same semantics
//! - Connection pool management and migrations

mod memory;
pub mod models;
mod repository;

pub use memory::MemoryStore;
pub use repository::Repository;

use crate::config::DatabaseConfig;
use crate::errors::{AppError, Result};
use crate::models::{NotificationRecord, SavedArticle};
use async_trait::async_trait;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection};
use std::sync::Arc;
use std::collections::HashSet;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Article persistence used by the ingestion consumer
#[async_trait]
pub trait ArticleStore: Send + Sync {
    /// Which of `urls` are already stored
    async fn find_existing_urls(&self, urls: &[String]) -> Result<HashSet<String>>;

    /// Store all articles in one transaction. Articles whose url is already
    /// present are skipped; the returned list holds only the newly stored ones.
    async fn save_articles_transactional(
        &self,
        articles: Vec<SavedArticle>,
    ) -> Result<Vec<SavedArticle>>;
}

/// Read-only view of user subscriptions
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Distinct users subscribed to `section`, matched case-insensitively
    async fn find_subscribers(&self, section: &str) -> Result<Vec<Uuid>>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Persist a record unless one already exists for its (user, article)
    /// pair. Returns true when a row was written.
    async fn save_notification(&self, record: &NotificationRecord) -> Result<bool>;

    /// Unread records for a user, oldest first
    async fn unread_notifications(&self, user_id: Uuid) -> Result<Vec<NotificationRecord>>;
}

/// Database connection pool wrapper
#[derive(Clone)]
pub struct DbPool {
    primary: Arc<DatabaseConnection>,
}

impl DbPool {
    /// Create a new database pool from configuration
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to database...");

        let mut opts = ConnectOptions::new(&config.url);
        opts.max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .sqlx_logging(false);

        let primary = Database::connect(opts)
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Failed to connect: {}", e),
            })?;

        info!("Database connection established");
        Ok(Self { primary: Arc::new(primary) })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.primary
    }

    /// Apply pending migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(self.primary.get_postgres_connection_pool())
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Migration failed: {}", e),
            })?;
        info!("Database migrations applied");
        Ok(())
    }

    /// Ping the database to check connectivity
    pub async fn ping(&self) -> Result<()> {
        self.primary
            .execute_unprepared("SELECT 1")
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Ping failed: {}", e),
            })?;
        Ok(())
    }
}

impl From<DatabaseConnection> for DbPool {
    fn from(primary: DatabaseConnection) -> Self {
        Self { primary: Arc::new(primary) }
    }
}

/// Connect, migrate when configured, and build the repository
pub async fn connect(config: &DatabaseConfig) -> Result<Repository> {
    let pool = DbPool::new(config).await?;
    if config.run_migrations {
        pool.migrate().await?;
    }
    Ok(Repository::new(pool))
}
