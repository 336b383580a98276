//! Postgres repository
//!
//! Every write that must be idempotent goes through `ON CONFLICT DO NOTHING`
//! so the unique indexes stay the final arbiter under concurrent consumers.

use crate::db::models::*;
use crate::db::{ArticleStore, DbPool, NotificationStore, SubscriptionStore};
use crate::errors::Result;
use crate::models::{NotificationRecord, SavedArticle};
use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, DbBackend, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
    Statement, TransactionTrait,
};
use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> &DatabaseConnection {
        self.pool.connection()
    }

    /// Ping the database
    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }
}

fn article_active_model(article: &SavedArticle) -> ArticleActiveModel {
    ArticleActiveModel {
        id: Set(article.id),
        url: Set(article.url.clone()),
        title: Set(article.title.clone()),
        content: Set(article.content.clone()),
        author: Set(article.author.clone()),
        portal: Set(article.portal.clone()),
        section: Set(article.section.clone()),
        image_url: Set(article.image_url.clone()),
        published_at: Set(article.published_at.into()),
        scraped_at: Set(article.scraped_at.into()),
        created_at: Set(Utc::now().into()),
    }
}

#[async_trait]
impl ArticleStore for Repository {
    async fn find_existing_urls(&self, urls: &[String]) -> Result<HashSet<String>> {
        if urls.is_empty() {
            return Ok(HashSet::new());
        }

        let existing: Vec<String> = ArticleEntity::find()
            .select_only()
            .column(ArticleColumn::Url)
            .filter(ArticleColumn::Url.is_in(urls.iter().cloned()))
            .into_tuple()
            .all(self.conn())
            .await?;

        Ok(existing.into_iter().collect())
    }

    async fn save_articles_transactional(
        &self,
        articles: Vec<SavedArticle>,
    ) -> Result<Vec<SavedArticle>> {
        if articles.is_empty() {
            return Ok(Vec::new());
        }

        // Dropping the transaction on an early return rolls it back
        let txn = self.conn().begin().await?;
        let mut saved = Vec::with_capacity(articles.len());

        for article in articles {
            let rows = ArticleEntity::insert(article_active_model(&article))
                .on_conflict(OnConflict::column(ArticleColumn::Url).do_nothing().to_owned())
                .exec_without_returning(&txn)
                .await?;

            if rows > 0 {
                saved.push(article);
            } else {
                debug!(url = %article.url, "Article stored concurrently, skipping");
            }
        }

        txn.commit().await?;
        Ok(saved)
    }
}

#[async_trait]
impl SubscriptionStore for Repository {
    async fn find_subscribers(&self, section: &str) -> Result<Vec<Uuid>> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            SELECT DISTINCT user_id
            FROM subscriptions
            WHERE lower(section) = lower($1)
            "#,
            [section.into()],
        );

        let rows = self.conn().query_all(stmt).await?;
        let users = rows
            .iter()
            .map(|row| row.try_get::<Uuid>("", "user_id"))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(users)
    }
}

#[async_trait]
impl NotificationStore for Repository {
    async fn save_notification(&self, record: &NotificationRecord) -> Result<bool> {
        let model = NotificationActiveModel {
            id: Set(record.id),
            user_id: Set(record.user_id),
            article_id: Set(record.article_id),
            message: Set(record.message.clone()),
            is_read: Set(record.is_read),
            created_at: Set(record.created_at.into()),
        };

        let rows = NotificationEntity::insert(model)
            .on_conflict(
                OnConflict::columns([NotificationColumn::UserId, NotificationColumn::ArticleId])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(self.conn())
            .await?;

        Ok(rows > 0)
    }

    async fn unread_notifications(&self, user_id: Uuid) -> Result<Vec<NotificationRecord>> {
        let rows = NotificationEntity::find()
            .filter(NotificationColumn::UserId.eq(user_id))
            .filter(NotificationColumn::IsRead.eq(false))
            .order_by_asc(NotificationColumn::CreatedAt)
            .all(self.conn())
            .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}
