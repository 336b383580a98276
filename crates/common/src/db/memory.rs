//! In-process store with the repository's semantics
//!
//! Used by the consumers' tests and by single-process local runs. A write
//! either applies fully or not at all, like the Postgres transaction.

use crate::db::{ArticleStore, NotificationStore, SubscriptionStore};
use crate::errors::{AppError, Result};
use crate::models::{NotificationRecord, SavedArticle};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    articles: HashMap<String, SavedArticle>,
    subscriptions: HashSet<(Uuid, String)>,
    notifications: HashMap<(Uuid, Uuid), NotificationRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail until reset
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn subscribe(&self, user_id: Uuid, section: &str) {
        self.tables
            .write()
            .await
            .subscriptions
            .insert((user_id, section.to_lowercase()));
    }

    pub async fn articles(&self) -> Vec<SavedArticle> {
        self.tables.read().await.articles.values().cloned().collect()
    }

    pub async fn notifications(&self) -> Vec<NotificationRecord> {
        self.tables.read().await.notifications.values().cloned().collect()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseConnection {
                message: "memory store writes disabled".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ArticleStore for MemoryStore {
    async fn find_existing_urls(&self, urls: &[String]) -> Result<HashSet<String>> {
        let tables = self.tables.read().await;
        Ok(urls
            .iter()
            .filter(|url| tables.articles.contains_key(*url))
            .cloned()
            .collect())
    }

    async fn save_articles_transactional(
        &self,
        articles: Vec<SavedArticle>,
    ) -> Result<Vec<SavedArticle>> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        let mut saved = Vec::with_capacity(articles.len());

        for article in articles {
            if tables.articles.contains_key(&article.url) {
                continue;
            }
            tables.articles.insert(article.url.clone(), article.clone());
            saved.push(article);
        }
        Ok(saved)
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn find_subscribers(&self, section: &str) -> Result<Vec<Uuid>> {
        let section = section.to_lowercase();
        let tables = self.tables.read().await;
        let users: HashSet<Uuid> = tables
            .subscriptions
            .iter()
            .filter(|(_, s)| *s == section)
            .map(|(user, _)| *user)
            .collect();
        Ok(users.into_iter().collect())
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn save_notification(&self, record: &NotificationRecord) -> Result<bool> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        let key = (record.user_id, record.article_id);
        if tables.notifications.contains_key(&key) {
            return Ok(false);
        }
        tables.notifications.insert(key, record.clone());
        Ok(true)
    }

    async fn unread_notifications(&self, user_id: Uuid) -> Result<Vec<NotificationRecord>> {
        let tables = self.tables.read().await;
        let mut records: Vec<NotificationRecord> = tables
            .notifications
            .values()
            .filter(|r| r.user_id == user_id && !r.is_read)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::article;
    use chrono::Utc;

    fn saved(url: &str) -> SavedArticle {
        SavedArticle::prepare(&article(url), Utc::now())
    }

    #[tokio::test]
    async fn test_save_is_idempotent_per_url() {
        let store = MemoryStore::new();
        let first = store
            .save_articles_transactional(vec![saved("https://r.example/1"), saved("https://r.example/2")])
            .await
            .unwrap();
        assert_eq!(first.len(), 2);

        let second = store
            .save_articles_transactional(vec![saved("https://r.example/1"), saved("https://r.example/2")])
            .await
            .unwrap();
        assert!(second.is_empty());
        assert_eq!(store.articles().await.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_nothing() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(store
            .save_articles_transactional(vec![saved("https://r.example/1")])
            .await
            .is_err());
        assert!(store.articles().await.is_empty());
    }

    #[tokio::test]
    async fn test_subscribers_match_case_insensitively() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        store.subscribe(user, "World").await;
        store.subscribe(Uuid::new_v4(), "sports").await;

        assert_eq!(store.find_subscribers("world").await.unwrap(), vec![user]);
        assert!(store.find_subscribers("business").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_notification_upsert() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let article_id = Uuid::new_v4();

        let record = NotificationRecord::unread(user, article_id, "hello".into());
        assert!(store.save_notification(&record).await.unwrap());

        let again = NotificationRecord::unread(user, article_id, "hello".into());
        assert!(!store.save_notification(&again).await.unwrap());
        assert_eq!(store.unread_notifications(user).await.unwrap().len(), 1);
    }
}
