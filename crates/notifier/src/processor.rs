//! Notification fan-out
//!
//! For every trigger: look up the section's subscribers, persist one unread
//! record per subscriber and push each newly created record to its user as
//! soon as it is written. A record written by an attempt that later fails has
//! already been pushed, so the redelivered trigger skips it without losing
//! the push.

use async_trait::async_trait;
use futures::future::join_all;
use newswire_common::db::{NotificationStore, SubscriptionStore};
use newswire_common::live::LiveRegistry;
use newswire_common::metrics;
use newswire_common::models::{LivePayload, NotificationRecord, NotificationTrigger};
use newswire_common::transport::{Delivery, MessageHandler};
use newswire_common::AppError;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Error, Debug)]
pub enum FanoutError {
    #[error("Malformed trigger: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[source] AppError),
}

impl From<FanoutError> for AppError {
    fn from(e: FanoutError) -> Self {
        match e {
            FanoutError::Decode(e) => AppError::Serialization(e),
            FanoutError::Storage(e) => e,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutOutcome {
    pub subscribers: usize,
    /// Records written by this attempt; redelivered triggers write none
    pub created: usize,
    pub pushed: usize,
}

pub struct FanoutProcessor {
    subscriptions: Arc<dyn SubscriptionStore>,
    notifications: Arc<dyn NotificationStore>,
    registry: LiveRegistry,
}

impl FanoutProcessor {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        notifications: Arc<dyn NotificationStore>,
        registry: LiveRegistry,
    ) -> Self {
        Self {
            subscriptions,
            notifications,
            registry,
        }
    }

    #[instrument(skip_all, fields(article_id = %trigger.article.id, section = %trigger.article.section))]
    pub async fn process_trigger(&self, trigger: &NotificationTrigger) -> Result<FanoutOutcome, FanoutError> {
        let article = &trigger.article;
        let subscribers = self
            .subscriptions
            .find_subscribers(&article.section)
            .await
            .map_err(FanoutError::Storage)?;

        if subscribers.is_empty() {
            debug!("No subscribers for section");
            metrics::record_notifications(&article.section, 0);
            return Ok(FanoutOutcome::default());
        }

        let message = trigger.message();
        let payload = LivePayload::for_article(message.clone(), article);
        let results = join_all(subscribers.iter().map(|user_id| {
            let record = NotificationRecord::unread(*user_id, article.id, message.clone());
            let payload = payload.clone();
            async move {
                if !self.notifications.save_notification(&record).await? {
                    return Ok::<_, AppError>(None);
                }
                Ok(Some(self.registry.push(record.user_id, payload).await))
            }
        }))
        .await;

        let mut created = 0;
        let mut pushed = 0;
        let mut failure = None;
        for result in results {
            match result {
                Ok(Some(delivered)) => {
                    created += 1;
                    pushed += usize::from(delivered);
                }
                Ok(None) => {}
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        metrics::record_notifications(&article.section, created);
        if let Some(e) = failure {
            return Err(FanoutError::Storage(e));
        }

        info!(
            subscribers = subscribers.len(),
            created,
            pushed,
            "Notifications fanned out"
        );
        Ok(FanoutOutcome {
            subscribers: subscribers.len(),
            created,
            pushed,
        })
    }
}

#[async_trait]
impl MessageHandler for FanoutProcessor {
    async fn handle(&self, delivery: &Delivery) -> newswire_common::Result<()> {
        let trigger: NotificationTrigger = serde_json::from_str(&delivery.body)?;
        self.process_trigger(&trigger)
            .await
            .map(|_| ())
            .map_err(AppError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use newswire_common::db::MemoryStore;
    use newswire_common::models::{SavedArticle, NOTIFICATION_EVENT_TYPE};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio_test::{assert_err, assert_ok};
    use uuid::Uuid;

    /// Fails the first write for one user, then behaves like `inner`
    struct FailFirstWriteFor {
        inner: Arc<MemoryStore>,
        user_id: Uuid,
        failed: AtomicBool,
    }

    #[async_trait]
    impl NotificationStore for FailFirstWriteFor {
        async fn save_notification(&self, record: &NotificationRecord) -> newswire_common::Result<bool> {
            if record.user_id == self.user_id && !self.failed.swap(true, Ordering::SeqCst) {
                return Err(AppError::DatabaseConnection {
                    message: "connection reset".into(),
                });
            }
            self.inner.save_notification(record).await
        }

        async fn unread_notifications(&self, user_id: Uuid) -> newswire_common::Result<Vec<NotificationRecord>> {
            self.inner.unread_notifications(user_id).await
        }
    }

    fn trigger(section: &str) -> NotificationTrigger {
        NotificationTrigger {
            article: SavedArticle {
                id: Uuid::now_v7(),
                url: "https://r.example/markets".into(),
                title: "Markets rally".into(),
                content: "Stocks rose.".into(),
                author: None,
                portal: "reuters".into(),
                section: section.into(),
                image_url: None,
                published_at: Utc::now(),
                scraped_at: Utc::now(),
            },
        }
    }

    fn processor(store: &Arc<MemoryStore>, registry: &LiveRegistry) -> FanoutProcessor {
        FanoutProcessor::new(store.clone(), store.clone(), registry.clone())
    }

    #[tokio::test]
    async fn test_zero_subscribers_is_success() {
        let store = Arc::new(MemoryStore::new());
        let registry = LiveRegistry::new(8);
        let outcome = processor(&store, &registry)
            .process_trigger(&trigger("business"))
            .await
            .unwrap();

        assert_eq!(outcome, FanoutOutcome::default());
        assert!(store.notifications().await.is_empty());
    }

    #[tokio::test]
    async fn test_one_record_per_subscriber() {
        let store = Arc::new(MemoryStore::new());
        let registry = LiveRegistry::new(8);
        let (alice, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.subscribe(alice, "Business").await;
        store.subscribe(bob, "business").await;
        store.subscribe(carol, "sports").await;
        let mut alice_live = registry.register(alice).await;

        let trigger = trigger("business");
        let outcome = processor(&store, &registry).process_trigger(&trigger).await.unwrap();

        assert_eq!(outcome.subscribers, 2);
        assert_eq!(outcome.created, 2);
        assert_eq!(outcome.pushed, 1);

        let records = store.notifications().await;
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| !r.is_read && r.article_id == trigger.article.id));
        assert!(records
            .iter()
            .all(|r| r.message == "New article from reuters in business: Markets rally"));

        let pushed = alice_live.receiver.recv().await.unwrap();
        assert_eq!(pushed.kind, NOTIFICATION_EVENT_TYPE);
        assert_eq!(pushed.article.unwrap().id, trigger.article.id);
    }

    #[tokio::test]
    async fn test_redelivered_trigger_creates_no_duplicates() {
        let store = Arc::new(MemoryStore::new());
        let registry = LiveRegistry::new(8);
        let user = Uuid::new_v4();
        store.subscribe(user, "business").await;
        let mut live = registry.register(user).await;

        let processor = processor(&store, &registry);
        let trigger = trigger("business");
        assert_ok!(processor.process_trigger(&trigger).await);
        let second = processor.process_trigger(&trigger).await.unwrap();

        assert_eq!(second.created, 0);
        assert_eq!(second.pushed, 0);
        assert_eq!(store.notifications().await.len(), 1);
        assert!(live.receiver.recv().await.is_some());
        assert!(live.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_storage_failure_is_error() {
        let store = Arc::new(MemoryStore::new());
        store.subscribe(Uuid::new_v4(), "business").await;
        store.set_fail_writes(true);

        let err = assert_err!(
            processor(&store, &LiveRegistry::new(8))
                .process_trigger(&trigger("business"))
                .await
        );
        assert!(matches!(err, FanoutError::Storage(_)));
    }

    #[tokio::test]
    async fn test_partial_failure_still_pushes_every_subscriber_once() {
        let store = Arc::new(MemoryStore::new());
        let registry = LiveRegistry::new(8);
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        store.subscribe(alice, "business").await;
        store.subscribe(bob, "business").await;
        let mut alice_live = registry.register(alice).await;
        let mut bob_live = registry.register(bob).await;

        let processor = FanoutProcessor::new(
            store.clone(),
            Arc::new(FailFirstWriteFor {
                inner: store.clone(),
                user_id: bob,
                failed: AtomicBool::new(false),
            }),
            registry.clone(),
        );
        let trigger = trigger("business");

        assert_err!(processor.process_trigger(&trigger).await);
        assert_eq!(store.notifications().await.len(), 1);
        assert!(alice_live.receiver.try_recv().is_ok());
        assert!(bob_live.receiver.try_recv().is_err());

        let retried = assert_ok!(processor.process_trigger(&trigger).await);
        assert_eq!(retried.created, 1);
        assert_eq!(retried.pushed, 1);
        assert_eq!(store.notifications().await.len(), 2);
        assert!(bob_live.receiver.try_recv().is_ok());
        assert!(alice_live.receiver.try_recv().is_err());
    }
}
