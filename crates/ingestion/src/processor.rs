//! Ingestion processor
//!
//! Turns delivered batches into stored articles: drops urls already stored
//! or repeated inside the envelope, stores the rest in one transaction and
//! emits one notification trigger per newly stored article.

use crate::errors::IngestionError;
use async_trait::async_trait;
use futures::future::join_all;
use newswire_common::db::ArticleStore;
use newswire_common::metrics;
use newswire_common::models::{BatchEnvelope, NotificationTrigger, SavedArticle};
use newswire_common::transport::{Connection, Delivery, MessageHandler};
use newswire_common::{AppError, RetryPolicy};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument};

/// A delivery carries either one flushed batch or a single envelope
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DeliveryBody {
    Batch(Vec<BatchEnvelope>),
    Single(BatchEnvelope),
}

impl DeliveryBody {
    fn into_envelopes(self) -> Vec<BatchEnvelope> {
        match self {
            DeliveryBody::Batch(envelopes) => envelopes,
            DeliveryBody::Single(envelope) => vec![envelope],
        }
    }
}

/// Result of ingesting one envelope
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvelopeOutcome {
    pub received: usize,
    pub duplicates: usize,
    pub stored: usize,
    pub triggers_published: usize,
    pub trigger_failures: usize,
}

impl EnvelopeOutcome {
    fn merge(mut self, other: EnvelopeOutcome) -> Self {
        self.received += other.received;
        self.duplicates += other.duplicates;
        self.stored += other.stored;
        self.triggers_published += other.triggers_published;
        self.trigger_failures += other.trigger_failures;
        self
    }
}

pub struct IngestionProcessor {
    store: Arc<dyn ArticleStore>,
    connection: Arc<Connection>,
    notifications_channel: String,
    publish_retry: RetryPolicy,
}

impl IngestionProcessor {
    pub fn new(
        store: Arc<dyn ArticleStore>,
        connection: Arc<Connection>,
        notifications_channel: String,
        publish_retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            connection,
            notifications_channel,
            publish_retry,
        }
    }

    /// Ingest every envelope of a delivery body, in order
    pub async fn process_body(&self, body: &str) -> Result<EnvelopeOutcome, IngestionError> {
        let envelopes = serde_json::from_str::<DeliveryBody>(body)?.into_envelopes();
        debug!(envelopes = envelopes.len(), "Decoded delivery");

        let mut total = EnvelopeOutcome::default();
        for envelope in &envelopes {
            total = total.merge(self.process_envelope(envelope).await?);
        }
        Ok(total)
    }

    #[instrument(skip_all, fields(portal = %envelope.portal_name, articles = envelope.articles.len()))]
    pub async fn process_envelope(&self, envelope: &BatchEnvelope) -> Result<EnvelopeOutcome, IngestionError> {
        let started = Instant::now();
        let received = envelope.articles.len();

        let mut seen = HashSet::new();
        let unique: Vec<_> = envelope
            .articles
            .iter()
            .filter(|article| seen.insert(article.url.as_str()))
            .collect();
        let urls: Vec<String> = unique.iter().map(|article| article.url.clone()).collect();

        let existing = self
            .store
            .find_existing_urls(&urls)
            .await
            .map_err(IngestionError::Storage)?;

        let fresh: Vec<SavedArticle> = unique
            .into_iter()
            .filter(|article| !existing.contains(&article.url))
            .map(|article| SavedArticle::prepare(article, envelope.scraped_at))
            .collect();

        if fresh.is_empty() {
            info!(duplicates = received, "Envelope holds no new articles");
            metrics::record_ingestion(started.elapsed().as_secs_f64(), 0, received, &envelope.portal_name);
            return Ok(EnvelopeOutcome {
                received,
                duplicates: received,
                ..EnvelopeOutcome::default()
            });
        }

        // Rows that lost a race with a concurrent envelope are left out of `saved`
        let saved = self
            .store
            .save_articles_transactional(fresh)
            .await
            .map_err(IngestionError::Storage)?;
        let duplicates = received - saved.len();

        let (triggers_published, trigger_failures) = self.publish_triggers(&saved).await;

        metrics::record_ingestion(
            started.elapsed().as_secs_f64(),
            saved.len(),
            duplicates,
            &envelope.portal_name,
        );
        info!(
            stored = saved.len(),
            duplicates,
            triggers_published,
            trigger_failures,
            "Envelope ingested"
        );

        Ok(EnvelopeOutcome {
            received,
            duplicates,
            stored: saved.len(),
            triggers_published,
            trigger_failures,
        })
    }

    /// Publish one trigger per stored article. Failures are logged only;
    /// the articles stay stored.
    async fn publish_triggers(&self, saved: &[SavedArticle]) -> (usize, usize) {
        let results = join_all(saved.iter().map(|article| async move {
            let trigger = NotificationTrigger {
                article: article.clone(),
            };
            let result = self
                .connection
                .publish_json(&self.notifications_channel, &trigger, &self.publish_retry)
                .await;
            if let Err(ref e) = result {
                error!(url = %article.url, error = %e, "Failed to publish notification trigger");
            }
            result.is_ok()
        }))
        .await;

        let published = results.iter().filter(|ok| **ok).count();
        (published, results.len() - published)
    }
}

#[async_trait]
impl MessageHandler for IngestionProcessor {
    async fn handle(&self, delivery: &Delivery) -> newswire_common::Result<()> {
        debug!(delivery_id = %delivery.id, attempt = delivery.attempt, "Processing delivery");
        self.process_body(&delivery.body)
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
    use newswire_common::models::Article;
    use newswire_common::transport::{
        dead_letter_channel, Consumer, ConsumerSettings, MemoryBroker, OutboundMessage,
    };
    use std::time::Duration;
    use tokio_test::assert_ok;

    const ARTICLES: &str = "news_articles";
    const NOTIFICATIONS: &str = "news_notifications";

    fn article(url: &str) -> Article {
        Article {
            title: "Markets rally".into(),
            content: "Stocks rose on Tuesday.".into(),
            url: url.into(),
            author: None,
            published_at: Utc::now(),
            portal: "Reuters".into(),
            section: "Business".into(),
            image_url: None,
        }
    }

    fn envelope(urls: &[&str]) -> BatchEnvelope {
        BatchEnvelope::new("Reuters", urls.iter().map(|url| article(url)).collect())
    }

    struct Harness {
        broker: MemoryBroker,
        store: Arc<MemoryStore>,
        connection: Arc<Connection>,
        processor: Arc<IngestionProcessor>,
    }

    async fn harness() -> Harness {
        let broker = MemoryBroker::new();
        let connection = Arc::new(
            Connection::open(Arc::new(broker.clone()), RetryPolicy::new(2, 10), Duration::from_secs(5))
                .await
                .unwrap(),
        );
        connection.declare_channel(ARTICLES).await.unwrap();
        connection.declare_channel(NOTIFICATIONS).await.unwrap();

        let store = Arc::new(MemoryStore::new());
        let processor = Arc::new(IngestionProcessor::new(
            store.clone(),
            connection.clone(),
            NOTIFICATIONS.into(),
            RetryPolicy::new(2, 10),
        ));
        Harness {
            broker,
            store,
            connection,
            processor,
        }
    }

    #[tokio::test]
    async fn test_new_articles_stored_and_triggered() {
        let h = harness().await;
        let existing = envelope(&["https://r.example/1", "https://r.example/2"]);
        assert_ok!(h.processor.process_envelope(&existing).await);
        let triggers_before = h.broker.depth(NOTIFICATIONS).await;

        let batch = envelope(&[
            "https://r.example/1",
            "https://r.example/2",
            "https://r.example/3",
            "https://r.example/4",
            "https://r.example/5",
        ]);
        let outcome = h.processor.process_envelope(&batch).await.unwrap();

        assert_eq!(outcome.received, 5);
        assert_eq!(outcome.duplicates, 2);
        assert_eq!(outcome.stored, 3);
        assert_eq!(outcome.triggers_published, 3);
        assert_eq!(h.store.articles().await.len(), 5);
        assert_eq!(h.broker.depth(NOTIFICATIONS).await - triggers_before, 3);

        let triggers: Vec<NotificationTrigger> = h
            .broker
            .peek(NOTIFICATIONS)
            .await
            .iter()
            .map(|(body, _)| serde_json::from_str(body).unwrap())
            .collect();
        let mut urls: Vec<_> = triggers[triggers_before..]
            .iter()
            .map(|t| t.article.url.as_str())
            .collect();
        urls.sort();
        assert_eq!(urls, vec!["https://r.example/3", "https://r.example/4", "https://r.example/5"]);
        assert!(triggers.iter().all(|t| t.article.portal == "reuters"));
    }

    #[tokio::test]
    async fn test_repeated_envelope_is_idempotent() {
        let h = harness().await;
        let batch = envelope(&["https://r.example/1", "https://r.example/2"]);

        h.processor.process_envelope(&batch).await.unwrap();
        let second = h.processor.process_envelope(&batch).await.unwrap();

        assert_eq!(second.stored, 0);
        assert_eq!(second.duplicates, 2);
        assert_eq!(h.store.articles().await.len(), 2);
        assert_eq!(h.broker.depth(NOTIFICATIONS).await, 2);
    }

    #[tokio::test]
    async fn test_urls_repeated_within_envelope() {
        let h = harness().await;
        let batch = envelope(&["https://r.example/1", "https://r.example/1", "https://r.example/2"]);

        let outcome = h.processor.process_envelope(&batch).await.unwrap();
        assert_eq!(outcome.stored, 2);
        assert_eq!(outcome.duplicates, 1);
    }

    #[tokio::test]
    async fn test_storage_failure_is_error_without_triggers() {
        let h = harness().await;
        h.store.set_fail_writes(true);

        let err = h
            .processor
            .process_envelope(&envelope(&["https://r.example/1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::Storage(_)));
        assert!(h.store.articles().await.is_empty());
        assert_eq!(h.broker.depth(NOTIFICATIONS).await, 0);
    }

    #[tokio::test]
    async fn test_trigger_failure_keeps_stored_articles() {
        let h = harness().await;
        let processor = IngestionProcessor::new(
            h.store.clone(),
            h.connection.clone(),
            "undeclared".into(),
            RetryPolicy::new(2, 10),
        );

        let outcome = processor
            .process_envelope(&envelope(&["https://r.example/1"]))
            .await
            .unwrap();
        assert_eq!(outcome.stored, 1);
        assert_eq!(outcome.trigger_failures, 1);
        assert_eq!(h.store.articles().await.len(), 1);
    }

    #[tokio::test]
    async fn test_body_accepts_batch_and_single_envelope() {
        let h = harness().await;
        let batch = vec![envelope(&["https://r.example/1"]), envelope(&["https://r.example/2"])];
        let outcome = h
            .processor
            .process_body(&serde_json::to_string(&batch).unwrap())
            .await
            .unwrap();
        assert_eq!(outcome.stored, 2);

        let single = envelope(&["https://r.example/3"]);
        let outcome = h
            .processor
            .process_body(&serde_json::to_string(&single).unwrap())
            .await
            .unwrap();
        assert_eq!(outcome.stored, 1);

        assert!(matches!(
            h.processor.process_body("{\"not\":\"an envelope\"}").await,
            Err(IngestionError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_consumer_settlement() {
        let h = harness().await;
        let consumer = Consumer::new(
            h.connection.clone(),
            h.processor.clone(),
            ConsumerSettings {
                channel: ARTICLES.into(),
                prefetch: 10,
                max_redeliveries: 3,
                idle_poll: Duration::from_millis(100),
            },
        );

        let batch = vec![envelope(&["https://r.example/1", "https://r.example/2"])];
        h.connection
            .publish(ARTICLES, OutboundMessage::json(&batch).unwrap())
            .await
            .unwrap();
        h.connection
            .publish(ARTICLES, OutboundMessage::new("garbage".into()))
            .await
            .unwrap();

        assert_eq!(consumer.poll_once().await.unwrap(), 2);
        assert_eq!(h.broker.depth(ARTICLES).await, 0);
        assert_eq!(h.broker.depth(&dead_letter_channel(ARTICLES)).await, 1);
        assert_eq!(h.store.articles().await.len(), 2);
    }

    #[tokio::test]
    async fn test_storage_outage_requeues_delivery() {
        let h = harness().await;
        let consumer = Consumer::new(
            h.connection.clone(),
            h.processor.clone(),
            ConsumerSettings {
                channel: ARTICLES.into(),
                prefetch: 10,
                max_redeliveries: 3,
                idle_poll: Duration::from_millis(100),
            },
        );
        let batch = vec![envelope(&["https://r.example/1"])];
        h.connection
            .publish(ARTICLES, OutboundMessage::json(&batch).unwrap())
            .await
            .unwrap();

        h.store.set_fail_writes(true);
        consumer.poll_once().await.unwrap();
        assert_eq!(h.broker.depth(ARTICLES).await, 1);

        h.store.set_fail_writes(false);
        consumer.poll_once().await.unwrap();
        assert_eq!(h.broker.depth(ARTICLES).await, 0);
        assert_eq!(h.store.articles().await.len(), 1);
    }
}
