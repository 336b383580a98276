//! Pipeline domain types
//!
//! Wire shapes use camelCase field names so envelopes published by older
//! producers stay readable.

mod validation;

pub use validation::{not_blank, validate_envelope};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Push event type carried in every live notification
pub const NOTIFICATION_EVENT_TYPE: &str = "news_notifications";

/// An article as produced by a scrape adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    #[validate(custom(function = "not_blank", message = "Article title is required"))]
    pub title: String,

    #[validate(custom(function = "not_blank", message = "Article content is required"))]
    pub content: String,

    #[validate(url(message = "Invalid article URL format"))]
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    pub published_at: DateTime<Utc>,

    #[validate(custom(function = "not_blank", message = "Portal name is required"))]
    pub portal: String,

    #[validate(custom(function = "not_blank", message = "Section name is required"))]
    pub section: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(url(message = "Invalid image URL format"))]
    pub image_url: Option<String>,
}

/// One published unit: a batch of scraped articles plus metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "validation::validate_total_articles"))]
pub struct BatchEnvelope {
    #[validate(length(min = 1, message = "Articles array cannot be empty"), nested)]
    pub articles: Vec<Article>,

    #[validate(custom(function = "not_blank", message = "Portal name is required"))]
    pub portal_name: String,

    pub scraped_at: DateTime<Utc>,

    pub total_articles: usize,
}

impl BatchEnvelope {
    /// Build an envelope whose count matches its articles
    pub fn new(portal_name: impl Into<String>, articles: Vec<Article>) -> Self {
        Self {
            total_articles: articles.len(),
            articles,
            portal_name: portal_name.into(),
            scraped_at: Utc::now(),
        }
    }

    pub fn urls(&self) -> Vec<String> {
        self.articles.iter().map(|a| a.url.clone()).collect()
    }
}

/// An article after it has been committed to storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedArticle {
    pub id: Uuid,
    pub url: String,
    pub title: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub portal: String,
    pub section: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub published_at: DateTime<Utc>,
    pub scraped_at: DateTime<Utc>,
}

impl SavedArticle {
    /// Prepare a scraped article for storage.
    ///
    /// Portal and section are lower-cased so subscriptions match regardless
    /// of how a portal capitalizes its navigation.
    pub fn prepare(article: &Article, scraped_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            url: article.url.clone(),
            title: article.title.trim().to_string(),
            content: article.content.trim().to_string(),
            author: article.author.clone().filter(|a| !a.trim().is_empty()),
            portal: article.portal.trim().to_lowercase(),
            section: article.section.trim().to_lowercase(),
            image_url: article.image_url.clone(),
            published_at: article.published_at,
            scraped_at,
        }
    }
}

/// In-flight event between ingestion and notification fan-out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationTrigger {
    pub article: SavedArticle,
}

impl NotificationTrigger {
    /// The text shown to every subscriber of the article's section
    pub fn message(&self) -> String {
        format!(
            "New article from {} in {}: {}",
            self.article.portal, self.article.section, self.article.title
        )
    }
}

/// A persisted per-user notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub article_id: Uuid,
    pub message: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl NotificationRecord {
    pub fn unread(user_id: Uuid, article_id: Uuid, message: String) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id,
            article_id,
            message,
            is_read: false,
            created_at: Utc::now(),
        }
    }
}

/// Body of a live `notification` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivePayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub article: Option<SavedArticle>,
}

impl LivePayload {
    pub fn for_article(message: String, article: &SavedArticle) -> Self {
        Self {
            kind: NOTIFICATION_EVENT_TYPE.to_string(),
            message,
            article: Some(article.clone()),
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn article(url: &str) -> Article {
        Article {
            title: "Floods displace thousands".to_string(),
            content: "Heavy monsoon rains caused rivers to overflow.".to_string(),
            url: url.to_string(),
            author: Some("Staff Reporter".to_string()),
            published_at: Utc::now(),
            portal: "Reuters".to_string(),
            section: "World".to_string(),
            image_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_format_is_camel_case() {
        let envelope = BatchEnvelope::new("Reuters", vec![fixtures::article("https://r.example/a")]);
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["portalName"], "Reuters");
        assert_eq!(json["totalArticles"], 1);
        assert!(json["articles"][0].get("publishedAt").is_some());
        assert!(json["articles"][0].get("imageUrl").is_none());
    }

    #[test]
    fn test_prepare_normalizes_portal_and_section() {
        let saved = SavedArticle::prepare(&fixtures::article("https://r.example/a"), Utc::now());
        assert_eq!(saved.portal, "reuters");
        assert_eq!(saved.section, "world");
    }

    #[test]
    fn test_trigger_message_text() {
        let saved = SavedArticle::prepare(&fixtures::article("https://r.example/a"), Utc::now());
        let trigger = NotificationTrigger { article: saved };
        assert_eq!(
            trigger.message(),
            "New article from reuters in world: Floods displace thousands"
        );
    }

    #[test]
    fn test_live_payload_uses_type_key() {
        let saved = SavedArticle::prepare(&fixtures::article("https://r.example/a"), Utc::now());
        let payload = LivePayload::for_article("hello".into(), &saved);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], NOTIFICATION_EVENT_TYPE);
        assert_eq!(json["article"]["url"], "https://r.example/a");
    }
}
