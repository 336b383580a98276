//! Collection API adapter
//!
//! Reads a JSON collection of stories. Story body text lives in
//! `cards[].story-elements[].text` as HTML fragments, which are reduced to
//! plain text and joined.

use super::{clean_text, non_blank, parse_timestamp, resolve, section_url, ScrapeAdapter, ScrapeError};
use crate::http::HttpFetcher;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use newswire_common::config::{PortalConfig, SectionConfig};
use newswire_common::models::Article;
use scraper::Html;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use url::Url;

const DEFAULT_IMAGE_BASE: &str = "https://images.prothomalo.com/";

#[derive(Debug, Deserialize)]
struct Collection {
    #[serde(default)]
    items: Vec<CollectionItem>,
}

#[derive(Debug, Deserialize)]
struct CollectionItem {
    story: Option<Story>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Story {
    headline: Option<String>,
    url: Option<String>,
    author_name: Option<String>,
    hero_image_s3_key: Option<String>,
    /// Epoch milliseconds or a timestamp string
    last_published_at: Option<Value>,
    #[serde(default)]
    cards: Vec<Card>,
}

#[derive(Debug, Deserialize)]
struct Card {
    #[serde(rename = "story-elements", default)]
    story_elements: Vec<StoryElement>,
}

#[derive(Debug, Deserialize)]
struct StoryElement {
    text: Option<String>,
}

pub struct JsonApiAdapter {
    http: Arc<HttpFetcher>,
    image_base: String,
}

impl JsonApiAdapter {
    pub fn new(http: Arc<HttpFetcher>, image_base_url: Option<String>) -> Self {
        Self {
            http,
            image_base: image_base_url.unwrap_or_else(|| DEFAULT_IMAGE_BASE.to_string()),
        }
    }
}

#[async_trait]
impl ScrapeAdapter for JsonApiAdapter {
    #[instrument(skip_all, fields(portal = %portal.name, section = %section.name))]
    async fn fetch_section(
        &self,
        portal: &PortalConfig,
        section: &SectionConfig,
    ) -> Result<Vec<Article>, ScrapeError> {
        let url = section_url(portal, section)?;
        let body = self.http.get_text(url.as_str()).await?;
        parse_collection(&body, url.as_str(), portal, &section.name, &self.image_base)
    }

    fn name(&self) -> &'static str {
        "json_api"
    }
}

pub(crate) fn parse_collection(
    body: &str,
    source: &str,
    portal: &PortalConfig,
    section: &str,
    image_base: &str,
) -> Result<Vec<Article>, ScrapeError> {
    let collection: Collection = serde_json::from_str(body).map_err(|e| ScrapeError::Decode {
        url: source.to_string(),
        message: e.to_string(),
    })?;
    let base = super::portal_base(portal)?;

    let total = collection.items.len();
    let articles: Vec<Article> = collection
        .items
        .into_iter()
        .filter_map(|item| item.story)
        .filter_map(|story| story_to_article(story, &base, portal, section, image_base))
        .collect();

    debug!(total, parsed = articles.len(), "Parsed story collection");
    Ok(articles)
}

fn story_to_article(
    story: Story,
    base: &Url,
    portal: &PortalConfig,
    section: &str,
    image_base: &str,
) -> Option<Article> {
    let Some(title) = non_blank(story.headline) else {
        warn!(url = ?story.url, "Skipping story without headline");
        return None;
    };
    let url = match non_blank(story.url).map(|href| resolve(base, &href)) {
        Some(Ok(url)) => url.to_string(),
        Some(Err(e)) => {
            warn!(%title, error = %e, "Skipping story with invalid url");
            return None;
        }
        None => {
            warn!(%title, "Skipping story without url");
            return None;
        }
    };

    let fragments: Vec<String> = story
        .cards
        .iter()
        .flat_map(|card| &card.story_elements)
        .filter_map(|element| element.text.as_deref())
        .map(strip_markup)
        .filter(|text| !text.is_empty())
        .collect();
    let content = fragments.join(" ");
    if content.is_empty() {
        warn!(%url, "Skipping story without text elements");
        return None;
    }

    Some(Article {
        title,
        content,
        url,
        author: non_blank(story.author_name),
        published_at: story
            .last_published_at
            .as_ref()
            .and_then(published_at)
            .unwrap_or_else(Utc::now),
        portal: portal.name.clone(),
        section: section.to_string(),
        image_url: non_blank(story.hero_image_s3_key).map(|key| image_url(image_base, &key)),
    })
}

fn published_at(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        Value::String(s) => parse_timestamp(s),
        _ => None,
    }
}

fn image_url(base: &str, key: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), key.trim_start_matches('/'))
}

fn strip_markup(fragment: &str) -> String {
    let parsed = Html::parse_fragment(fragment);
    clean_text(parsed.root_element().text())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fixtures;
    use newswire_common::config::AdapterKind;

    const COLLECTION: &str = r#"{
        "items": [
            {
                "story": {
                    "headline": "Padma bridge traffic hits record",
                    "url": "https://en.prothomalo.com/bangladesh/padma-record",
                    "author-name": "Staff Correspondent",
                    "hero-image-s3-key": "prothomalo-english/2025-03/padma.jpg",
                    "last-published-at": 1740824100000,
                    "cards": [
                        {"story-elements": [{"text": "<p>Vehicles crossed in <b>record</b> numbers.</p>"}]},
                        {"story-elements": [{"text": "<p>Tolls rose.</p>"}, {"type": "image"}]}
                    ]
                }
            },
            {
                "story": {
                    "headline": "",
                    "url": "https://en.prothomalo.com/bangladesh/no-title",
                    "cards": [{"story-elements": [{"text": "Body"}]}]
                }
            },
            {
                "story": {
                    "headline": "Relative link story",
                    "url": "/sports/cricket-final",
                    "last-published-at": "2025-03-01T10:15:00Z",
                    "cards": [{"story-elements": [{"text": "Final tonight."}]}]
                }
            },
            {
                "story": {
                    "headline": "Photo gallery",
                    "url": "https://en.prothomalo.com/photo/gallery",
                    "cards": []
                }
            },
            {"collection": {"name": "nested"}}
        ]
    }"#;

    fn portal() -> PortalConfig {
        fixtures::portal(
            "Prothom Alo",
            "https://en.prothomalo.com",
            AdapterKind::JsonApi { image_base_url: None },
        )
    }

    #[test]
    fn test_parse_collection() {
        let articles =
            parse_collection(COLLECTION, "test", &portal(), "National", DEFAULT_IMAGE_BASE).unwrap();
        assert_eq!(articles.len(), 2);

        let first = &articles[0];
        assert_eq!(first.title, "Padma bridge traffic hits record");
        assert_eq!(first.content, "Vehicles crossed in record numbers. Tolls rose.");
        assert_eq!(first.author.as_deref(), Some("Staff Correspondent"));
        assert_eq!(first.portal, "Prothom Alo");
        assert_eq!(first.section, "National");
        assert_eq!(
            first.image_url.as_deref(),
            Some("https://images.prothomalo.com/prothomalo-english/2025-03/padma.jpg")
        );
        assert_eq!(first.published_at.timestamp_millis(), 1740824100000);

        let second = &articles[1];
        assert_eq!(second.url, "https://en.prothomalo.com/sports/cricket-final");
        assert!(second.author.is_none());
        assert!(second.image_url.is_none());
    }

    #[test]
    fn test_malformed_collection_is_section_error() {
        let err = parse_collection("<html>", "test", &portal(), "National", DEFAULT_IMAGE_BASE)
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Decode { .. }));
    }

    #[test]
    fn test_missing_items_is_empty() {
        let articles = parse_collection("{}", "test", &portal(), "National", DEFAULT_IMAGE_BASE).unwrap();
        assert!(articles.is_empty());
    }

    #[test]
    fn test_image_url_joins_cleanly() {
        assert_eq!(image_url("https://img.example/", "/a/b.jpg"), "https://img.example/a/b.jpg");
    }
}
