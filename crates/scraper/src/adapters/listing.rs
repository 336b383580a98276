//! Listing-plus-detail adapter
//!
//! The section URL returns a JSON array of headline, url, reporter, thumb and
//! created_at. Article bodies only exist on the detail pages, so each item
//! costs one more request whose body is cut out with `content_selector`.

use super::{
    clean_text, compile_selector, non_blank, parse_timestamp, portal_base, resolve, section_url,
    ScrapeAdapter, ScrapeError,
};
use crate::http::HttpFetcher;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use newswire_common::config::{PortalConfig, SectionConfig};
use newswire_common::models::Article;
use scraper::{Html, Selector};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Detail pages fetched at once within one section
const DETAIL_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ListingItem {
    headline: Option<String>,
    url: Option<String>,
    created_at: Option<String>,
    reporter: Option<String>,
    thumb: Option<String>,
}

/// A listing entry with everything but the body resolved
#[derive(Debug, Clone)]
pub(crate) struct ListingEntry {
    title: String,
    url: Url,
    author: Option<String>,
    published_at: Option<String>,
    image_url: Option<String>,
}

impl ListingEntry {
    fn into_article(self, content: String, portal: &str, section: &str) -> Article {
        Article {
            title: self.title,
            content,
            url: self.url.to_string(),
            author: self.author,
            published_at: self
                .published_at
                .as_deref()
                .and_then(parse_timestamp)
                .unwrap_or_else(Utc::now),
            portal: portal.to_string(),
            section: section.to_string(),
            image_url: self.image_url,
        }
    }
}

pub struct ListingWithDetailAdapter {
    http: Arc<HttpFetcher>,
    content_selector: String,
}

impl ListingWithDetailAdapter {
    pub fn new(http: Arc<HttpFetcher>, content_selector: String) -> Self {
        Self { http, content_selector }
    }

    async fn fetch_body(&self, url: &Url, selector: &Selector) -> Result<String, ScrapeError> {
        let html = self.http.get_text(url.as_str()).await?;
        Ok(extract_body(&html, selector))
    }
}

#[async_trait]
impl ScrapeAdapter for ListingWithDetailAdapter {
    #[instrument(skip_all, fields(portal = %portal.name, section = %section.name))]
    async fn fetch_section(
        &self,
        portal: &PortalConfig,
        section: &SectionConfig,
    ) -> Result<Vec<Article>, ScrapeError> {
        let selector = compile_selector(&self.content_selector)?;
        let url = section_url(portal, section)?;
        let items: Vec<ListingItem> = self.http.get_json(url.as_str()).await?;
        let entries = parse_entries(items, &portal_base(portal)?);

        let selector = &selector;
        let articles: Vec<Article> = stream::iter(entries)
            .map(|entry| async move {
                match self.fetch_body(&entry.url, selector).await {
                    Ok(content) if !content.is_empty() => {
                        Some(entry.into_article(content, &portal.name, &section.name))
                    }
                    Ok(_) => {
                        warn!(url = %entry.url, "Detail page has no body, skipping");
                        None
                    }
                    Err(e) => {
                        warn!(url = %entry.url, error = %e, "Detail page fetch failed, skipping");
                        None
                    }
                }
            })
            .buffered(DETAIL_CONCURRENCY)
            .filter_map(std::future::ready)
            .collect()
            .await;

        info!(count = articles.len(), "Fetched article bodies");
        Ok(articles)
    }

    fn name(&self) -> &'static str {
        "listing_with_detail"
    }
}

/// Keep listing items that carry a headline and a resolvable url
pub(crate) fn parse_entries(items: Vec<ListingItem>, base: &Url) -> Vec<ListingEntry> {
    let total = items.len();
    let entries: Vec<ListingEntry> = items
        .into_iter()
        .filter_map(|item| {
            let title = non_blank(item.headline)?;
            let href = match non_blank(item.url) {
                Some(href) => href,
                None => {
                    warn!(%title, "Skipping listing item without url");
                    return None;
                }
            };
            let url = match resolve(base, &href) {
                Ok(url) => url,
                Err(e) => {
                    warn!(%title, error = %e, "Skipping listing item with invalid url");
                    return None;
                }
            };
            let image_url = non_blank(item.thumb)
                .and_then(|thumb| resolve(base, &thumb).ok())
                .map(String::from);

            Some(ListingEntry {
                title,
                url,
                author: non_blank(item.reporter),
                published_at: item.created_at,
                image_url,
            })
        })
        .collect();

    debug!(total, kept = entries.len(), "Parsed listing");
    entries
}

pub(crate) fn extract_body(html: &str, selector: &Selector) -> String {
    let document = Html::parse_document(html);
    let parts: Vec<String> = document
        .select(selector)
        .map(|element| clean_text(element.text()))
        .filter(|text| !text.is_empty())
        .collect();
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    const LISTING: &str = r#"[
        {
            "headline": "Metro rail extends hours",
            "url": "https://en.samakal.com/bangladesh/article/1234/metro-rail",
            "created_at": "2025-03-01 10:15:00",
            "reporter": "Dhaka Correspondent",
            "thumb": "/uploads/metro.jpg"
        },
        {"headline": "No link here", "created_at": "2025-03-01 09:00:00"},
        {"headline": "  ", "url": "https://en.samakal.com/x"},
        {"headline": "Relative link", "url": "/sports/article/99/final", "reporter": ""}
    ]"#;

    fn base() -> Url {
        Url::parse("https://en.samakal.com").unwrap()
    }

    #[test]
    fn test_parse_entries_skips_unusable_items() {
        let items: Vec<ListingItem> = serde_json::from_str(LISTING).unwrap();
        let entries = parse_entries(items, &base());
        assert_eq!(entries.len(), 2);

        assert_eq!(entries[0].title, "Metro rail extends hours");
        assert_eq!(entries[0].image_url.as_deref(), Some("https://en.samakal.com/uploads/metro.jpg"));
        assert_eq!(entries[1].url.as_str(), "https://en.samakal.com/sports/article/99/final");
        assert!(entries[1].author.is_none());
    }

    #[test]
    fn test_entry_into_article() {
        let items: Vec<ListingItem> = serde_json::from_str(LISTING).unwrap();
        let entry = parse_entries(items, &base()).remove(0);
        let article = entry.into_article("Body text".into(), "Samakal", "National");

        assert_eq!(article.portal, "Samakal");
        assert_eq!(article.section, "National");
        assert_eq!(article.author.as_deref(), Some("Dhaka Correspondent"));
        assert_eq!(article.published_at.hour(), 10);
    }

    #[test]
    fn test_extract_body() {
        let html = r#"
            <html><body>
                <h1>Metro rail extends hours</h1>
                <div class="newsBody">
                    <p>Service now runs until midnight.</p>
                    <p>Passengers welcomed the change.</p>
                </div>
                <div class="related">Other news</div>
            </body></html>
        "#;
        let selector = compile_selector(".newsBody").unwrap();
        assert_eq!(
            extract_body(html, &selector),
            "Service now runs until midnight. Passengers welcomed the change."
        );
    }

    #[test]
    fn test_extract_body_missing_container() {
        let selector = compile_selector(".newsBody").unwrap();
        assert!(extract_body("<html><body><p>x</p></body></html>", &selector).is_empty());
    }
}
