//! Portal scrape adapters
//!
//! One adapter per extraction strategy, selected by the portal's
//! `adapter.kind`. An adapter turns one configured section into articles;
//! items it cannot make sense of are skipped, while a failure to fetch or
//! decode the section page is returned as an error for that section.

mod html;
mod json_api;
mod listing;

pub use html::HtmlSelectorAdapter;
pub use json_api::JsonApiAdapter;
pub use listing::ListingWithDetailAdapter;

use crate::http::HttpFetcher;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use newswire_common::config::{AdapterKind, PortalConfig, SectionConfig};
use newswire_common::models::Article;
use newswire_common::AppError;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("HTTP request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("Failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("Invalid selector '{selector}': {message}")]
    Selector { selector: String, message: String },

    #[error("Invalid URL '{url}': {message}")]
    Url { url: String, message: String },

    #[error("Section '{section}' has no selectors configured")]
    MissingSelectors { section: String },

    #[error(transparent)]
    App(#[from] AppError),
}

#[async_trait]
pub trait ScrapeAdapter: Send + Sync {
    /// Scrape one section of `portal`
    async fn fetch_section(
        &self,
        portal: &PortalConfig,
        section: &SectionConfig,
    ) -> Result<Vec<Article>, ScrapeError>;

    fn name(&self) -> &'static str;
}

/// Build the adapter a portal's configuration asks for
pub fn for_portal(kind: &AdapterKind, http: Arc<HttpFetcher>) -> Arc<dyn ScrapeAdapter> {
    match kind {
        AdapterKind::JsonApi { image_base_url } => {
            Arc::new(JsonApiAdapter::new(http, image_base_url.clone()))
        }
        AdapterKind::ListingWithDetail { content_selector } => {
            Arc::new(ListingWithDetailAdapter::new(http, content_selector.clone()))
        }
        AdapterKind::HtmlSelector => Arc::new(HtmlSelectorAdapter::new(http)),
    }
}

/// Absolute URL of a section page
pub(crate) fn section_url(portal: &PortalConfig, section: &SectionConfig) -> Result<Url, ScrapeError> {
    resolve(&portal_base(portal)?, &section.url)
}

pub(crate) fn portal_base(portal: &PortalConfig) -> Result<Url, ScrapeError> {
    Url::parse(&portal.base_url).map_err(|e| ScrapeError::Url {
        url: portal.base_url.clone(),
        message: e.to_string(),
    })
}

/// Resolve `href` against `base`; absolute links are returned unchanged
pub(crate) fn resolve(base: &Url, href: &str) -> Result<Url, ScrapeError> {
    base.join(href.trim()).map_err(|e| ScrapeError::Url {
        url: href.to_string(),
        message: e.to_string(),
    })
}

pub(crate) fn compile_selector(selector: &str) -> Result<scraper::Selector, ScrapeError> {
    scraper::Selector::parse(selector).map_err(|e| ScrapeError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

/// Collapse runs of whitespace into single spaces
pub(crate) fn clean_text<'a>(fragments: impl IntoIterator<Item = &'a str>) -> String {
    fragments
        .into_iter()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse the timestamp formats portals put in feeds and `<time>` tags
pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    value
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
}

pub(crate) fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_section_url_relative_and_absolute() {
        let portal = fixtures::portal("Reuters", "https://www.reuters.com", AdapterKind::HtmlSelector);

        let relative = section_url(&portal, &fixtures::section("World", "/world")).unwrap();
        assert_eq!(relative.as_str(), "https://www.reuters.com/world");

        let absolute = section_url(
            &portal,
            &fixtures::section("Markets", "https://markets.reuters.com/latest"),
        )
        .unwrap();
        assert_eq!(absolute.as_str(), "https://markets.reuters.com/latest");
    }

    #[test]
    fn test_invalid_base_url() {
        let portal = fixtures::portal("Broken", "not a url", AdapterKind::HtmlSelector);
        let err = section_url(&portal, &fixtures::section("World", "/world")).unwrap_err();
        assert!(matches!(err, ScrapeError::Url { .. }));
    }

    #[test]
    fn test_invalid_selector() {
        assert!(matches!(
            compile_selector("article[").unwrap_err(),
            ScrapeError::Selector { .. }
        ));
    }

    #[test]
    fn test_clean_text_collapses_whitespace() {
        assert_eq!(clean_text(["  Floods\n\t hit ", "", " the coast "]), "Floods hit the coast");
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let rfc = parse_timestamp("2025-03-01T10:15:00+06:00").unwrap();
        assert_eq!(rfc.hour(), 4);

        let naive = parse_timestamp("2025-03-01 10:15:00").unwrap();
        assert_eq!((naive.day(), naive.hour()), (1, 10));

        let millis = parse_timestamp("1740824100000").unwrap();
        assert_eq!(millis.year(), 2025);

        assert!(parse_timestamp("yesterday").is_none());
        assert!(parse_timestamp("  ").is_none());
    }
}
