//! Static HTML adapter driven by per-section CSS selectors

use super::{
    clean_text, compile_selector, parse_timestamp, portal_base, resolve, section_url,
    ScrapeAdapter, ScrapeError,
};
use crate::http::HttpFetcher;
use async_trait::async_trait;
use chrono::Utc;
use newswire_common::config::{PortalConfig, SectionConfig, SelectorConfig};
use newswire_common::models::Article;
use scraper::{ElementRef, Html, Selector};
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use url::Url;

const DEFAULT_LINK_SELECTOR: &str = "a[href]";

struct CompiledSelectors {
    article: Selector,
    title: Selector,
    content: Selector,
    link: Selector,
    author: Option<Selector>,
    published_at: Option<Selector>,
    image: Option<Selector>,
}

impl CompiledSelectors {
    fn compile(config: &SelectorConfig) -> Result<Self, ScrapeError> {
        let optional = |selector: &Option<String>| selector.as_deref().map(compile_selector).transpose();
        Ok(Self {
            article: compile_selector(&config.article)?,
            title: compile_selector(&config.title)?,
            content: compile_selector(&config.content)?,
            link: compile_selector(config.link.as_deref().unwrap_or(DEFAULT_LINK_SELECTOR))?,
            author: optional(&config.author)?,
            published_at: optional(&config.published_at)?,
            image: optional(&config.image)?,
        })
    }
}

pub struct HtmlSelectorAdapter {
    http: Arc<HttpFetcher>,
}

impl HtmlSelectorAdapter {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ScrapeAdapter for HtmlSelectorAdapter {
    #[instrument(skip_all, fields(portal = %portal.name, section = %section.name))]
    async fn fetch_section(
        &self,
        portal: &PortalConfig,
        section: &SectionConfig,
    ) -> Result<Vec<Article>, ScrapeError> {
        let selectors = section
            .selectors
            .as_ref()
            .ok_or_else(|| ScrapeError::MissingSelectors {
                section: section.name.clone(),
            })?;
        let url = section_url(portal, section)?;
        let html = self.http.get_text(url.as_str()).await?;
        parse_page(&html, &portal_base(portal)?, portal, &section.name, selectors)
    }

    fn name(&self) -> &'static str {
        "html_selector"
    }
}

pub(crate) fn parse_page(
    html: &str,
    base: &Url,
    portal: &PortalConfig,
    section: &str,
    config: &SelectorConfig,
) -> Result<Vec<Article>, ScrapeError> {
    let selectors = CompiledSelectors::compile(config)?;
    let document = Html::parse_document(html);

    let mut articles = Vec::new();
    let mut skipped = 0;
    for element in document.select(&selectors.article) {
        match parse_item(element, &selectors, base, portal, section) {
            Some(article) => articles.push(article),
            None => skipped += 1,
        }
    }

    if skipped > 0 {
        warn!(portal = %portal.name, section, skipped, "Skipped unparseable items");
    }
    debug!(portal = %portal.name, section, count = articles.len(), "Parsed section page");
    Ok(articles)
}

fn parse_item(
    element: ElementRef<'_>,
    selectors: &CompiledSelectors,
    base: &Url,
    portal: &PortalConfig,
    section: &str,
) -> Option<Article> {
    let title = first_text(element, &selectors.title).filter(|t| !t.is_empty())?;

    // The article container is often the anchor itself
    let href = element
        .select(&selectors.link)
        .find_map(|link| link.value().attr("href"))
        .or_else(|| element.value().attr("href"))?;
    let url = match resolve(base, href) {
        Ok(url) => url.to_string(),
        Err(e) => {
            debug!(%title, error = %e, "Unresolvable link");
            return None;
        }
    };

    let content = clean_text(element.select(&selectors.content).flat_map(|c| c.text()));
    if content.is_empty() {
        debug!(%url, "Item has no content");
        return None;
    }

    let published_at = selectors
        .published_at
        .as_ref()
        .and_then(|selector| element.select(selector).next())
        .and_then(|time| {
            time.value()
                .attr("datetime")
                .and_then(parse_timestamp)
                .or_else(|| parse_timestamp(&clean_text(time.text())))
        })
        .unwrap_or_else(Utc::now);

    let image_url = selectors
        .image
        .as_ref()
        .and_then(|selector| element.select(selector).next())
        .and_then(|img| img.value().attr("src").or_else(|| img.value().attr("data-src")))
        .and_then(|src| resolve(base, src).ok())
        .map(String::from);

    Some(Article {
        title,
        content,
        url,
        author: selectors
            .author
            .as_ref()
            .and_then(|selector| first_text(element, selector))
            .filter(|a| !a.is_empty()),
        published_at,
        portal: portal.name.clone(),
        section: section.to_string(),
        image_url,
    })
}

fn first_text(element: ElementRef<'_>, selector: &Selector) -> Option<String> {
    element.select(selector).next().map(|e| clean_text(e.text()))
}
