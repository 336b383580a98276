//! Shared outbound HTTP client
//!
//! Every adapter request goes through one `reqwest` client and one
//! token-bucket limiter, so the configured request rate holds across all
//! portals and sections scraped concurrently.

use crate::adapters::ScrapeError;
use governor::{
    clock::QuantaClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use newswire_common::config::HttpConfig;
use serde::de::DeserializeOwned;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub type OutboundRateLimiter = RateLimiter<NotKeyed, InMemoryState, QuantaClock>;

/// Create a limiter allowing `requests_per_second` with an equal burst
pub fn create_rate_limiter(requests_per_second: u32) -> Arc<OutboundRateLimiter> {
    let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
    Arc::new(RateLimiter::direct(Quota::per_second(rate).allow_burst(rate)))
}

pub struct HttpFetcher {
    client: reqwest::Client,
    limiter: Arc<OutboundRateLimiter>,
}

impl HttpFetcher {
    pub fn new(config: &HttpConfig, requests_per_second: u32) -> Result<Self, ScrapeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|source| ScrapeError::Http {
                url: String::new(),
                source,
            })?;

        Ok(Self {
            client,
            limiter: create_rate_limiter(requests_per_second),
        })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, ScrapeError> {
        self.limiter.until_ready().await;
        debug!(%url, "GET");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| ScrapeError::Http {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ScrapeError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    /// Fetch a page body as text
    pub async fn get_text(&self, url: &str) -> Result<String, ScrapeError> {
        self.get(url)
            .await?
            .text()
            .await
            .map_err(|source| ScrapeError::Http {
                url: url.to_string(),
                source,
            })
    }

    /// Fetch and decode a JSON document
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, ScrapeError> {
        let body = self.get_text(url).await?;
        serde_json::from_str(&body).map_err(|e| ScrapeError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[test]
    fn test_rate_limiter_allows_burst() {
        let limiter = create_rate_limiter(3);
        for _ in 0..3 {
            assert!(limiter.check().is_ok());
        }
        assert!(limiter.check().is_err());
    }

    #[test]
    fn test_zero_rate_falls_back_to_one() {
        let limiter = create_rate_limiter(0);
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());
    }

    #[test]
    fn test_fetcher_builds_from_config() {
        let config = HttpConfig {
            timeout_secs: 5,
            user_agent: "newswire-test".to_string(),
        };
        assert_ok!(HttpFetcher::new(&config, 5));
    }
}
