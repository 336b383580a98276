//! Scrape cycle orchestration
//!
//! A cycle walks every configured (portal, section) pair with bounded
//! parallelism, retries each section under the scrape policy and hands one
//! envelope per non-empty section to the batch publisher. A section failure
//! never aborts the cycle.

use crate::adapters::{self, ScrapeAdapter};
use crate::http::HttpFetcher;
use futures::stream::{self, StreamExt};
use newswire_common::config::{PortalConfig, ScraperConfig, SectionConfig};
use newswire_common::metrics::{self, CycleTimer};
use newswire_common::models::BatchEnvelope;
use newswire_common::transport::{BatchPublisher, PublishOutcome};
use newswire_common::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

/// Summary of one completed cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub sections_ok: usize,
    pub sections_failed: usize,
    /// Sections not started because the cycle deadline had passed
    pub sections_skipped: usize,
    pub articles: usize,
    pub envelopes_published: usize,
    pub envelopes_rejected: usize,
}

enum SectionOutcome {
    Skipped,
    Failed,
    Empty,
    Published { articles: usize },
    Rejected { articles: usize },
}

struct PortalJob {
    portal: PortalConfig,
    adapter: Arc<dyn ScrapeAdapter>,
}

pub struct Orchestrator {
    jobs: Vec<PortalJob>,
    publisher: Arc<BatchPublisher>,
    retry: RetryPolicy,
    max_concurrent_sections: usize,
    deadline: Option<Duration>,
    /// Held for the duration of a cycle
    running: Mutex<()>,
}

impl Orchestrator {
    pub fn new(config: &ScraperConfig, http: Arc<HttpFetcher>, publisher: Arc<BatchPublisher>) -> Self {
        let portals = config
            .portals
            .iter()
            .map(|portal| {
                let adapter = adapters::for_portal(&portal.adapter, http.clone());
                (portal.clone(), adapter)
            })
            .collect();
        Self::with_adapters(config, portals, publisher)
    }

    pub fn with_adapters(
        config: &ScraperConfig,
        portals: Vec<(PortalConfig, Arc<dyn ScrapeAdapter>)>,
        publisher: Arc<BatchPublisher>,
    ) -> Self {
        Self {
            jobs: portals
                .into_iter()
                .map(|(portal, adapter)| PortalJob { portal, adapter })
                .collect(),
            publisher,
            retry: config.retry.clone(),
            max_concurrent_sections: config.max_concurrent_sections.max(1),
            deadline: config.cycle_deadline_secs.map(Duration::from_secs),
            running: Mutex::new(()),
        }
    }

    /// Run one cycle. Returns `None` when a cycle is already in flight.
    pub async fn run_cycle(&self) -> Option<CycleReport> {
        let Ok(_running) = self.running.try_lock() else {
            warn!("Scrape cycle still running, skipping trigger");
            metrics::record_cycle_skipped();
            return None;
        };

        let timer = CycleTimer::start();
        let started = Instant::now();
        info!(portals = self.jobs.len(), "Starting scrape cycle");

        let sections = self
            .jobs
            .iter()
            .flat_map(|job| job.portal.sections.iter().map(move |section| (job, section)));

        let outcomes: Vec<SectionOutcome> = stream::iter(sections)
            .map(|(job, section)| self.run_section(job, section, started))
            .buffer_unordered(self.max_concurrent_sections)
            .collect()
            .await;

        let report = outcomes.into_iter().fold(CycleReport::default(), |mut report, outcome| {
            match outcome {
                SectionOutcome::Skipped => report.sections_skipped += 1,
                SectionOutcome::Failed => report.sections_failed += 1,
                SectionOutcome::Empty => report.sections_ok += 1,
                SectionOutcome::Published { articles } => {
                    report.sections_ok += 1;
                    report.articles += articles;
                    report.envelopes_published += 1;
                }
                SectionOutcome::Rejected { articles } => {
                    report.sections_ok += 1;
                    report.articles += articles;
                    report.envelopes_rejected += 1;
                }
            }
            report
        });

        timer.finish(report.sections_failed);
        info!(
            sections_ok = report.sections_ok,
            sections_failed = report.sections_failed,
            sections_skipped = report.sections_skipped,
            articles = report.articles,
            envelopes = report.envelopes_published,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Finished scrape cycle"
        );
        Some(report)
    }

    #[instrument(skip_all, fields(portal = %job.portal.name, section = %section.name))]
    async fn run_section(&self, job: &PortalJob, section: &SectionConfig, started: Instant) -> SectionOutcome {
        if self.deadline.is_some_and(|deadline| started.elapsed() >= deadline) {
            warn!("Cycle deadline passed, skipping section");
            return SectionOutcome::Skipped;
        }

        let operation = format!("scrape {}/{}", job.portal.name, section.name);
        let articles = match self
            .retry
            .retry(&operation, || job.adapter.fetch_section(&job.portal, section))
            .await
        {
            Ok(articles) => articles,
            Err(e) => {
                error!(adapter = job.adapter.name(), error = %e, "Section scrape failed");
                metrics::record_section(&job.portal.name, false, 0);
                return SectionOutcome::Failed;
            }
        };

        let count = articles.len();
        metrics::record_section(&job.portal.name, true, count);
        if count == 0 {
            info!("Section returned no articles");
            return SectionOutcome::Empty;
        }

        let envelope = BatchEnvelope::new(job.portal.name.clone(), articles);
        match self.publisher.publish(envelope).await {
            Ok(PublishOutcome::Buffered) => {
                info!(articles = count, "Scraped section");
                SectionOutcome::Published { articles: count }
            }
            Ok(PublishOutcome::Rejected { reason }) => {
                warn!(articles = count, %reason, "Section envelope rejected");
                SectionOutcome::Rejected { articles: count }
            }
            Err(e) => {
                error!(articles = count, error = %e, "Section envelope not accepted");
                SectionOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{fixtures, ScrapeError};
    use async_trait::async_trait;
    use newswire_common::config::AdapterKind;
    use newswire_common::models::Article;
    use newswire_common::transport::{inspection_channel, BatchSettings, Connection, MemoryBroker};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CHANNEL: &str = "news_articles";

    /// Serves canned results per section name
    struct StaticAdapter {
        sections: HashMap<String, Vec<Article>>,
        failing: Vec<String>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl StaticAdapter {
        fn new() -> Self {
            Self {
                sections: HashMap::new(),
                failing: Vec::new(),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn with(mut self, section: &str, count: usize) -> Self {
            let articles = (0..count)
                .map(|i| article(&format!("https://news.example/{}/{}", section.to_lowercase(), i), section))
                .collect();
            self.sections.insert(section.to_string(), articles);
            self
        }
    }

    #[async_trait]
    impl ScrapeAdapter for StaticAdapter {
        async fn fetch_section(
            &self,
            _portal: &PortalConfig,
            section: &SectionConfig,
        ) -> Result<Vec<Article>, ScrapeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.failing.contains(&section.name) {
                return Err(ScrapeError::Status {
                    url: section.url.clone(),
                    status: 503,
                });
            }
            Ok(self.sections.get(&section.name).cloned().unwrap_or_default())
        }

        fn name(&self) -> &'static str {
            "static"
        }
    }

    fn article(url: &str, section: &str) -> Article {
        Article {
            title: "Headline".into(),
            content: "Body".into(),
            url: url.into(),
            author: None,
            published_at: chrono::Utc::now(),
            portal: "Reuters".into(),
            section: section.into(),
            image_url: None,
        }
    }

    fn portal(sections: &[&str]) -> PortalConfig {
        let mut portal = fixtures::portal("Reuters", "https://www.reuters.com", AdapterKind::HtmlSelector);
        portal.sections = sections
            .iter()
            .map(|name| fixtures::section(name, &format!("/{}", name.to_lowercase())))
            .collect();
        portal
    }

    fn scraper_config(deadline_secs: Option<u64>, concurrency: usize) -> ScraperConfig {
        ScraperConfig {
            cycle_deadline_secs: deadline_secs,
            max_concurrent_sections: concurrency,
            retry: RetryPolicy::new(3, 10),
            ..ScraperConfig::default()
        }
    }

    async fn publisher(broker: &MemoryBroker) -> Arc<BatchPublisher> {
        let connection = Connection::open(
            Arc::new(broker.clone()),
            RetryPolicy::new(2, 10),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        connection.declare_channel(CHANNEL).await.unwrap();
        BatchPublisher::new(
            Arc::new(connection),
            BatchSettings {
                channel: CHANNEL.into(),
                batch_size: 100,
                batch_timeout: Duration::from_secs(5),
                retry: RetryPolicy::new(2, 10),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_publishes_one_envelope_per_section() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker).await;
        let adapter = Arc::new(StaticAdapter::new().with("World", 3).with("Business", 2));
        let orchestrator = Orchestrator::with_adapters(
            &scraper_config(None, 4),
            vec![(portal(&["World", "Business", "Technology"]), adapter)],
            publisher.clone(),
        );

        let report = orchestrator.run_cycle().await.unwrap();
        assert_eq!(report.sections_ok, 3);
        assert_eq!(report.articles, 5);
        assert_eq!(report.envelopes_published, 2);

        assert_eq!(publisher.flush().await.unwrap(), 2);
        let messages = broker.peek(CHANNEL).await;
        assert_eq!(messages.len(), 1);
        let batch: Vec<BatchEnvelope> = serde_json::from_str(&messages[0].0).unwrap();
        let mut counts: Vec<usize> = batch.iter().map(|e| e.total_articles).collect();
        counts.sort();
        assert_eq!(counts, vec![2, 3]);
        assert!(batch.iter().all(|e| e.portal_name == "Reuters"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_section_is_retried_and_isolated() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker).await;
        let mut adapter = StaticAdapter::new().with("World", 2);
        adapter.failing.push("Business".into());
        let adapter = Arc::new(adapter);
        let orchestrator = Orchestrator::with_adapters(
            &scraper_config(None, 1),
            vec![(portal(&["Business", "World"]), adapter.clone())],
            publisher,
        );

        let report = orchestrator.run_cycle().await.unwrap();
        assert_eq!(report.sections_failed, 1);
        assert_eq!(report.sections_ok, 1);
        assert_eq!(report.envelopes_published, 1);
        // Three attempts for Business, one for World
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_trigger_is_skipped() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker).await;
        let mut adapter = StaticAdapter::new().with("World", 1);
        adapter.delay = Duration::from_secs(10);
        let orchestrator = Orchestrator::with_adapters(
            &scraper_config(None, 4),
            vec![(portal(&["World"]), Arc::new(adapter))],
            publisher,
        );

        let (first, second) = tokio::join!(orchestrator.run_cycle(), orchestrator.run_cycle());
        assert!(first.is_some());
        assert!(second.is_none());

        // Idle again once the first cycle is done
        assert!(orchestrator.run_cycle().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_skips_remaining_sections() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker).await;
        let mut adapter = StaticAdapter::new().with("World", 1).with("Business", 1);
        adapter.delay = Duration::from_secs(2);
        let orchestrator = Orchestrator::with_adapters(
            &scraper_config(Some(1), 1),
            vec![(portal(&["World", "Business"]), Arc::new(adapter))],
            publisher,
        );

        let report = orchestrator.run_cycle().await.unwrap();
        assert_eq!(report.sections_ok, 1);
        assert_eq!(report.sections_skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_envelope_is_diverted() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker).await;
        let mut adapter = StaticAdapter::new();
        adapter
            .sections
            .insert("World".into(), vec![article("not a url", "World")]);
        let orchestrator = Orchestrator::with_adapters(
            &scraper_config(None, 1),
            vec![(portal(&["World"]), Arc::new(adapter))],
            publisher.clone(),
        );

        let report = orchestrator.run_cycle().await.unwrap();
        assert_eq!(report.envelopes_rejected, 1);
        assert_eq!(report.envelopes_published, 0);
        assert_eq!(publisher.buffered().await, 0);
        assert_eq!(broker.depth(&inspection_channel(CHANNEL)).await, 1);
    }
}
