use std::sync::Arc;

use chrono::Utc;
use jobmatch_core::{ErrorKind, Posting, SearchTarget};
use jobmatch_storage::{
    retry_with_backoff, BackoffPolicy, FetchError, FetchedResponse, HostThrottle, PageArchive, PageTransport,
    PolitenessConfig, RetryError,
};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use crate::{PostingSource, RawPage, SourceRegistry};

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub max_pages: usize,
    pub backoff: BackoffPolicy,
    /// Targets fetched concurrently. Requests to one host stay serialized by the throttle.
    pub max_parallel_targets: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_pages: 3,
            backoff: BackoffPolicy::default(),
            max_parallel_targets: 4,
        }
    }
}

#[derive(Clone)]
pub struct FetchJob {
    pub source: Arc<dyn PostingSource>,
    pub target: SearchTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageFailure {
    pub source_id: String,
    pub target: SearchTarget,
    pub page_index: usize,
    pub url: String,
    pub kind: ErrorKind,
    pub attempts: usize,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum PageOutcome {
    Fetched(RawPage),
    Failed(PageFailure),
}

/// Page outcomes ordered by job, then page index. Failed pages stay in place as gaps.
#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    pub pages: Vec<PageOutcome>,
}

impl FetchReport {
    pub fn fetched(&self) -> impl Iterator<Item = &RawPage> {
        self.pages.iter().filter_map(|p| match p {
            PageOutcome::Fetched(page) => Some(page),
            PageOutcome::Failed(_) => None,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = &PageFailure> {
        self.pages.iter().filter_map(|p| match p {
            PageOutcome::Failed(failure) => Some(failure),
            PageOutcome::Fetched(_) => None,
        })
    }
}

/// A posting whose detail page could not be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetailFailure {
    pub source_id: String,
    pub posting_url: String,
    pub url: String,
    pub kind: ErrorKind,
    pub attempts: usize,
    pub message: String,
}

/// Postings in input order. A posting whose detail fetch failed keeps its listing description.
#[derive(Debug, Clone, Default)]
pub struct DetailReport {
    pub postings: Vec<Posting>,
    pub failures: Vec<DetailFailure>,
}

fn failure_kind(err: &RetryError<FetchError>) -> ErrorKind {
    if err.error().is_rate_limit() {
        ErrorKind::RateLimit
    } else {
        ErrorKind::Network
    }
}

#[derive(Clone)]
pub struct PostingFetcher {
    transport: Arc<dyn PageTransport>,
    throttle: Arc<HostThrottle>,
    archive: Option<PageArchive>,
    config: FetcherConfig,
}

impl PostingFetcher {
    pub fn new(transport: Arc<dyn PageTransport>, politeness: PolitenessConfig, config: FetcherConfig) -> Self {
        Self {
            transport,
            throttle: Arc::new(HostThrottle::new(politeness)),
            archive: None,
            config,
        }
    }

    pub fn with_archive(mut self, archive: PageArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub async fn fetch_all(&self, jobs: Vec<FetchJob>) -> FetchReport {
        let limiter = Arc::new(Semaphore::new(self.config.max_parallel_targets.max(1)));
        let mut set = JoinSet::new();
        for (index, job) in jobs.into_iter().enumerate() {
            let fetcher = self.clone();
            let limiter = limiter.clone();
            set.spawn(async move {
                let _slot = limiter.acquire_owned().await.ok();
                (index, fetcher.fetch_target(job).await)
            });
        }

        let mut collected = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(entry) => collected.push(entry),
                Err(err) => warn!(error = %err, "fetch task aborted"),
            }
        }
        collected.sort_by_key(|(index, _)| *index);

        let report = FetchReport {
            pages: collected.into_iter().flat_map(|(_, pages)| pages).collect(),
        };
        info!(
            pages_fetched = report.fetched().count(),
            pages_failed = report.failures().count(),
            "fetch finished"
        );
        report
    }

    /// Pages for one target, in order, until an empty page or the page cap.
    async fn fetch_target(&self, job: FetchJob) -> Vec<PageOutcome> {
        let source_id = job.source.source_id();
        let mut pages = Vec::new();

        for page_index in 0..self.config.max_pages {
            let url = job.source.page_url(&job.target, page_index);
            match self.fetch_page(&url).await {
                Ok(response) => {
                    let mut page = RawPage {
                        source_id: source_id.to_string(),
                        target: job.target.clone(),
                        page_index,
                        url: url.clone(),
                        content_type: response.content_type,
                        body: response.body,
                        fetched_at: Utc::now(),
                        archived_as: None,
                    };
                    if let Some(archive) = &self.archive {
                        let ext = job.source.payload_kind().extension();
                        match archive.store_page(page.fetched_at, source_id, ext, &page.body).await {
                            Ok(stored) => page.archived_as = Some(stored.relative_path),
                            Err(err) => warn!(url = %url, error = %err, "page archive write failed"),
                        }
                    }
                    if job.source.is_exhausted(&page) {
                        debug!(source = source_id, target = %job.target, page_index, "empty page, pagination stops");
                        break;
                    }
                    pages.push(PageOutcome::Fetched(page));
                }
                Err(err) => {
                    let kind = failure_kind(&err);
                    warn!(
                        source = source_id,
                        url = %url,
                        attempts = err.attempts(),
                        error = %err,
                        "page failed, continuing with the next page"
                    );
                    pages.push(PageOutcome::Failed(PageFailure {
                        source_id: source_id.to_string(),
                        target: job.target.clone(),
                        page_index,
                        url,
                        kind,
                        attempts: err.attempts(),
                        message: err.to_string(),
                    }));
                }
            }
        }
        pages
    }

    /// Replaces each posting's description with the one on its detail page, for sources
    /// that have detail pages. Requests go through the same throttle as result pages.
    pub async fn fetch_details(&self, registry: &SourceRegistry, postings: Vec<Posting>) -> DetailReport {
        let limiter = Arc::new(Semaphore::new(self.config.max_parallel_targets.max(1)));
        let mut set = JoinSet::new();
        for (index, posting) in postings.iter().enumerate() {
            let Some(source) = registry.get(&posting.source_id) else {
                continue;
            };
            let Some(url) = source.detail_url(posting) else {
                continue;
            };
            let fetcher = self.clone();
            let limiter = limiter.clone();
            let posting_url = posting.source_url.clone();
            set.spawn(async move {
                let _slot = limiter.acquire_owned().await.ok();
                (index, fetcher.fetch_detail(source, posting_url, url).await)
            });
        }

        let mut report = DetailReport {
            postings,
            failures: Vec::new(),
        };
        let mut failures = Vec::new();
        let mut enriched = 0usize;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, Ok(Some(description)))) => {
                    report.postings[index].description_text = description;
                    enriched += 1;
                }
                Ok((_, Ok(None))) => {}
                Ok((index, Err(failure))) => failures.push((index, failure)),
                Err(err) => warn!(error = %err, "detail task aborted"),
            }
        }
        failures.sort_by_key(|(index, _)| *index);
        report.failures = failures.into_iter().map(|(_, failure)| failure).collect();
        if enriched > 0 || !report.failures.is_empty() {
            info!(enriched, failed = report.failures.len(), "detail pages fetched");
        }
        report
    }

    async fn fetch_detail(
        &self,
        source: Arc<dyn PostingSource>,
        posting_url: String,
        url: String,
    ) -> Result<Option<String>, DetailFailure> {
        let source_id = source.source_id();
        match self.fetch_page(&url).await {
            Ok(response) => {
                if let Some(archive) = &self.archive {
                    let ext = source.payload_kind().extension();
                    if let Err(err) = archive.store_page(Utc::now(), source_id, ext, &response.body).await {
                        warn!(url = %url, error = %err, "detail archive write failed");
                    }
                }
                let description = source.parse_detail(&String::from_utf8_lossy(&response.body));
                if description.is_none() {
                    debug!(url = %url, "detail page has no description");
                }
                Ok(description)
            }
            Err(err) => {
                warn!(
                    source = source_id,
                    url = %url,
                    attempts = err.attempts(),
                    error = %err,
                    "detail page failed, keeping the listing description"
                );
                Err(DetailFailure {
                    source_id: source_id.to_string(),
                    posting_url,
                    kind: failure_kind(&err),
                    attempts: err.attempts(),
                    message: err.to_string(),
                    url,
                })
            }
        }
    }

    async fn fetch_page(&self, url: &str) -> Result<FetchedResponse, RetryError<FetchError>> {
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        let host = host.as_str();
        retry_with_backoff(&self.config.backoff, |attempt| async move {
            let _permit = self.throttle.acquire(host).await;
            debug!(url, attempt, "fetching page");
            self.transport.fetch_once(url).await
        })
        .await
    }
}
