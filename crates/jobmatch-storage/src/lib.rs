//! Persistence + HTTP plumbing for the job-match pipeline: page archive, retry/backoff,
//! polite page transport, run store, dedup index and the per-profile run lock.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod dedup;
mod lock;
mod run_store;

pub use dedup::DedupStore;
pub use lock::{LockError, RunLock};
pub use run_store::{RunDocument, RunStore, StoreError};

pub const CRATE_NAME: &str = "jobmatch-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Outcome of writing a file through [`write_atomic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    AlreadyPresent,
}

/// Write `bytes` to `path` via a sibling temp file and a rename, so readers only ever see
/// complete files. With `overwrite == false` an existing target is left untouched.
pub async fn write_atomic(path: &Path, bytes: &[u8], overwrite: bool) -> std::io::Result<WriteOutcome> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await?;

    if !overwrite && fs::try_exists(path).await? {
        return Ok(WriteOutcome::AlreadyPresent);
    }

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }

    if !overwrite && fs::try_exists(path).await? {
        let _ = fs::remove_file(&temp_path).await;
        return Ok(WriteOutcome::AlreadyPresent);
    }

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(WriteOutcome::Written),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err)
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable, hash-addressed archive of raw fetched pages.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn page_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(source_id)
            .join(format!("{content_hash}.{ext}"))
    }

    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredPage> {
        let content_hash = sha256_hex(bytes);
        let relative_path = self.page_relative_path(fetched_at, source_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let outcome = write_atomic(&absolute_path, bytes, false)
            .await
            .with_context(|| format!("archiving page {}", absolute_path.display()))?;

        Ok(StoredPage {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: outcome == WriteOutcome::AlreadyPresent,
        })
    }
}

/// Typed result of a single attempt inside a bounded retry loop.
#[derive(Debug)]
pub enum AttemptOutcome<T, E> {
    Success(T),
    Retryable(E),
    Terminal(E),
}

#[derive(Debug, Error)]
pub enum RetryError<E: Display> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: E },
    #[error("terminal failure on attempt {attempts}: {error}")]
    Terminal { attempts: usize, error: E },
}

impl<E: Display> RetryError<E> {
    pub fn attempts(&self) -> usize {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Terminal { attempts, .. } => *attempts,
        }
    }

    pub fn error(&self) -> &E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Terminal { error, .. } => error,
        }
    }

    pub fn into_error(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Terminal { error, .. } => error,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the computed delay added or removed at random (0.0 disables jitter).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn jittered_delay(&self, attempt_index: usize) -> Duration {
        let delay = self.delay_for_attempt(attempt_index);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        delay.mul_f64(factor).min(self.max_delay)
    }
}

/// Bounded-attempt loop: retries `Retryable` outcomes up to `policy.max_retries` times with
/// exponential backoff, stops immediately on `Terminal`.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: &BackoffPolicy, mut attempt_fn: F) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = AttemptOutcome<T, E>>,
{
    let mut attempt = 0usize;
    loop {
        match attempt_fn(attempt).await {
            AttemptOutcome::Success(value) => return Ok(value),
            AttemptOutcome::Terminal(error) => {
                return Err(RetryError::Terminal {
                    attempts: attempt + 1,
                    error,
                })
            }
            AttemptOutcome::Retryable(error) => {
                if attempt >= policy.max_retries {
                    return Err(RetryError::Exhausted {
                        attempts: attempt + 1,
                        last: error,
                    });
                }
                let delay = policy.jittered_delay(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, %error, "retrying after backoff");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("rate limited by remote host for {url}")]
    RateLimited { url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl FetchError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, FetchError::RateLimited { .. })
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// One network attempt against a page URL. Retry policy lives with the caller.
#[async_trait]
pub trait PageTransport: Send + Sync {
    async fn fetch_once(&self, url: &str) -> AttemptOutcome<FetchedResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }
}

#[async_trait]
impl PageTransport for HttpFetcher {
    async fn fetch_once(&self, url: &str) -> AttemptOutcome<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", url);
        async {
            let resp = match self.client.get(url).send().await {
                Ok(resp) => resp,
                Err(err) if err.is_timeout() => {
                    return AttemptOutcome::Retryable(FetchError::Timeout { url: url.to_string() })
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    let error = FetchError::Request {
                        url: url.to_string(),
                        source: err,
                    };
                    return match disposition {
                        RetryDisposition::Retryable => AttemptOutcome::Retryable(error),
                        RetryDisposition::NonRetryable => AttemptOutcome::Terminal(error),
                    };
                }
            };

            let status = resp.status();
            let final_url = resp.url().to_string();
            if status == StatusCode::TOO_MANY_REQUESTS {
                return AttemptOutcome::Retryable(FetchError::RateLimited { url: final_url });
            }
            if !status.is_success() {
                let error = FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                };
                return match classify_status(status) {
                    RetryDisposition::Retryable => AttemptOutcome::Retryable(error),
                    RetryDisposition::NonRetryable => AttemptOutcome::Terminal(error),
                };
            }

            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);
            match resp.bytes().await {
                Ok(body) => AttemptOutcome::Success(FetchedResponse {
                    status: status.as_u16(),
                    final_url,
                    content_type,
                    body: body.to_vec(),
                }),
                Err(err) if err.is_timeout() => AttemptOutcome::Retryable(FetchError::Timeout { url: final_url }),
                Err(err) => AttemptOutcome::Retryable(FetchError::Request {
                    url: final_url,
                    source: err,
                }),
            }
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PolitenessConfig {
    /// Minimum spacing between two requests to the same host.
    pub min_interval: Duration,
    /// Upper bound of the random extra delay added to each spacing.
    pub jitter: Duration,
    pub per_host_concurrency: usize,
}

impl Default for PolitenessConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(1500),
            jitter: Duration::from_millis(750),
            per_host_concurrency: 1,
        }
    }
}

#[derive(Debug)]
struct HostSlot {
    permits: Arc<Semaphore>,
    next_start: Mutex<Option<Instant>>,
}

/// Per-host request spacing. Each caller reserves the next start time for its host, so
/// the spacing holds however many workers share the throttle.
#[derive(Debug)]
pub struct HostThrottle {
    config: PolitenessConfig,
    hosts: Mutex<HashMap<String, Arc<HostSlot>>>,
}

#[derive(Debug)]
pub struct HostPermit {
    _permit: OwnedSemaphorePermit,
}

impl HostThrottle {
    pub fn new(config: PolitenessConfig) -> Self {
        Self {
            config,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    async fn slot(&self, host: &str) -> Arc<HostSlot> {
        let mut map = self.hosts.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| {
                Arc::new(HostSlot {
                    permits: Arc::new(Semaphore::new(self.config.per_host_concurrency.max(1))),
                    next_start: Mutex::new(None),
                })
            })
            .clone()
    }

    fn spacing(&self) -> Duration {
        let jitter_ms = self.config.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.config.min_interval;
        }
        self.config.min_interval + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    pub async fn acquire(&self, host: &str) -> HostPermit {
        let slot = self.slot(host).await;
        let permit = slot
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore not closed");

        let start_at = {
            let mut next = slot.next_start.lock().await;
            let now = Instant::now();
            let start_at = match *next {
                Some(reserved) if reserved > now => reserved,
                _ => now,
            };
            *next = Some(start_at + self.spacing());
            start_at
        };
        if start_at > Instant::now() {
            debug!(host, wait_ms = (start_at - Instant::now()).as_millis() as u64, "politeness delay");
        }
        tokio::time::sleep_until(start_at).await;

        HostPermit { _permit: permit }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[test]
    fn page_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn archived_pages_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let archive = PageArchive::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive
            .store_page(fetched_at, "linkedin-guest", "html", b"<ul><li>same</li></ul>")
            .await
            .expect("first store");
        let second = archive
            .store_page(fetched_at, "linkedin-guest", "html", b"<ul><li>same</li></ul>")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
        assert!(first.relative_path.starts_with("20260224"));
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested/record.json");
        assert_eq!(write_atomic(&path, b"{}", false).await.unwrap(), WriteOutcome::Written);
        assert_eq!(write_atomic(&path, b"[]", false).await.unwrap(), WriteOutcome::AlreadyPresent);
        assert_eq!(std::fs::read(&path).unwrap(), b"{}");
        assert_eq!(write_atomic(&path, b"[]", true).await.unwrap(), WriteOutcome::Written);
        assert_eq!(std::fs::read(&path).unwrap(), b"[]");

        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.jittered_delay(5), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
            jitter: 0.25,
        };
        for _ in 0..100 {
            let d = policy.jittered_delay(0);
            assert!(d >= Duration::from_millis(750) && d <= Duration::from_millis(1250), "{d:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_loop_recovers_after_transient_failures() {
        let policy = BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            jitter: 0.0,
        };
        let calls = AtomicUsize::new(0);
        let result: Result<&str, RetryError<String>> = retry_with_backoff(&policy, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    AttemptOutcome::Retryable(format!("flaky {attempt}"))
                } else {
                    AttemptOutcome::Success("ok")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_loop_is_bounded_and_stops_on_terminal() {
        let policy = BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            jitter: 0.0,
        };
        let exhausted: Result<(), RetryError<String>> =
            retry_with_backoff(&policy, |_| async { AttemptOutcome::Retryable("503".to_string()) }).await;
        let err = exhausted.unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { attempts: 3, .. }));

        let terminal: Result<(), RetryError<String>> =
            retry_with_backoff(&policy, |_| async { AttemptOutcome::Terminal("401".to_string()) }).await;
        let err = terminal.unwrap_err();
        assert!(matches!(err, RetryError::Terminal { attempts: 1, .. }));
        assert_eq!(err.into_error(), "401");
    }

    #[test]
    fn status_classification_retries_server_and_rate_limit_errors() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_spaces_requests_to_the_same_host() {
        let throttle = Arc::new(HostThrottle::new(PolitenessConfig {
            min_interval: Duration::from_millis(500),
            jitter: Duration::ZERO,
            per_host_concurrency: 4,
        }));

        let origin = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let throttle = throttle.clone();
            handles.push(tokio::spawn(async move {
                let _permit = throttle.acquire("se.linkedin.com").await;
                Instant::now()
            }));
        }
        let mut starts = Vec::new();
        for handle in handles {
            starts.push(handle.await.unwrap() - origin);
        }
        starts.sort();
        assert_eq!(starts[0], Duration::ZERO);
        assert!(starts[1] >= Duration::from_millis(500));
        assert!(starts[2] >= Duration::from_millis(1000));

        let other_host = Instant::now();
        let _permit = throttle.acquire("jobsearch.api.jobtechdev.se").await;
        assert_eq!(Instant::now() - other_host, Duration::ZERO);
    }
}
