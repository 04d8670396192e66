use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use jobmatch_adapters::{extract_pages, FetchJob, FetcherConfig, PostingFetcher, SourceRegistry};
use jobmatch_core::{
    CandidateProfile, CategoryBands, ErrorEntry, ErrorKind, IdentityRule, MatchResult, Posting, RunRecord, RunStatus,
    SearchTarget, Stage,
};
use jobmatch_scoring::{
    load_embedder, CalibrationWeights, EmbeddingScorer, ExternalEvaluator, OpenAiCompatibleClient,
    OpenAiCompatibleConfig, ProfileExtractor, ScoreCalibrator, SimilarityNormalization,
};
use jobmatch_storage::{
    sha256_hex, BackoffPolicy, DedupStore, HttpClientConfig, HttpFetcher, PageArchive, PolitenessConfig, RunLock,
    RunStore,
};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::breaker::{Admission, CircuitBreaker};
use crate::config::SyncConfig;
use crate::export::export_run_snapshot;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub runs_dir: PathBuf,
    pub locks_dir: PathBuf,
    pub identity: IdentityRule,
    pub weights: CalibrationWeights,
    pub bands: CategoryBands,
    pub similarity: SimilarityNormalization,
    pub embed_model_path: Option<PathBuf>,
    /// Evaluator failures tolerated per run; the next one opens the breaker.
    pub breaker_threshold: usize,
    pub breaker_cooldown: Option<Duration>,
    /// Postings evaluated concurrently.
    pub workers: usize,
    /// Consecutive result-write failures tolerated before the run fails.
    pub persist_failure_limit: usize,
    pub lock_stale_after: Duration,
    pub export_snapshot: bool,
}

impl PipelineSettings {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            runs_dir: data_dir.join("runs"),
            locks_dir: data_dir.join("locks"),
            identity: IdentityRule::default(),
            weights: CalibrationWeights::default(),
            bands: CategoryBands::default(),
            similarity: SimilarityNormalization::default(),
            embed_model_path: None,
            breaker_threshold: 5,
            breaker_cooldown: None,
            workers: 4,
            persist_failure_limit: 3,
            lock_stale_after: Duration::from_secs(6 * 3600),
            export_snapshot: true,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            runs_dir: config.runs_dir(),
            locks_dir: config.locks_dir(),
            identity: config.identity.clone(),
            weights: config.weights,
            bands: config.bands,
            similarity: config.similarity,
            embed_model_path: config.embed_model_path.clone(),
            breaker_threshold: config.breaker_threshold,
            breaker_cooldown: config.breaker_cooldown,
            workers: config.workers,
            persist_failure_limit: config.persist_failure_limit,
            lock_stale_after: config.lock_stale_after,
            export_snapshot: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub resume_path: PathBuf,
    pub searches: Vec<SearchTarget>,
    /// Per-run calibration override.
    pub weights: Option<CalibrationWeights>,
    /// Re-score postings already scored for the current profile.
    pub force_rescore: bool,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub record: RunRecord,
    pub document_path: PathBuf,
    pub snapshot_manifest: Option<PathBuf>,
}

/// Lock key for a run store. Every profile scored into a store shares its dedup index, so
/// the store admits one active run regardless of where the resume file lives.
pub async fn run_lock_key(runs_dir: &Path) -> std::io::Result<String> {
    tokio::fs::create_dir_all(runs_dir).await?;
    let canonical = tokio::fs::canonicalize(runs_dir).await?;
    let digest = sha256_hex(canonical.to_string_lossy().as_bytes());
    Ok(format!("runs-{}", &digest[..16]))
}

struct ScoredPosting {
    result: MatchResult,
    errors: Vec<ErrorEntry>,
    fell_back: bool,
}

/// One posting's evaluate-then-calibrate unit. Evaluator failures are folded into the
/// returned value; the unit itself never fails.
async fn score_posting(
    evaluator: Option<Arc<ExternalEvaluator>>,
    breaker: Arc<Mutex<CircuitBreaker>>,
    calibrator: ScoreCalibrator,
    profile: Arc<CandidateProfile>,
    posting: Posting,
    embed_score: f64,
) -> ScoredPosting {
    let mut errors = Vec::new();
    let mut fell_back = false;

    let llm = match evaluator {
        None => None,
        Some(evaluator) => {
            let admission = breaker.lock().await.admit();
            if admission == Admission::Rejected {
                fell_back = true;
                None
            } else {
                match evaluator.evaluate(&profile, &posting).await {
                    Ok(assessment) => {
                        breaker.lock().await.record_success();
                        Some(assessment)
                    }
                    Err(err) => {
                        fell_back = true;
                        warn!(url = %posting.source_url, error = %err, "evaluator failed; scoring embedding-only");
                        errors.push(
                            ErrorEntry::new(err.kind(), Stage::Score, err.to_string())
                                .with_subject(posting.source_url.clone()),
                        );
                        let mut breaker = breaker.lock().await;
                        if breaker.record_failure() {
                            errors.push(
                                ErrorEntry::new(
                                    err.kind(),
                                    Stage::Score,
                                    format!(
                                        "evaluator disabled after {} failures; remaining postings score embedding-only",
                                        breaker.failures()
                                    ),
                                )
                                .with_subject(posting.source_url.clone()),
                            );
                        }
                        None
                    }
                }
            }
        }
    };

    let result = calibrator.score(posting, &profile.profile_fingerprint, embed_score, llm, Utc::now());
    ScoredPosting {
        result,
        errors,
        fell_back,
    }
}

/// Run orchestrator: `INIT -> PROFILE -> FETCH -> EXTRACT -> DEDUP -> SCORE -> CALIBRATE ->
/// PERSIST -> DONE`, with any fatal error ending the run as `failed`.
pub struct Pipeline {
    settings: PipelineSettings,
    sources: SourceRegistry,
    fetcher: PostingFetcher,
    evaluator: Option<Arc<ExternalEvaluator>>,
    profiles: ProfileExtractor,
    run_store: RunStore,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        sources: SourceRegistry,
        fetcher: PostingFetcher,
        evaluator: Option<Arc<ExternalEvaluator>>,
    ) -> Self {
        let run_store = RunStore::new(settings.runs_dir.clone());
        Self {
            settings,
            sources,
            fetcher,
            evaluator,
            profiles: ProfileExtractor::default(),
            run_store,
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let politeness = PolitenessConfig {
            min_interval: config.request_delay,
            jitter: config.request_jitter,
            per_host_concurrency: config.per_host_concurrency,
        };
        let fetcher = PostingFetcher::new(
            Arc::new(http),
            politeness,
            FetcherConfig {
                max_pages: config.max_pages,
                backoff: BackoffPolicy {
                    max_retries: config.fetch_max_retries,
                    ..Default::default()
                },
                max_parallel_targets: config.workers,
            },
        )
        .with_archive(PageArchive::new(config.artifacts_dir()));

        let evaluator = match &config.llm {
            Some(llm) => {
                let client = OpenAiCompatibleClient::new(OpenAiCompatibleConfig {
                    endpoint: llm.endpoint.clone(),
                    api_key: llm.api_key.clone(),
                    model: llm.model.clone(),
                    request_timeout: llm.timeout,
                })?;
                Some(Arc::new(ExternalEvaluator::new(Arc::new(client), llm.evaluator_config())))
            }
            None => {
                info!("no reasoning-service credential configured; runs score embedding-only");
                None
            }
        };

        Ok(Self::new(
            PipelineSettings::from_config(config),
            SourceRegistry::with_defaults(),
            fetcher,
            evaluator,
        ))
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn run_store(&self) -> &RunStore {
        &self.run_store
    }

    /// Executes one run end to end. Errors only when the run could not be registered,
    /// locked or finalized; everything else is reported through the returned record.
    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id);
        async {
            let lock_key = run_lock_key(&self.settings.runs_dir)
                .await
                .context("resolving run lock key")?;
            let lock = RunLock::acquire(&self.settings.locks_dir, &lock_key, run_id, self.settings.lock_stale_after)
                .await
                .context("acquiring run lock")?;
            let outcome = self.drive(run_id, &request).await;
            if let Err(err) = lock.release().await {
                warn!(error = %err, "releasing run lock failed");
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, run_id: Uuid, request: &RunRequest) -> Result<RunOutcome> {
        let mut record = RunRecord::pending(run_id, request.searches.clone());
        self.run_store.begin_run(&record).await.context("registering run")?;
        record.transition(RunStatus::Running)?;
        self.run_store.save_run_record(&record).await.context("saving run record")?;
        info!(searches = record.searches.len(), force = request.force_rescore, "run started");

        let mut snapshot_manifest = None;
        match self.execute(request, &mut record).await {
            Ok(()) => {
                if self.settings.export_snapshot {
                    match self.export_snapshot(run_id).await {
                        Ok(path) => snapshot_manifest = Some(path),
                        Err(err) => {
                            warn!(error = %format!("{err:#}"), "snapshot export failed");
                            record.record_error(ErrorEntry::new(
                                ErrorKind::Persistence,
                                Stage::Persist,
                                format!("snapshot export failed: {err:#}"),
                            ));
                        }
                    }
                }
                info!(stage = %Stage::Done, "stage started");
                let status = record.settled_status();
                record.transition(status)?;
            }
            Err(entry) => {
                error!(stage = %entry.stage, kind = ?entry.kind, message = %entry.message, "run failed");
                record.record_error(entry);
                record.transition(RunStatus::Failed)?;
            }
        }

        let document_path = self.run_store.finalize_run(&record).await.context("finalizing run")?;
        info!(
            status = ?record.status,
            seen = record.postings_seen,
            new = record.postings_new,
            scored = record.postings_scored,
            errors = record.errors.len(),
            "run finished"
        );
        Ok(RunOutcome {
            record,
            document_path,
            snapshot_manifest,
        })
    }

    /// Cooperative cancellation checkpoint at a stage boundary.
    fn enter(&self, stage: Stage) -> Result<(), ErrorEntry> {
        if self.cancel.is_cancelled() {
            return Err(ErrorEntry::new(
                ErrorKind::Cancelled,
                stage,
                format!("run cancelled before stage {stage}"),
            ));
        }
        info!(%stage, "stage started");
        Ok(())
    }

    async fn save_progress(&self, record: &mut RunRecord) {
        if let Err(err) = self.run_store.save_run_record(record).await {
            warn!(error = %err, "saving run progress failed");
            record.record_error(ErrorEntry::new(ErrorKind::Persistence, Stage::Persist, err.to_string()));
        }
    }

    async fn execute(&self, request: &RunRequest, record: &mut RunRecord) -> Result<(), ErrorEntry> {
        self.enter(Stage::Init)?;
        if request.searches.is_empty() {
            return Err(ErrorEntry::new(ErrorKind::Config, Stage::Init, "no searches configured"));
        }
        let mut jobs = Vec::with_capacity(request.searches.len());
        for target in &request.searches {
            let source = self.sources.get(&target.source_id).ok_or_else(|| {
                ErrorEntry::new(
                    ErrorKind::Config,
                    Stage::Init,
                    format!("no posting source named {:?}; known: {:?}", target.source_id, self.sources.ids()),
                )
                .with_subject(target.to_string())
            })?;
            jobs.push(FetchJob {
                source,
                target: target.clone(),
            });
        }
        let embedder = load_embedder(self.settings.embed_model_path.as_deref())
            .await
            .map_err(|e| ErrorEntry::new(e.kind(), Stage::Init, e.to_string()))?;
        let scorer = EmbeddingScorer::new(embedder, self.settings.similarity);
        let calibrator = ScoreCalibrator::new(request.weights.unwrap_or(self.settings.weights), self.settings.bands);
        info!(
            model = scorer.model_version(),
            w_llm = calibrator.weights().w_llm(),
            w_embed = calibrator.weights().w_embed(),
            evaluator = self.evaluator.is_some(),
            "scoring configured"
        );

        self.enter(Stage::Profile)?;
        let profile = self.profiles.load(&request.resume_path).await.map_err(|e| {
            ErrorEntry::new(e.kind(), Stage::Profile, e.to_string())
                .with_subject(request.resume_path.display().to_string())
        })?;
        record.profile_fingerprint = Some(profile.profile_fingerprint.clone());
        info!(skills = profile.skills.len(), fingerprint = %profile.profile_fingerprint, "profile loaded");

        self.enter(Stage::Fetch)?;
        let report = self.fetcher.fetch_all(jobs).await;
        for failure in report.failures() {
            record.pages_failed += 1;
            record.record_error(
                ErrorEntry::new(
                    failure.kind,
                    Stage::Fetch,
                    format!(
                        "page {} of {} failed after {} attempt(s): {}",
                        failure.page_index, failure.target, failure.attempts, failure.message
                    ),
                )
                .with_subject(failure.url.clone()),
            );
        }

        self.enter(Stage::Extract)?;
        let extracted = extract_pages(&self.sources, report.fetched(), &self.settings.identity);
        for dropped in &extracted.dropped {
            record.record_error(
                ErrorEntry::new(ErrorKind::Extraction, Stage::Extract, dropped.to_string())
                    .with_subject(dropped.page_url()),
            );
        }
        record.postings_seen = extracted.postings.len();

        self.enter(Stage::Dedup)?;
        let mut dedup = DedupStore::load(&self.run_store)
            .await
            .map_err(|e| ErrorEntry::new(ErrorKind::Persistence, Stage::Dedup, format!("loading dedup index: {e}")))?;
        let fresh = dedup.filter_unscored(extracted.postings, &profile.profile_fingerprint, request.force_rescore);
        let details = self.fetcher.fetch_details(&self.sources, fresh).await;
        for failure in &details.failures {
            record.pages_failed += 1;
            record.record_error(
                ErrorEntry::new(
                    failure.kind,
                    Stage::Fetch,
                    format!(
                        "detail page for {} failed after {} attempt(s): {}",
                        failure.posting_url, failure.attempts, failure.message
                    ),
                )
                .with_subject(failure.url.clone()),
            );
        }
        let fresh = details.postings;
        record.postings_new = fresh.len();
        info!(seen = record.postings_seen, new = record.postings_new, "dedup finished");
        self.save_progress(record).await;

        self.enter(Stage::Score)?;
        let profile = Arc::new(profile);
        let (fresh, scores) = embed_postings(scorer, profile.clone(), fresh).await?;

        self.enter(Stage::Calibrate)?;
        self.evaluate_and_persist(record, &mut dedup, profile, calibrator, fresh.into_iter().zip(scores).collect())
            .await?;

        info!(stage = %Stage::Persist, "stage started");
        self.save_progress(record).await;
        Ok(())
    }

    /// Runs per-posting units on a bounded pool and persists each result as it completes.
    async fn evaluate_and_persist(
        &self,
        record: &mut RunRecord,
        dedup: &mut DedupStore,
        profile: Arc<CandidateProfile>,
        calibrator: ScoreCalibrator,
        work: Vec<(Posting, f64)>,
    ) -> Result<(), ErrorEntry> {
        let breaker = Arc::new(Mutex::new(CircuitBreaker::new(
            self.settings.breaker_threshold,
            self.settings.breaker_cooldown,
        )));
        let workers = self.settings.workers.max(1);
        let mut queue: VecDeque<(Posting, f64)> = work.into();
        let mut in_flight = JoinSet::new();
        let mut seq = 0usize;
        let mut consecutive_write_failures = 0usize;

        loop {
            while in_flight.len() < workers && !self.cancel.is_cancelled() {
                let Some((posting, embed_score)) = queue.pop_front() else {
                    break;
                };
                in_flight.spawn(score_posting(
                    self.evaluator.clone(),
                    breaker.clone(),
                    calibrator,
                    profile.clone(),
                    posting,
                    embed_score,
                ));
            }
            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let scored = match joined {
                Ok(scored) => scored,
                Err(err) => {
                    error!(error = %err, "scoring task aborted");
                    record.record_error(ErrorEntry::new(
                        ErrorKind::Persistence,
                        Stage::Calibrate,
                        format!("scoring task aborted: {err}"),
                    ));
                    continue;
                }
            };

            if scored.fell_back {
                record.evaluator_fallbacks += 1;
            }
            for entry in scored.errors {
                record.record_error(entry);
            }

            let result = scored.result;
            let slot = seq;
            seq += 1;
            match self.run_store.append_result(record.run_id, slot, &result).await {
                Ok(_) => {
                    consecutive_write_failures = 0;
                    record.postings_scored += 1;
                    dedup.mark_scored(&result.posting.source_url, &result.profile_fingerprint, result.evaluated_at);
                    info!(
                        url = %result.posting.source_url,
                        final_score = result.final_score,
                        category = %result.category,
                        fallback = result.is_fallback(),
                        "posting scored"
                    );
                }
                Err(err) => {
                    consecutive_write_failures += 1;
                    warn!(url = %result.posting.source_url, error = %err, "persisting result failed");
                    record.record_error(
                        ErrorEntry::new(ErrorKind::Persistence, Stage::Persist, err.to_string())
                            .with_subject(result.posting.source_url.clone()),
                    );
                    if consecutive_write_failures >= self.settings.persist_failure_limit.max(1) {
                        in_flight.shutdown().await;
                        return Err(ErrorEntry::new(
                            ErrorKind::Persistence,
                            Stage::Persist,
                            format!("{consecutive_write_failures} consecutive result writes failed"),
                        ));
                    }
                }
            }
        }

        if !queue.is_empty() {
            return Err(ErrorEntry::new(
                ErrorKind::Cancelled,
                Stage::Calibrate,
                format!("run cancelled with {} posting(s) left unscored", queue.len()),
            ));
        }
        Ok(())
    }

    async fn export_snapshot(&self, run_id: Uuid) -> Result<PathBuf> {
        let results = self.run_store.run_results(run_id).await?;
        export_run_snapshot(&self.run_store.run_dir(run_id), &results).await
    }
}

/// Similarity scores for every posting, computed off the async runtime.
async fn embed_postings(
    scorer: EmbeddingScorer,
    profile: Arc<CandidateProfile>,
    postings: Vec<Posting>,
) -> Result<(Vec<Posting>, Vec<f64>), ErrorEntry> {
    if postings.is_empty() {
        return Ok((postings, Vec::new()));
    }
    tokio::task::spawn_blocking(move || {
        let profile_vector = scorer.embed_profile(&profile);
        let scores = scorer.score_batch(&profile_vector, &postings);
        (postings, scores)
    })
    .await
    .map_err(|e| ErrorEntry::new(ErrorKind::Config, Stage::Score, format!("embedding worker failed: {e}")))
}
