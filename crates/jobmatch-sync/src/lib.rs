//! Run orchestration: configuration, search plan, circuit breaker, the staged pipeline,
//! snapshot export and the scheduler hook.

use std::path::PathBuf;

use anyhow::{Context, Result};
use jobmatch_core::SearchTarget;
use jobmatch_scoring::CalibrationWeights;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod breaker;
mod config;
mod export;
mod pipeline;
mod plan;

pub use breaker::{Admission, BreakerState, CircuitBreaker};
pub use config::{ConfigError, LlmSettings, SyncConfig, DEFAULT_LLM_ENDPOINT, DEFAULT_SYNC_CRON};
pub use export::{
    export_run_snapshot, report_markdown, write_matches_parquet, ParquetManifest, ParquetManifestFile,
    SNAPSHOT_SCHEMA_VERSION,
};
pub use pipeline::{run_lock_key, Pipeline, PipelineSettings, RunOutcome, RunRequest};
pub use plan::{parse_search_arg, SearchPlan, SearchPlanEntry};

pub const CRATE_NAME: &str = "jobmatch-sync";

/// Command-line adjustments applied on top of [`SyncConfig`] for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub resume: Option<PathBuf>,
    /// Replaces the search plan when non-empty.
    pub searches: Vec<SearchTarget>,
    pub weights: Option<CalibrationWeights>,
    pub force_rescore: bool,
}

pub async fn build_request(config: &SyncConfig, overrides: RunOverrides) -> Result<RunRequest> {
    let searches = if overrides.searches.is_empty() {
        SearchPlan::load(&config.searches_file).await?.targets()
    } else {
        overrides.searches
    };
    Ok(RunRequest {
        resume_path: overrides.resume.unwrap_or_else(|| config.resume_path.clone()),
        searches,
        weights: overrides.weights,
        force_rescore: overrides.force_rescore,
    })
}

pub async fn run_once(config: &SyncConfig, overrides: RunOverrides, cancel: CancellationToken) -> Result<RunOutcome> {
    let request = build_request(config, overrides).await?;
    let pipeline = Pipeline::from_config(config)?.with_cancellation(cancel);
    pipeline.run(request).await
}

/// Cron-triggered runs. `None` when the scheduler is disabled in configuration.
pub async fn maybe_build_scheduler(config: &SyncConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job_config = config.clone();
    let job = Job::new_async(config.sync_cron.as_str(), move |_uuid, _l| {
        let config = job_config.clone();
        Box::pin(async move {
            info!("scheduled run triggered");
            match run_once(&config, RunOverrides::default(), CancellationToken::new()).await {
                Ok(outcome) => info!(
                    run_id = %outcome.record.run_id,
                    status = ?outcome.record.status,
                    scored = outcome.record.postings_scored,
                    "scheduled run finished"
                ),
                Err(err) => warn!(error = %format!("{err:#}"), "scheduled run did not complete"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.sync_cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn explicit_searches_bypass_the_plan_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::from_lookup(|key| match key {
            "JOBMATCH_SEARCHES_FILE" => Some(dir.path().join("missing.yaml").display().to_string()),
            _ => None,
        })
        .unwrap();

        let request = build_request(
            &config,
            RunOverrides {
                searches: vec![SearchTarget::new("linkedin", "rust", "Sweden")],
                force_rescore: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(request.searches.len(), 1);
        assert_eq!(request.resume_path, PathBuf::from("./resume.md"));
        assert!(request.force_rescore);

        assert!(build_request(&config, RunOverrides::default()).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scheduler_is_only_built_when_enabled() {
        let disabled = SyncConfig::from_lookup(|_| None).unwrap();
        assert!(maybe_build_scheduler(&disabled).await.unwrap().is_none());

        let enabled = SyncConfig::from_lookup(|key| (key == "JOBMATCH_SCHEDULER_ENABLED").then(|| "1".to_string())).unwrap();
        assert!(maybe_build_scheduler(&enabled).await.unwrap().is_some());
    }
}
