use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobmatch_core::RunStatus;
use jobmatch_scoring::CalibrationWeights;
use jobmatch_storage::RunStore;
use jobmatch_sync::{parse_search_arg, report_markdown, RunOverrides, SyncConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobmatch-cli")]
#[command(about = "Discover job postings and score them against a resume")]
struct Cli {
    /// Log at debug level unless RUST_LOG is set
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute one discovery-and-scoring run
    Run(RunArgs),
    /// Trigger runs on the configured cron schedule until interrupted
    Schedule,
    /// Print a Markdown summary of recent runs
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[derive(Debug, Default, clap::Args)]
struct RunArgs {
    /// Resume in Markdown; defaults to JOBMATCH_RESUME
    #[arg(long)]
    resume: Option<PathBuf>,
    /// Search as `query@locale`; repeatable. Replaces the search plan file.
    #[arg(long = "search")]
    searches: Vec<String>,
    /// Posting source for --search entries
    #[arg(long, default_value = "linkedin")]
    source: String,
    #[arg(long)]
    w_llm: Option<f64>,
    #[arg(long)]
    w_embed: Option<f64>,
    /// Re-score postings already scored for this resume
    #[arg(long)]
    force: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run_overrides(config: &SyncConfig, args: RunArgs) -> Result<RunOverrides> {
    let searches = args
        .searches
        .iter()
        .map(|arg| parse_search_arg(&args.source, arg))
        .collect::<Result<Vec<_>>>()?;
    let weights = match (args.w_llm, args.w_embed) {
        (None, None) => None,
        (w_llm, w_embed) => Some(
            CalibrationWeights::new(
                w_llm.unwrap_or(config.weights.w_llm()),
                w_embed.unwrap_or(config.weights.w_embed()),
            )
            .context("invalid calibration weights")?,
        ),
    };
    Ok(RunOverrides {
        resume: args.resume,
        searches,
        weights,
        force_rescore: args.force,
    })
}

/// Cancels `token` on Ctrl-C so an in-progress run stops at its next checkpoint.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling run");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = SyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Run(RunArgs {
        source: "linkedin".to_string(),
        ..Default::default()
    })) {
        Commands::Run(args) => {
            let overrides = run_overrides(&config, args)?;
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let outcome = jobmatch_sync::run_once(&config, overrides, cancel).await?;
            let record = &outcome.record;
            println!(
                "run complete: run_id={} status={:?} seen={} new={} scored={} fallbacks={} failed_pages={} errors={}",
                record.run_id,
                record.status,
                record.postings_seen,
                record.postings_new,
                record.postings_scored,
                record.evaluator_fallbacks,
                record.pages_failed,
                record.errors.len()
            );
            println!("run document: {}", outcome.document_path.display());
            if let Some(manifest) = &outcome.snapshot_manifest {
                println!("snapshot manifest: {}", manifest.display());
            }
            if record.status == RunStatus::Failed {
                let reason = record
                    .errors
                    .last()
                    .map(|e| format!("{} ({:?} at {})", e.message, e.kind, e.stage))
                    .unwrap_or_else(|| "unknown".to_string());
                anyhow::bail!("run failed: {reason}");
            }
        }
        Commands::Schedule => {
            let mut config = config;
            config.scheduler_enabled = true;
            let Some(mut sched) = jobmatch_sync::maybe_build_scheduler(&config).await? else {
                anyhow::bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler started; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
        }
        Commands::Report { runs } => {
            let store = RunStore::new(config.runs_dir());
            let report = report_markdown(&store, runs).await?;
            println!("{report}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SyncConfig {
        SyncConfig::from_lookup(|_| None).unwrap()
    }

    #[test]
    fn run_flags_become_overrides() {
        let cli = Cli::parse_from([
            "jobmatch-cli",
            "run",
            "--search",
            "rust developer@Stockholm",
            "--search",
            "golang@Sweden",
            "--source",
            "jobtech",
            "--w-llm",
            "0.5",
            "--force",
        ]);
        let Some(Commands::Run(args)) = cli.command else {
            panic!("expected run command");
        };
        let overrides = run_overrides(&config(), args).unwrap();
        assert_eq!(overrides.searches.len(), 2);
        assert_eq!(overrides.searches[0].query, "rust developer");
        assert_eq!(overrides.searches[0].locale, "Stockholm");
        assert_eq!(overrides.searches[1].source_id, "jobtech");
        let weights = overrides.weights.unwrap();
        assert_eq!(weights.w_llm(), 0.5);
        assert_eq!(weights.w_embed(), 0.3);
        assert!(overrides.force_rescore);
    }

    #[test]
    fn negative_weight_is_rejected() {
        let cli = Cli::parse_from(["jobmatch-cli", "run", "--w-embed=-1"]);
        let Some(Commands::Run(args)) = cli.command else {
            panic!("expected run command");
        };
        assert!(run_overrides(&config(), args).is_err());
    }
}
