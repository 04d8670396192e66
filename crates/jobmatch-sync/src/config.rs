use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use jobmatch_core::{CategoryBands, ErrorKind, IdentityRule};
use jobmatch_scoring::{CalibrationWeights, EvaluatorConfig, SimilarityNormalization};
use jobmatch_storage::BackoffPolicy;
use thiserror::Error;

pub const DEFAULT_LLM_ENDPOINT: &str = "https://api.openai.com/v1";
pub const DEFAULT_SYNC_CRON: &str = "0 0 23 * * *";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Config
    }
}

/// Reasoning-service settings. Absent when no credential is configured.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    pub max_attempts: usize,
    pub concurrency: usize,
    /// Transport retries per reasoning call, on top of the first attempt.
    pub max_retries: usize,
    pub retry_base_delay: Duration,
}

impl LlmSettings {
    pub fn evaluator_config(&self) -> EvaluatorConfig {
        EvaluatorConfig {
            max_attempts: self.max_attempts,
            call_timeout: self.timeout,
            concurrency: self.concurrency,
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                base_delay: self.retry_base_delay,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub searches_file: PathBuf,
    pub resume_path: PathBuf,
    pub user_agent: String,
    pub http_timeout: Duration,
    pub max_pages: usize,
    pub request_delay: Duration,
    pub request_jitter: Duration,
    pub fetch_max_retries: usize,
    pub per_host_concurrency: usize,
    pub workers: usize,
    pub llm: Option<LlmSettings>,
    /// Evaluator failures tolerated per run; the next one opens the breaker.
    pub breaker_threshold: usize,
    pub breaker_cooldown: Option<Duration>,
    pub weights: CalibrationWeights,
    pub bands: CategoryBands,
    pub identity: IdentityRule,
    pub similarity: SimilarityNormalization,
    pub embed_model_path: Option<PathBuf>,
    pub persist_failure_limit: usize,
    pub lock_stale_after: Duration,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

fn invalid(var: &'static str, value: impl Into<String>, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.into(),
        reason: reason.to_string(),
    }
}

fn positive(var: &'static str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(invalid(var, "0", "must be at least 1"));
    }
    Ok(value)
}

fn flag(value: Option<String>) -> bool {
    value
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(false)
}

impl SyncConfig {
    /// Reads `.env` (if present) and the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let path = |var: &str, default: &str| PathBuf::from(lookup(var).unwrap_or_else(|| default.to_string()));

        let api_key = lookup("JOBMATCH_LLM_API_KEY").or_else(|| lookup("OPENAI_API_KEY"));
        let llm = match api_key {
            Some(api_key) => Some(LlmSettings {
                endpoint: lookup("JOBMATCH_LLM_ENDPOINT").unwrap_or_else(|| DEFAULT_LLM_ENDPOINT.to_string()),
                api_key,
                model: lookup("JOBMATCH_LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
                timeout: Duration::from_secs(parse_var(&lookup, "JOBMATCH_LLM_TIMEOUT_SECS", 45)?),
                max_attempts: positive(
                    "JOBMATCH_LLM_MAX_ATTEMPTS",
                    parse_var(&lookup, "JOBMATCH_LLM_MAX_ATTEMPTS", 3)?,
                )?,
                concurrency: positive(
                    "JOBMATCH_LLM_CONCURRENCY",
                    parse_var(&lookup, "JOBMATCH_LLM_CONCURRENCY", 2)?,
                )?,
                max_retries: parse_var(&lookup, "JOBMATCH_LLM_MAX_RETRIES", 3)?,
                retry_base_delay: Duration::from_millis(parse_var(&lookup, "JOBMATCH_LLM_RETRY_BASE_MS", 500)?),
            }),
            None => None,
        };

        let w_llm = parse_var(&lookup, "JOBMATCH_W_LLM", 0.7)?;
        let w_embed = parse_var(&lookup, "JOBMATCH_W_EMBED", 0.3)?;
        let weights = CalibrationWeights::new(w_llm, w_embed)
            .map_err(|e| invalid("JOBMATCH_W_LLM", format!("{w_llm},{w_embed}"), e))?;

        let bands = match lookup("JOBMATCH_BANDS") {
            Some(raw) => CategoryBands::parse(&raw).map_err(|e| invalid("JOBMATCH_BANDS", raw, e))?,
            None => CategoryBands::default(),
        };

        let similarity = match lookup("JOBMATCH_SIMILARITY") {
            Some(raw) => SimilarityNormalization::parse(&raw)
                .ok_or_else(|| invalid("JOBMATCH_SIMILARITY", raw, "expected clamp or rescale"))?,
            None => SimilarityNormalization::default(),
        };

        let identity = IdentityRule {
            keep_query_params: lookup("JOBMATCH_IDENTITY_KEEP_QUERY")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            ..IdentityRule::default()
        };

        let breaker_cooldown = match lookup("JOBMATCH_BREAKER_COOLDOWN_SECS") {
            Some(_) => Some(Duration::from_secs(parse_var(&lookup, "JOBMATCH_BREAKER_COOLDOWN_SECS", 0)?)),
            None => None,
        };

        Ok(Self {
            data_dir: path("JOBMATCH_DATA_DIR", "./data"),
            searches_file: path("JOBMATCH_SEARCHES_FILE", "./searches.yaml"),
            resume_path: path("JOBMATCH_RESUME", "./resume.md"),
            user_agent: lookup("JOBMATCH_USER_AGENT").unwrap_or_else(|| "jobmatch-bot/0.1".to_string()),
            http_timeout: Duration::from_secs(parse_var(&lookup, "JOBMATCH_HTTP_TIMEOUT_SECS", 20)?),
            max_pages: positive("JOBMATCH_MAX_PAGES", parse_var(&lookup, "JOBMATCH_MAX_PAGES", 3)?)?,
            request_delay: Duration::from_millis(parse_var(&lookup, "JOBMATCH_REQUEST_DELAY_MS", 1500)?),
            request_jitter: Duration::from_millis(parse_var(&lookup, "JOBMATCH_REQUEST_JITTER_MS", 750)?),
            fetch_max_retries: parse_var(&lookup, "JOBMATCH_FETCH_MAX_RETRIES", 3)?,
            per_host_concurrency: positive(
                "JOBMATCH_PER_HOST_CONCURRENCY",
                parse_var(&lookup, "JOBMATCH_PER_HOST_CONCURRENCY", 1)?,
            )?,
            workers: positive("JOBMATCH_WORKERS", parse_var(&lookup, "JOBMATCH_WORKERS", 4)?)?,
            llm,
            breaker_threshold: positive(
                "JOBMATCH_BREAKER_THRESHOLD",
                parse_var(&lookup, "JOBMATCH_BREAKER_THRESHOLD", 5)?,
            )?,
            breaker_cooldown,
            weights,
            bands,
            identity,
            similarity,
            embed_model_path: lookup("JOBMATCH_EMBED_MODEL_PATH").map(PathBuf::from),
            persist_failure_limit: positive(
                "JOBMATCH_PERSIST_FAILURE_LIMIT",
                parse_var(&lookup, "JOBMATCH_PERSIST_FAILURE_LIMIT", 3)?,
            )?,
            lock_stale_after: Duration::from_secs(parse_var(&lookup, "JOBMATCH_LOCK_STALE_SECS", 6 * 3600)?),
            scheduler_enabled: flag(lookup("JOBMATCH_SCHEDULER_ENABLED")),
            sync_cron: lookup("JOBMATCH_SYNC_CRON").unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
        })
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.data_dir.join("runs")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.data_dir.join("locks")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<SyncConfig, ConfigError> {
        let env: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        SyncConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.max_pages, 3);
        assert_eq!(config.request_delay, Duration::from_millis(1500));
        assert_eq!(config.workers, 4);
        assert_eq!(config.breaker_threshold, 5);
        assert_eq!(config.weights, CalibrationWeights::default());
        assert_eq!(config.bands.cutoffs(), (85, 70, 50));
        assert_eq!(config.runs_dir(), PathBuf::from("./data/runs"));
        assert!(config.llm.is_none());
        assert!(config.breaker_cooldown.is_none());
        assert!(!config.scheduler_enabled);
        assert_eq!(config.sync_cron, DEFAULT_SYNC_CRON);
    }

    #[test]
    fn evaluator_is_enabled_by_either_credential() {
        let config = config_from(&[("OPENAI_API_KEY", "sk-test")]).unwrap();
        let llm = config.llm.unwrap();
        assert_eq!(llm.api_key, "sk-test");
        assert_eq!(llm.endpoint, DEFAULT_LLM_ENDPOINT);
        assert_eq!(llm.max_attempts, 3);
        assert_eq!(llm.max_retries, 3);
        assert_eq!(llm.retry_base_delay, Duration::from_millis(500));

        let config = config_from(&[
            ("OPENAI_API_KEY", "sk-fallback"),
            ("JOBMATCH_LLM_API_KEY", "sk-primary"),
            ("JOBMATCH_LLM_ENDPOINT", "http://localhost:11434/v1"),
        ])
        .unwrap();
        let llm = config.llm.unwrap();
        assert_eq!(llm.api_key, "sk-primary");
        assert_eq!(llm.endpoint, "http://localhost:11434/v1");
    }

    #[test]
    fn explicit_values_are_validated_not_defaulted() {
        assert!(config_from(&[("JOBMATCH_MAX_PAGES", "many")]).is_err());
        assert!(config_from(&[("JOBMATCH_WORKERS", "0")]).is_err());
        assert!(config_from(&[("JOBMATCH_W_LLM", "-1")]).is_err());
        assert!(config_from(&[("JOBMATCH_BANDS", "50,70,85")]).is_err());
        assert!(config_from(&[("JOBMATCH_SIMILARITY", "cosine")]).is_err());

        let err = config_from(&[("JOBMATCH_HTTP_TIMEOUT_SECS", "soon")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.to_string().contains("JOBMATCH_HTTP_TIMEOUT_SECS"));
    }

    #[test]
    fn overrides_are_applied() {
        let config = config_from(&[
            ("JOBMATCH_W_LLM", "0.9"),
            ("JOBMATCH_W_EMBED", "0.1"),
            ("JOBMATCH_BANDS", "90, 75, 40"),
            ("JOBMATCH_IDENTITY_KEEP_QUERY", "currentJobId, ad"),
            ("JOBMATCH_SIMILARITY", "rescale"),
            ("JOBMATCH_BREAKER_COOLDOWN_SECS", "120"),
            ("JOBMATCH_SCHEDULER_ENABLED", "true"),
        ])
        .unwrap();
        assert_eq!(config.weights.w_llm(), 0.9);
        assert_eq!(config.bands.cutoffs(), (90, 75, 40));
        assert_eq!(config.identity.keep_query_params, vec!["currentJobId", "ad"]);
        assert_eq!(config.similarity, SimilarityNormalization::Rescale);
        assert_eq!(config.breaker_cooldown, Some(Duration::from_secs(120)));
        assert!(config.scheduler_enabled);
    }

    #[test]
    fn evaluator_retry_policy_comes_from_the_environment() {
        let config = config_from(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("JOBMATCH_LLM_MAX_RETRIES", "5"),
            ("JOBMATCH_LLM_RETRY_BASE_MS", "250"),
            ("JOBMATCH_LLM_TIMEOUT_SECS", "10"),
        ])
        .unwrap();
        let evaluator = config.llm.unwrap().evaluator_config();
        assert_eq!(evaluator.backoff.max_retries, 5);
        assert_eq!(evaluator.backoff.base_delay, Duration::from_millis(250));
        assert_eq!(evaluator.backoff.max_delay, BackoffPolicy::default().max_delay);
        assert_eq!(evaluator.call_timeout, Duration::from_secs(10));
        assert_eq!(evaluator.max_attempts, 3);

        assert!(config_from(&[("OPENAI_API_KEY", "sk-test"), ("JOBMATCH_LLM_MAX_RETRIES", "lots")]).is_err());
    }
}
