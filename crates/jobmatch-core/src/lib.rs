//! Core domain model for the job-match pipeline: profiles, postings, scores and run records.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobmatch-core";

/// One (query, locale) pair resolved against a concrete posting source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchTarget {
    pub source_id: String,
    pub query: String,
    pub locale: String,
}

impl SearchTarget {
    pub fn new(source_id: impl Into<String>, query: impl Into<String>, locale: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            query: query.into(),
            locale: locale.into(),
        }
    }
}

impl fmt::Display for SearchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.source_id, self.query, self.locale)
    }
}

/// Normalized candidate profile. Immutable for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateProfile {
    pub skills: BTreeSet<String>,
    pub raw_text: String,
    pub profile_fingerprint: String,
}

impl CandidateProfile {
    pub fn new(skills: BTreeSet<String>, raw_text: String, profile_fingerprint: String) -> Self {
        Self {
            skills,
            raw_text,
            profile_fingerprint,
        }
    }

    /// Leading slice of the resume text, cut on a char boundary.
    pub fn summary(&self, max_chars: usize) -> String {
        truncate_chars(&self.raw_text, max_chars)
    }

    pub fn skills_list(&self) -> Vec<String> {
        self.skills.iter().cloned().collect()
    }
}

/// Structured posting. `source_url` is already canonical and doubles as the identity key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub posting_id: Uuid,
    pub source_id: String,
    pub source_url: String,
    pub title: String,
    pub company: Option<String>,
    pub locale: String,
    pub query: String,
    pub location: Option<String>,
    pub work_percentage: Option<f64>,
    pub posted_at: Option<NaiveDate>,
    pub deadline: Option<NaiveDate>,
    pub description_text: String,
    pub fetched_at: DateTime<Utc>,
}

impl Posting {
    /// Text fed to the similarity model: title followed by the description.
    pub fn scoring_text(&self) -> String {
        if self.description_text.is_empty() {
            self.title.clone()
        } else {
            format!("{}\n{}", self.title, self.description_text)
        }
    }
}

/// Deterministic posting id derived from the canonical URL.
pub fn posting_id_for(canonical_url: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, canonical_url.as_bytes())
}

/// Collapse runs of whitespace into single spaces and trim the ends.
pub fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        Some((idx, _)) => input[..idx].to_string(),
        None => input.to_string(),
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("invalid posting url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unsupported url scheme {scheme} in {url}")]
    UnsupportedScheme { url: String, scheme: String },
}

/// Canonicalization rule for posting identity URLs.
///
/// Scheme and host are lowercased and default ports dropped by the URL parser itself;
/// the rule additionally drops the fragment, every query parameter not on the allow-list,
/// and (optionally) a trailing slash on non-root paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRule {
    #[serde(default)]
    pub keep_query_params: Vec<String>,
    #[serde(default = "default_true")]
    pub strip_trailing_slash: bool,
}

fn default_true() -> bool {
    true
}

impl Default for IdentityRule {
    fn default() -> Self {
        Self {
            keep_query_params: Vec::new(),
            strip_trailing_slash: true,
        }
    }
}

impl IdentityRule {
    pub fn canonicalize(&self, raw: &str) -> Result<String, IdentityError> {
        let trimmed = raw.trim();
        let mut url = Url::parse(trimmed).map_err(|e| IdentityError::InvalidUrl {
            url: trimmed.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(IdentityError::UnsupportedScheme {
                url: trimmed.to_string(),
                scheme: url.scheme().to_string(),
            });
        }

        url.set_fragment(None);

        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| self.keep_query_params.iter().any(|keep| keep == k.as_ref()))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(kept);
        }

        if self.strip_trailing_slash {
            let path = url.path().to_string();
            if path.len() > 1 && path.ends_with('/') {
                url.set_path(path.trim_end_matches('/'));
            }
        }

        Ok(url.to_string())
    }
}

/// Recommendation label. Shared by the calibrated category and the evaluator's own label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    MustApply,
    Recommended,
    CanApply,
    General,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::MustApply,
        Category::Recommended,
        Category::CanApply,
        Category::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::MustApply => "must_apply",
            Category::Recommended => "recommended",
            Category::CanApply => "can_apply",
            Category::General => "general",
        }
    }

    /// Accepts `must apply`, `must_apply`, `Must-Apply` and friends.
    pub fn parse_label(input: &str) -> Option<Self> {
        let key = input
            .trim()
            .to_ascii_lowercase()
            .replace(['-', '_'], " ");
        match normalize_whitespace(&key).as_str() {
            "must apply" => Some(Category::MustApply),
            "recommended" => Some(Category::Recommended),
            "can apply" => Some(Category::CanApply),
            "general" => Some(Category::General),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BandsError {
    #[error("category cutoffs must satisfy 100 >= must_apply > recommended > can_apply > 0 (got {must_apply},{recommended},{can_apply})")]
    NotMonotonic {
        must_apply: u8,
        recommended: u8,
        can_apply: u8,
    },
    #[error("cannot parse category bands from {0:?}; expected three comma-separated cutoffs")]
    Malformed(String),
}

/// Lower cutoffs for each category; anything below `can_apply_min` is `general`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryBands {
    must_apply_min: u8,
    recommended_min: u8,
    can_apply_min: u8,
}

impl Default for CategoryBands {
    fn default() -> Self {
        Self {
            must_apply_min: 85,
            recommended_min: 70,
            can_apply_min: 50,
        }
    }
}

impl CategoryBands {
    pub fn new(must_apply_min: u8, recommended_min: u8, can_apply_min: u8) -> Result<Self, BandsError> {
        let ok = must_apply_min <= 100
            && must_apply_min > recommended_min
            && recommended_min > can_apply_min
            && can_apply_min > 0;
        if !ok {
            return Err(BandsError::NotMonotonic {
                must_apply: must_apply_min,
                recommended: recommended_min,
                can_apply: can_apply_min,
            });
        }
        Ok(Self {
            must_apply_min,
            recommended_min,
            can_apply_min,
        })
    }

    /// Parses `"85,70,50"`.
    pub fn parse(spec: &str) -> Result<Self, BandsError> {
        let parts = spec
            .split(',')
            .map(|p| p.trim().parse::<u8>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| BandsError::Malformed(spec.to_string()))?;
        match parts.as_slice() {
            [must, rec, can] => Self::new(*must, *rec, *can),
            _ => Err(BandsError::Malformed(spec.to_string())),
        }
    }

    pub fn category_for(&self, final_score: u8) -> Category {
        if final_score >= self.must_apply_min {
            Category::MustApply
        } else if final_score >= self.recommended_min {
            Category::Recommended
        } else if final_score >= self.can_apply_min {
            Category::CanApply
        } else {
            Category::General
        }
    }

    pub fn cutoffs(&self) -> (u8, u8, u8) {
        (self.must_apply_min, self.recommended_min, self.can_apply_min)
    }
}

/// Validated reasoning-service verdict. All three fields are present or the verdict is absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmAssessment {
    pub confidence: u8,
    pub label: Category,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    #[serde(flatten)]
    pub posting: Posting,
    pub profile_fingerprint: String,
    pub embed_score: f64,
    pub llm: Option<LlmAssessment>,
    pub final_score: u8,
    pub category: Category,
    pub evaluated_at: DateTime<Utc>,
}

impl MatchResult {
    pub fn posting_ref(&self) -> Uuid {
        self.posting.posting_id
    }

    pub fn llm_confidence(&self) -> Option<u8> {
        self.llm.as_ref().map(|l| l.confidence)
    }

    pub fn llm_label(&self) -> Option<Category> {
        self.llm.as_ref().map(|l| l.label)
    }

    pub fn llm_explanation(&self) -> Option<&str> {
        self.llm.as_ref().map(|l| l.explanation.as_str())
    }

    pub fn is_fallback(&self) -> bool {
        self.llm.is_none()
    }
}

/// Error taxonomy shared by every pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Network,
    RateLimit,
    Extraction,
    Schema,
    Persistence,
    Cancelled,
}

impl ErrorKind {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::Config | ErrorKind::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    Profile,
    Fetch,
    Extract,
    Dedup,
    Score,
    Calibrate,
    Persist,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "init",
            Stage::Profile => "profile",
            Stage::Fetch => "fetch",
            Stage::Extract => "extract",
            Stage::Dedup => "dedup",
            Stage::Score => "score",
            Stage::Calibrate => "calibrate",
            Stage::Persist => "persist",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub kind: ErrorKind,
    pub stage: Stage,
    pub subject: Option<String>,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ErrorEntry {
    pub fn new(kind: ErrorKind, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            subject: None,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::CompletedWithErrors | RunStatus::Failed
        )
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Pending, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::CompletedWithErrors)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal run status transition {from:?} -> {to:?}")]
pub struct RunStatusError {
    pub from: RunStatus,
    pub to: RunStatus,
}

/// Run metadata; the unit of external visibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub profile_fingerprint: Option<String>,
    #[serde(default)]
    pub searches: Vec<SearchTarget>,
    pub postings_seen: usize,
    pub postings_new: usize,
    #[serde(default)]
    pub postings_scored: usize,
    #[serde(default)]
    pub pages_failed: usize,
    #[serde(default)]
    pub evaluator_fallbacks: usize,
    pub errors: Vec<ErrorEntry>,
}

impl RunRecord {
    pub fn pending(run_id: Uuid, searches: Vec<SearchTarget>) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            ended_at: None,
            status: RunStatus::Pending,
            profile_fingerprint: None,
            searches,
            postings_seen: 0,
            postings_new: 0,
            postings_scored: 0,
            pages_failed: 0,
            evaluator_fallbacks: 0,
            errors: Vec::new(),
        }
    }

    pub fn transition(&mut self, next: RunStatus) -> Result<(), RunStatusError> {
        if !self.status.can_transition_to(next) {
            return Err(RunStatusError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn record_error(&mut self, entry: ErrorEntry) {
        self.errors.push(entry);
    }

    /// Terminal status for a run that reached DONE without a fatal error.
    pub fn settled_status(&self) -> RunStatus {
        if self.errors.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::CompletedWithErrors
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn posting(url: &str) -> Posting {
        Posting {
            posting_id: posting_id_for(url),
            source_id: "linkedin-guest".into(),
            source_url: url.into(),
            title: "Data Engineer".into(),
            company: Some("Acme".into()),
            locale: "sweden".into(),
            query: "data engineer".into(),
            location: None,
            work_percentage: None,
            posted_at: None,
            deadline: None,
            description_text: "Build pipelines".into(),
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn canonicalization_drops_tracking_noise() {
        let rule = IdentityRule::default();
        let a = rule
            .canonicalize("HTTPS://SE.LinkedIn.com:443/jobs/view/data-engineer-123/?refId=abc&trackingId=x#top")
            .unwrap();
        let b = rule
            .canonicalize("  https://se.linkedin.com/jobs/view/data-engineer-123  ")
            .unwrap();
        assert_eq!(a, "https://se.linkedin.com/jobs/view/data-engineer-123");
        assert_eq!(a, b);
        assert_eq!(posting_id_for(&a), posting_id_for(&b));
    }

    #[test]
    fn canonicalization_keeps_allow_listed_params() {
        let rule = IdentityRule {
            keep_query_params: vec!["id".into()],
            strip_trailing_slash: false,
        };
        let url = rule
            .canonicalize("https://jobs.example.com/view/?utm_source=x&id=42")
            .unwrap();
        assert_eq!(url, "https://jobs.example.com/view/?id=42");
    }

    #[test]
    fn canonicalization_rejects_non_http() {
        let rule = IdentityRule::default();
        assert!(matches!(
            rule.canonicalize("mailto:jobs@example.com"),
            Err(IdentityError::UnsupportedScheme { .. })
        ));
        assert!(matches!(
            rule.canonicalize("/jobs/view/1"),
            Err(IdentityError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn bands_cover_full_range_monotonically() {
        let bands = CategoryBands::default();
        assert_eq!(bands.category_for(0), Category::General);
        assert_eq!(bands.category_for(49), Category::General);
        assert_eq!(bands.category_for(50), Category::CanApply);
        assert_eq!(bands.category_for(70), Category::Recommended);
        assert_eq!(bands.category_for(84), Category::Recommended);
        assert_eq!(bands.category_for(85), Category::MustApply);
        assert_eq!(bands.category_for(100), Category::MustApply);

        let mut last = Category::General;
        for score in 0..=100u8 {
            let cat = bands.category_for(score);
            assert!(cat <= last, "category regressed at {score}");
            last = cat;
        }
    }

    #[test]
    fn bands_reject_overlapping_cutoffs() {
        assert!(CategoryBands::new(70, 70, 50).is_err());
        assert!(CategoryBands::new(101, 70, 50).is_err());
        assert!(CategoryBands::new(85, 70, 0).is_err());
        assert_eq!(CategoryBands::parse("90, 75, 40").unwrap().cutoffs(), (90, 75, 40));
        assert!(matches!(CategoryBands::parse("90,75"), Err(BandsError::Malformed(_))));
    }

    #[test]
    fn labels_parse_leniently() {
        assert_eq!(Category::parse_label("must apply"), Some(Category::MustApply));
        assert_eq!(Category::parse_label("Can-Apply"), Some(Category::CanApply));
        assert_eq!(Category::parse_label(" recommended "), Some(Category::Recommended));
        assert_eq!(Category::parse_label("maybe"), None);
    }

    #[test]
    fn run_status_follows_lifecycle() {
        let mut record = RunRecord::pending(Uuid::new_v4(), Vec::new());
        assert!(record.transition(RunStatus::Completed).is_err());
        record.transition(RunStatus::Running).unwrap();
        assert_eq!(record.settled_status(), RunStatus::Completed);
        record.record_error(ErrorEntry::new(ErrorKind::Network, Stage::Fetch, "timeout"));
        assert_eq!(record.settled_status(), RunStatus::CompletedWithErrors);
        record.transition(RunStatus::CompletedWithErrors).unwrap();
        assert!(record.ended_at.is_some());
        assert!(record.transition(RunStatus::Failed).is_err());
    }

    #[test]
    fn match_result_serializes_posting_fields_flat_and_llm_nested() {
        let result = MatchResult {
            posting: posting("https://se.linkedin.com/jobs/view/1"),
            profile_fingerprint: "abc".into(),
            embed_score: 0.5,
            llm: Some(LlmAssessment {
                confidence: 80,
                label: Category::Recommended,
                explanation: "Strong overlap.".into(),
            }),
            final_score: 71,
            category: Category::Recommended,
            evaluated_at: Utc::now(),
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["source_url"], "https://se.linkedin.com/jobs/view/1");
        assert_eq!(value["llm"]["explanation"], "Strong overlap.");
        assert_eq!(value["category"], "recommended");
        assert!(value["deadline"].is_null());

        let back: MatchResult = serde_json::from_value(value).unwrap();
        assert_eq!(back.llm_confidence(), Some(80));
    }

    #[test]
    fn summary_truncates_on_char_boundary() {
        let profile = CandidateProfile::new(BTreeSet::new(), "åäö data".into(), "fp".into());
        assert_eq!(profile.summary(3), "åäö");
        assert_eq!(profile.summary(100), "åäö data");
    }
}
