//! Posting source contracts, listing extraction, and the paginating fetcher.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use jobmatch_core::{normalize_whitespace, posting_id_for, IdentityRule, Posting, SearchTarget};
use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;
use url::Url;

mod fetcher;
mod jobtech;
mod linkedin;

pub use fetcher::{
    DetailFailure, DetailReport, FetchJob, FetchReport, FetcherConfig, PageFailure, PageOutcome, PostingFetcher,
};
pub use jobtech::{JobTechSearchSource, JOBTECH_SOURCE_ID};
pub use linkedin::{LinkedInGuestSource, LINKEDIN_SOURCE_ID};

pub const CRATE_NAME: &str = "jobmatch-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Html,
    Json,
}

impl PayloadKind {
    pub fn extension(&self) -> &'static str {
        match self {
            PayloadKind::Html => "html",
            PayloadKind::Json => "json",
        }
    }
}

/// One fetched result page for a search target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPage {
    pub source_id: String,
    pub target: SearchTarget,
    pub page_index: usize,
    pub url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
    /// Path of the archived copy relative to the archive root, when archiving is enabled.
    pub archived_as: Option<PathBuf>,
}

impl RawPage {
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error("listing #{index} on {page_url} has no link")]
    MissingLink { page_url: String, index: usize },
    #[error("listing #{index} on {page_url} has no title")]
    MissingTitle { page_url: String, index: usize },
    #[error("listing #{index} on {page_url} has an unusable link: {reason}")]
    BadLink {
        page_url: String,
        index: usize,
        reason: String,
    },
    #[error("page {page_url} could not be parsed: {reason}")]
    MalformedPage { page_url: String, reason: String },
}

impl ExtractionError {
    pub fn page_url(&self) -> &str {
        match self {
            ExtractionError::MissingLink { page_url, .. }
            | ExtractionError::MissingTitle { page_url, .. }
            | ExtractionError::BadLink { page_url, .. }
            | ExtractionError::MalformedPage { page_url, .. } => page_url,
        }
    }
}

/// Listing fields as found on the page, before identity is assigned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingDraft {
    pub link: Option<String>,
    pub title: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub work_percentage: Option<f64>,
    pub posted_at: Option<NaiveDate>,
    pub deadline: Option<NaiveDate>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractedPage {
    pub postings: Vec<Posting>,
    pub dropped: Vec<ExtractionError>,
}

pub trait PostingSource: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn payload_kind(&self) -> PayloadKind;
    fn page_url(&self, target: &SearchTarget, page_index: usize) -> String;

    /// Every listing element on the page, in page order. Errors only when the payload as a
    /// whole cannot be read.
    fn listings(&self, page: &RawPage) -> Result<Vec<ListingDraft>, ExtractionError>;

    /// Page holding a posting's full description, for sources whose result pages only carry
    /// a summary.
    fn detail_url(&self, _posting: &Posting) -> Option<String> {
        None
    }

    /// Description text from a detail page; `None` when the page has none.
    fn parse_detail(&self, _body: &str) -> Option<String> {
        None
    }

    /// An empty or unreadable page ends pagination for its target.
    fn is_exhausted(&self, page: &RawPage) -> bool {
        self.listings(page).map(|l| l.is_empty()).unwrap_or(true)
    }

    fn extract(&self, page: &RawPage, identity: &IdentityRule) -> ExtractedPage {
        match self.listings(page) {
            Ok(drafts) => assemble_postings(page, drafts, identity),
            Err(err) => {
                warn!(source = %page.source_id, url = %page.url, error = %err, "page dropped");
                ExtractedPage {
                    postings: Vec::new(),
                    dropped: vec![err],
                }
            }
        }
    }
}

/// Sources addressable by `source_id`.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: BTreeMap<&'static str, Arc<dyn PostingSource>>,
}

impl SourceRegistry {
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(LinkedInGuestSource::default()));
        registry.register(Arc::new(JobTechSearchSource::default()));
        registry
    }

    pub fn register(&mut self, source: Arc<dyn PostingSource>) {
        self.sources.insert(source.source_id(), source);
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<dyn PostingSource>> {
        self.sources.get(source_id).cloned()
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.sources.keys().copied().collect()
    }
}

/// Turns listing drafts into postings: resolves links against the page URL, assigns the
/// canonical identity and drops listings without a link or title. Postings sharing an
/// identity collapse to the first occurrence.
pub fn assemble_postings(page: &RawPage, drafts: Vec<ListingDraft>, identity: &IdentityRule) -> ExtractedPage {
    let base = Url::parse(&page.url).ok();
    let mut seen = HashSet::new();
    let mut out = ExtractedPage::default();

    for (index, draft) in drafts.into_iter().enumerate() {
        let Some(link) = draft.link.as_deref().and_then(non_empty) else {
            out.dropped.push(ExtractionError::MissingLink {
                page_url: page.url.clone(),
                index,
            });
            continue;
        };
        let Some(title) = draft.title.as_deref().and_then(non_empty) else {
            out.dropped.push(ExtractionError::MissingTitle {
                page_url: page.url.clone(),
                index,
            });
            continue;
        };
        let absolute = match &base {
            Some(base) => base.join(&link).map(String::from).unwrap_or_else(|_| link.to_string()),
            None => link.to_string(),
        };
        let source_url = match identity.canonicalize(&absolute) {
            Ok(url) => url,
            Err(err) => {
                out.dropped.push(ExtractionError::BadLink {
                    page_url: page.url.clone(),
                    index,
                    reason: err.to_string(),
                });
                continue;
            }
        };
        if !seen.insert(source_url.clone()) {
            continue;
        }

        out.postings.push(Posting {
            posting_id: posting_id_for(&source_url),
            source_id: page.source_id.clone(),
            source_url,
            title,
            company: draft.company.as_deref().and_then(non_empty),
            locale: page.target.locale.clone(),
            query: page.target.query.clone(),
            location: draft.location.as_deref().and_then(non_empty),
            work_percentage: draft.work_percentage,
            posted_at: draft.posted_at,
            deadline: draft.deadline,
            description_text: draft.description.as_deref().map(normalize_whitespace).unwrap_or_default(),
            fetched_at: page.fetched_at,
        });
    }

    for err in &out.dropped {
        warn!(source = %page.source_id, error = %err, "listing dropped");
    }
    out
}

/// Extracts every page and collapses postings repeated across pages or targets.
pub fn extract_pages<'a>(
    registry: &SourceRegistry,
    pages: impl IntoIterator<Item = &'a RawPage>,
    identity: &IdentityRule,
) -> ExtractedPage {
    let mut seen = HashSet::new();
    let mut out = ExtractedPage::default();
    for page in pages {
        let Some(source) = registry.get(&page.source_id) else {
            out.dropped.push(ExtractionError::MalformedPage {
                page_url: page.url.clone(),
                reason: format!("no source registered for {}", page.source_id),
            });
            continue;
        };
        let extracted = source.extract(page, identity);
        out.dropped.extend(extracted.dropped);
        out.postings.extend(
            extracted
                .postings
                .into_iter()
                .filter(|p| seen.insert(p.source_url.clone())),
        );
    }
    out
}

fn non_empty(value: &str) -> Option<String> {
    let normalized = normalize_whitespace(value);
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

pub(crate) fn selector(css: &str, page: &RawPage) -> Result<Selector, ExtractionError> {
    Selector::parse(css).map_err(|e| ExtractionError::MalformedPage {
        page_url: page.url.clone(),
        reason: format!("selector {css}: {e}"),
    })
}

pub(crate) fn element_text(element: ElementRef<'_>) -> Option<String> {
    non_empty(&element.text().collect::<Vec<_>>().join(" "))
}

pub(crate) fn select_first_text(element: ElementRef<'_>, sel: &Selector) -> Option<String> {
    element.select(sel).find_map(element_text)
}

pub(crate) fn select_first_attr(element: ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    element
        .select(sel)
        .find_map(|n| n.value().attr(attr))
        .and_then(non_empty)
}

pub(crate) fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

pub(crate) fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_f64()
}

/// Leading `YYYY-MM-DD` of a date or timestamp string.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    NaiveDate::parse_from_str(text.get(..10)?, "%Y-%m-%d").ok()
}

/// Largest percentage in `text` within `(0, 100]`, so ranges such as `50-100 %` yield the
/// upper bound. Full-time wording without a figure counts as 100.
pub fn parse_work_percentage(text: &str) -> Option<f64> {
    let chars: Vec<char> = text.chars().collect();
    let mut best: Option<f64> = None;
    let mut i = 0;
    while i < chars.len() {
        if !chars[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let start = i;
        while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == ',') {
            i += 1;
        }
        let mut j = i;
        while j < chars.len() && chars[j].is_whitespace() {
            j += 1;
        }
        if chars.get(j) != Some(&'%') {
            continue;
        }
        let number: String = chars[start..i]
            .iter()
            .map(|c| if *c == ',' { '.' } else { *c })
            .collect();
        if let Ok(value) = number.trim_end_matches('.').parse::<f64>() {
            if value > 0.0 && value <= 100.0 {
                best = Some(best.map_or(value, |b| b.max(value)));
            }
        }
    }

    best.or_else(|| {
        let lower = text.to_lowercase();
        ["full-time", "full time", "heltid"]
            .iter()
            .any(|needle| lower.contains(needle))
            .then_some(100.0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(url: &str) -> RawPage {
        RawPage {
            source_id: "linkedin".to_string(),
            target: SearchTarget::new("linkedin", "rust", "Sweden"),
            page_index: 0,
            url: url.to_string(),
            content_type: Some("text/html".to_string()),
            body: Vec::new(),
            fetched_at: Utc::now(),
            archived_as: None,
        }
    }

    fn draft(link: Option<&str>, title: Option<&str>) -> ListingDraft {
        ListingDraft {
            link: link.map(str::to_string),
            title: title.map(str::to_string),
            ..ListingDraft::default()
        }
    }

    #[test]
    fn listings_without_link_or_title_are_dropped_alone() {
        let page = page("https://www.linkedin.com/jobs-guest/search?start=0");
        let drafts = vec![
            draft(Some("https://www.linkedin.com/jobs/view/1?trk=a"), Some("  Rust   Engineer ")),
            draft(None, Some("No link")),
            draft(Some("https://www.linkedin.com/jobs/view/2"), Some("   ")),
            draft(Some("/jobs/view/3/"), Some("Relative")),
        ];
        let out = assemble_postings(&page, drafts, &IdentityRule::default());

        assert_eq!(out.postings.len(), 2);
        assert_eq!(out.postings[0].source_url, "https://www.linkedin.com/jobs/view/1");
        assert_eq!(out.postings[0].title, "Rust Engineer");
        assert_eq!(out.postings[0].deadline, None);
        assert_eq!(out.postings[1].source_url, "https://www.linkedin.com/jobs/view/3");
        assert!(matches!(out.dropped[0], ExtractionError::MissingLink { index: 1, .. }));
        assert!(matches!(out.dropped[1], ExtractionError::MissingTitle { index: 2, .. }));
    }

    #[test]
    fn repeated_identity_within_a_page_is_collapsed() {
        let page = page("https://www.linkedin.com/jobs-guest/search");
        let drafts = vec![
            draft(Some("https://www.linkedin.com/jobs/view/1?refId=x"), Some("A")),
            draft(Some("https://WWW.linkedin.com/jobs/view/1/#apply"), Some("A again")),
        ];
        let out = assemble_postings(&page, drafts, &IdentityRule::default());
        assert_eq!(out.postings.len(), 1);
        assert_eq!(out.postings[0].title, "A");
        assert!(out.dropped.is_empty());
    }

    #[test]
    fn work_percentage_and_dates_are_parsed_leniently() {
        assert_eq!(parse_work_percentage("Deltid 50-80 %"), Some(80.0));
        assert_eq!(parse_work_percentage("Backend dev (75%)"), Some(75.0));
        assert_eq!(parse_work_percentage("Heltid, tillsvidare"), Some(100.0));
        assert_eq!(parse_work_percentage("Growth 300% YoY and 3 offices"), None);
        assert_eq!(parse_work_percentage("Engineer"), None);

        assert_eq!(parse_date("2026-10-15T00:00:00"), NaiveDate::from_ymd_opt(2026, 10, 15));
        assert_eq!(parse_date("2026-10-15"), NaiveDate::from_ymd_opt(2026, 10, 15));
        assert_eq!(parse_date("yesterday"), None);
    }

    #[test]
    fn registry_knows_the_builtin_sources() {
        let registry = SourceRegistry::with_defaults();
        assert_eq!(registry.ids(), vec![JOBTECH_SOURCE_ID, LINKEDIN_SOURCE_ID]);
        assert!(registry.get("unknown").is_none());
    }
}
