use jobmatch_core::{Posting, SearchTarget};
use scraper::{Html, Selector};
use url::{form_urlencoded, Url};

use crate::{
    element_text, parse_date, parse_work_percentage, select_first_attr, select_first_text, selector, ExtractionError,
    ListingDraft, PayloadKind, PostingSource, RawPage,
};

pub const LINKEDIN_SOURCE_ID: &str = "linkedin";

const GUEST_SEARCH_URL: &str = "https://www.linkedin.com/jobs-guest/jobs/api/seeMoreJobPostings/search";
const GUEST_POSTING_URL: &str = "https://www.linkedin.com/jobs-guest/jobs/api/jobPosting";
/// Description containers on a guest posting page, most specific first.
const DESCRIPTION_SELECTORS: &[&str] = &[
    ".show-more-less-html__markup",
    ".description__text",
    "#job-details",
    "article",
];
const PAGE_SIZE: usize = 25;

/// LinkedIn's unauthenticated job-search listing fragments (one `<li>` card per posting).
#[derive(Debug, Clone)]
pub struct LinkedInGuestSource {
    base_url: String,
    /// `f_TPR` recency filter; `r86400` limits results to the last 24 hours.
    posted_within: Option<String>,
    posting_url: String,
}

impl Default for LinkedInGuestSource {
    fn default() -> Self {
        Self {
            base_url: GUEST_SEARCH_URL.to_string(),
            posted_within: Some("r86400".to_string()),
            posting_url: GUEST_POSTING_URL.to_string(),
        }
    }
}

impl PostingSource for LinkedInGuestSource {
    fn source_id(&self) -> &'static str {
        LINKEDIN_SOURCE_ID
    }

    fn payload_kind(&self) -> PayloadKind {
        PayloadKind::Html
    }

    fn page_url(&self, target: &SearchTarget, page_index: usize) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query
            .append_pair("keywords", &target.query)
            .append_pair("location", &target.locale);
        if let Some(tpr) = &self.posted_within {
            query.append_pair("f_TPR", tpr);
        }
        query.append_pair("start", &(page_index * PAGE_SIZE).to_string());
        format!("{}?{}", self.base_url, query.finish())
    }

    fn listings(&self, page: &RawPage) -> Result<Vec<ListingDraft>, ExtractionError> {
        let card_sel = selector("div.base-card, div.job-search-card, a.base-card", page)?;
        let link_sel = selector("a.base-card__full-link[href], a[href*='/jobs/view/']", page)?;
        let title_sel = selector("h3.base-search-card__title", page)?;
        let hidden_title_sel = selector(".base-card__full-link .sr-only", page)?;
        let company_sel = selector("h4.base-search-card__subtitle", page)?;
        let location_sel = selector(".job-search-card__location", page)?;
        let time_sel = selector("time[datetime]", page)?;
        let snippet_sel = selector(".job-search-card__snippet", page)?;

        let document = Html::parse_document(&page.text());
        let drafts = document
            .select(&card_sel)
            .map(|card| {
                let link = if card.value().name() == "a" {
                    card.value().attr("href").map(str::to_string)
                } else {
                    select_first_attr(card, &link_sel, "href")
                };
                let card_text = element_text(card).unwrap_or_default();
                ListingDraft {
                    link,
                    title: select_first_text(card, &title_sel).or_else(|| select_first_text(card, &hidden_title_sel)),
                    company: select_first_text(card, &company_sel),
                    location: select_first_text(card, &location_sel),
                    work_percentage: parse_work_percentage(&card_text),
                    posted_at: select_first_attr(card, &time_sel, "datetime").and_then(|d| parse_date(&d)),
                    deadline: None,
                    description: select_first_text(card, &snippet_sel),
                }
            })
            .collect();
        Ok(drafts)
    }

    fn detail_url(&self, posting: &Posting) -> Option<String> {
        job_id(&posting.source_url).map(|id| format!("{}/{id}", self.posting_url))
    }

    fn parse_detail(&self, body: &str) -> Option<String> {
        let document = Html::parse_document(body);
        DESCRIPTION_SELECTORS.iter().find_map(|css| {
            let sel = Selector::parse(css).ok()?;
            document.select(&sel).find_map(element_text)
        })
    }
}

/// Numeric job id from a `/jobs/view/<slug>-<id>` or `/jobs/view/<id>` URL.
fn job_id(source_url: &str) -> Option<String> {
    let url = Url::parse(source_url).ok()?;
    let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
    if segments.next()? != "jobs" || segments.next()? != "view" {
        return None;
    }
    let slug = segments.next()?;
    let id = slug.rsplit('-').next()?;
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit())).then(|| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    fn page(body: &str) -> RawPage {
        RawPage {
            source_id: LINKEDIN_SOURCE_ID.to_string(),
            target: SearchTarget::new(LINKEDIN_SOURCE_ID, "data engineer", "Stockholm, Sweden"),
            page_index: 0,
            url: "https://www.linkedin.com/jobs-guest/jobs/api/seeMoreJobPostings/search?start=0".to_string(),
            content_type: Some("text/html".to_string()),
            body: body.as_bytes().to_vec(),
            fetched_at: Utc::now(),
            archived_as: None,
        }
    }

    fn sample_posting(url: &str) -> Posting {
        Posting {
            posting_id: jobmatch_core::posting_id_for(url),
            source_id: LINKEDIN_SOURCE_ID.to_string(),
            source_url: url.to_string(),
            title: "Senior Rust Engineer".to_string(),
            company: None,
            locale: "Sweden".to_string(),
            query: "rust".to_string(),
            location: None,
            work_percentage: None,
            posted_at: None,
            deadline: None,
            description_text: String::new(),
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn page_urls_paginate_by_card_count() {
        let source = LinkedInGuestSource::default();
        let target = SearchTarget::new(LINKEDIN_SOURCE_ID, "rust developer", "Göteborg");
        let url = source.page_url(&target, 2);
        assert!(url.starts_with(GUEST_SEARCH_URL));
        assert!(url.contains("keywords=rust+developer"));
        assert!(url.contains("location=G%C3%B6teborg"));
        assert!(url.contains("f_TPR=r86400"));
        assert!(url.ends_with("start=50"));
    }

    #[test]
    fn cards_with_partial_fields_still_extract() {
        let html = r#"
            <li><div class="base-card job-search-card">
              <a class="base-card__full-link" href="https://se.linkedin.com/jobs/view/backend-42?refId=abc">
                <span class="sr-only">Backend Engineer</span></a>
              <h3 class="base-search-card__title">Backend Engineer 80%</h3>
              <time class="job-search-card__listdate" datetime="2026-10-14">2 days ago</time>
            </div></li>"#;
        let drafts = LinkedInGuestSource::default().listings(&page(html)).unwrap();
        assert_eq!(drafts.len(), 1);
        let d = &drafts[0];
        assert_eq!(d.title.as_deref(), Some("Backend Engineer 80%"));
        assert_eq!(d.company, None);
        assert_eq!(d.location, None);
        assert_eq!(d.work_percentage, Some(80.0));
        assert_eq!(d.posted_at, NaiveDate::from_ymd_opt(2026, 10, 14));
    }

    #[test]
    fn detail_url_uses_the_trailing_job_id() {
        let source = LinkedInGuestSource::default();
        let mut posting = sample_posting("https://se.linkedin.com/jobs/view/senior-rust-engineer-at-nordlys-4012345601");
        assert_eq!(
            source.detail_url(&posting).as_deref(),
            Some("https://www.linkedin.com/jobs-guest/jobs/api/jobPosting/4012345601")
        );
        posting.source_url = "https://www.linkedin.com/jobs/view/3901".to_string();
        assert!(source.detail_url(&posting).unwrap().ends_with("/jobPosting/3901"));
        posting.source_url = "https://www.linkedin.com/company/nordlys".to_string();
        assert_eq!(source.detail_url(&posting), None);
    }

    #[test]
    fn detail_description_prefers_the_markup_block() {
        let source = LinkedInGuestSource::default();
        let html = r#"<section class="description">
            <div class="description__text"><div class="show-more-less-html__markup">
              <p>We build <strong>Rust</strong> services.</p><ul><li>Kubernetes</li></ul>
            </div><button>Show more</button></div></section>"#;
        assert_eq!(
            source.parse_detail(html).as_deref(),
            Some("We build Rust services. Kubernetes")
        );
        assert_eq!(source.parse_detail("<html><body><p>Sign in</p></body></html>"), None);
    }

    #[test]
    fn page_without_cards_is_exhausted() {
        let source = LinkedInGuestSource::default();
        assert!(source.is_exhausted(&page("")));
        assert!(source.is_exhausted(&page("<html><body><p>No more jobs</p></body></html>")));
    }
}
