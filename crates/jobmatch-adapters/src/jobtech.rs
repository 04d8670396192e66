use jobmatch_core::SearchTarget;
use serde_json::Value as JsonValue;
use url::form_urlencoded;

use crate::{
    json_f64, json_str, parse_date, parse_work_percentage, ExtractionError, ListingDraft, PayloadKind, PostingSource,
    RawPage,
};

pub const JOBTECH_SOURCE_ID: &str = "jobtech";

const SEARCH_URL: &str = "https://jobsearch.api.jobtechdev.se/search";
const AD_URL_PREFIX: &str = "https://arbetsformedlingen.se/platsbanken/annonser/";

/// JobTech JobSearch API (Platsbanken ads), paginated with `offset`/`limit`.
#[derive(Debug, Clone)]
pub struct JobTechSearchSource {
    base_url: String,
    page_size: usize,
}

impl Default for JobTechSearchSource {
    fn default() -> Self {
        Self {
            base_url: SEARCH_URL.to_string(),
            page_size: 25,
        }
    }
}

/// The API is Sweden-only, so a country-level locale adds nothing to the free-text query.
fn is_country_locale(locale: &str) -> bool {
    matches!(locale.trim().to_lowercase().as_str(), "" | "se" | "sweden" | "sverige")
}

fn hit_to_draft(hit: &JsonValue) -> ListingDraft {
    let link = json_str(hit, &["webpage_url"]).map(str::to_string).or_else(|| {
        json_str(hit, &["id"])
            .filter(|id| !id.trim().is_empty())
            .map(|id| format!("{AD_URL_PREFIX}{}", id.trim()))
    });

    let work_percentage = json_f64(hit, &["scope_of_work", "max"])
        .or_else(|| json_f64(hit, &["scope_of_work", "min"]))
        .filter(|v| *v > 0.0 && *v <= 100.0)
        .or_else(|| json_str(hit, &["working_hours_type", "label"]).and_then(parse_work_percentage));

    ListingDraft {
        link,
        title: json_str(hit, &["headline"]).map(str::to_string),
        company: json_str(hit, &["employer", "name"]).map(str::to_string),
        location: json_str(hit, &["workplace_address", "municipality"])
            .or_else(|| json_str(hit, &["workplace_address", "region"]))
            .map(str::to_string),
        work_percentage,
        posted_at: json_str(hit, &["publication_date"]).and_then(parse_date),
        deadline: json_str(hit, &["application_deadline"]).and_then(parse_date),
        description: json_str(hit, &["description", "text"]).map(str::to_string),
    }
}

impl PostingSource for JobTechSearchSource {
    fn source_id(&self) -> &'static str {
        JOBTECH_SOURCE_ID
    }

    fn payload_kind(&self) -> PayloadKind {
        PayloadKind::Json
    }

    fn page_url(&self, target: &SearchTarget, page_index: usize) -> String {
        let q = if is_country_locale(&target.locale) {
            target.query.clone()
        } else {
            format!("{} {}", target.query, target.locale.trim())
        };
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("q", &q)
            .append_pair("offset", &(page_index * self.page_size).to_string())
            .append_pair("limit", &self.page_size.to_string())
            .finish();
        format!("{}?{}", self.base_url, query)
    }

    fn listings(&self, page: &RawPage) -> Result<Vec<ListingDraft>, ExtractionError> {
        let value: JsonValue = serde_json::from_slice(&page.body).map_err(|e| ExtractionError::MalformedPage {
            page_url: page.url.clone(),
            reason: format!("invalid JSON: {e}"),
        })?;
        let hits = match value.get("hits") {
            None | Some(JsonValue::Null) => return Ok(Vec::new()),
            Some(JsonValue::Array(hits)) => hits,
            Some(_) => {
                return Err(ExtractionError::MalformedPage {
                    page_url: page.url.clone(),
                    reason: "`hits` is not an array".to_string(),
                })
            }
        };
        Ok(hits.iter().map(hit_to_draft).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use serde_json::json;

    fn page(body: &JsonValue) -> RawPage {
        RawPage {
            source_id: JOBTECH_SOURCE_ID.to_string(),
            target: SearchTarget::new(JOBTECH_SOURCE_ID, "rust", "Sweden"),
            page_index: 0,
            url: "https://jobsearch.api.jobtechdev.se/search?q=rust&offset=0&limit=25".to_string(),
            content_type: Some("application/json".to_string()),
            body: serde_json::to_vec(body).unwrap(),
            fetched_at: Utc::now(),
            archived_as: None,
        }
    }

    #[test]
    fn page_urls_use_offset_pagination_and_city_locales() {
        let source = JobTechSearchSource::default();
        let national = source.page_url(&SearchTarget::new(JOBTECH_SOURCE_ID, "rust", "Sweden"), 0);
        assert_eq!(national, "https://jobsearch.api.jobtechdev.se/search?q=rust&offset=0&limit=25");

        let city = source.page_url(&SearchTarget::new(JOBTECH_SOURCE_ID, "rust", "Malmö"), 3);
        assert!(city.contains("q=rust+Malm%C3%B6"));
        assert!(city.contains("offset=75"));
    }

    #[test]
    fn hits_map_to_drafts_with_missing_fields_left_empty() {
        let body = json!({
            "total": {"value": 2},
            "hits": [
                {
                    "id": "29000001",
                    "webpage_url": "https://arbetsformedlingen.se/platsbanken/annonser/29000001",
                    "headline": "Systemutvecklare",
                    "employer": {"name": "Nordbank AB"},
                    "workplace_address": {"municipality": "Stockholm"},
                    "publication_date": "2026-10-12T08:00:00",
                    "application_deadline": "2026-11-01T23:59:59",
                    "scope_of_work": {"min": 100, "max": 100},
                    "description": {"text": "Vi söker en utvecklare med Rust."}
                },
                {"id": "29000002", "headline": "Deltidsjobb", "working_hours_type": {"label": "Deltid 50 %"}}
            ]
        });
        let drafts = JobTechSearchSource::default().listings(&page(&body)).unwrap();
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].deadline, NaiveDate::from_ymd_opt(2026, 11, 1));
        assert_eq!(drafts[0].work_percentage, Some(100.0));
        assert_eq!(drafts[0].company.as_deref(), Some("Nordbank AB"));

        assert_eq!(
            drafts[1].link.as_deref(),
            Some("https://arbetsformedlingen.se/platsbanken/annonser/29000002")
        );
        assert_eq!(drafts[1].deadline, None);
        assert_eq!(drafts[1].description, None);
        assert_eq!(drafts[1].work_percentage, Some(50.0));
    }

    #[test]
    fn empty_and_malformed_payloads() {
        let source = JobTechSearchSource::default();
        assert!(source.is_exhausted(&page(&json!({"hits": []}))));

        let mut broken = page(&json!({}));
        broken.body = b"<html>gateway error</html>".to_vec();
        assert!(matches!(
            source.listings(&broken),
            Err(ExtractionError::MalformedPage { .. })
        ));
        assert!(source.is_exhausted(&broken));
    }
}
