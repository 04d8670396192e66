use std::path::Path;

use anyhow::{bail, Context, Result};
use jobmatch_core::SearchTarget;
use serde::Deserialize;
use tokio::fs;

/// Per-country query list, loaded from `searches.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchPlan {
    pub searches: Vec<SearchPlanEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchPlanEntry {
    pub source_id: String,
    pub locale: String,
    pub queries: Vec<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl SearchPlan {
    pub fn parse(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing search plan")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Enabled (source, query, locale) triples in file order.
    pub fn targets(&self) -> Vec<SearchTarget> {
        self.searches
            .iter()
            .filter(|entry| entry.enabled)
            .flat_map(|entry| {
                entry
                    .queries
                    .iter()
                    .map(|query| query.trim())
                    .filter(|query| !query.is_empty())
                    .map(|query| SearchTarget::new(entry.source_id.as_str(), query, entry.locale.trim()))
            })
            .collect()
    }
}

/// Parses a `query@locale` command-line search.
pub fn parse_search_arg(source_id: &str, arg: &str) -> Result<SearchTarget> {
    let Some((query, locale)) = arg.rsplit_once('@') else {
        bail!("search {arg:?} must look like query@locale");
    };
    let (query, locale) = (query.trim(), locale.trim());
    if query.is_empty() || locale.is_empty() {
        bail!("search {arg:?} needs both a query and a locale");
    }
    Ok(SearchTarget::new(source_id, query, locale))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"
searches:
  - source_id: linkedin
    locale: Sweden
    queries: ["rust engineer", "  ", "platform engineer"]
  - source_id: jobtech
    locale: Göteborg
    queries: [backend]
  - source_id: linkedin
    locale: Norway
    queries: [rust]
    enabled: false
"#;

    #[test]
    fn enabled_entries_expand_to_targets() {
        let plan = SearchPlan::parse(PLAN).unwrap();
        let targets: Vec<String> = plan.targets().iter().map(ToString::to_string).collect();
        assert_eq!(
            targets,
            vec![
                "linkedin:rust engineer@Sweden",
                "linkedin:platform engineer@Sweden",
                "jobtech:backend@Göteborg",
            ]
        );
    }

    #[test]
    fn search_args_split_on_the_last_at_sign() {
        let target = parse_search_arg("linkedin", "c++ @ team@Stockholm").unwrap();
        assert_eq!(target.query, "c++ @ team");
        assert_eq!(target.locale, "Stockholm");
        assert!(parse_search_arg("linkedin", "rust").is_err());
        assert!(parse_search_arg("linkedin", "@Sweden").is_err());
    }

    #[tokio::test]
    async fn missing_plan_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = SearchPlan::load(&dir.path().join("searches.yaml")).await.unwrap_err();
        assert!(format!("{err:#}").contains("searches.yaml"));
    }
}
