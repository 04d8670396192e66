use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use jobmatch_core::Posting;
use tracing::debug;

use crate::run_store::{RunStore, StoreError};

/// Persistent `(source_url, profile_fingerprint) -> evaluated_at` index.
///
/// The index is rebuilt from run-store history at run start, so anything persisted by an
/// earlier (possibly crashed) run counts as scored.
#[derive(Debug, Default, Clone)]
pub struct DedupStore {
    seen: HashMap<String, HashMap<String, DateTime<Utc>>>,
}

impl DedupStore {
    pub async fn load(store: &RunStore) -> Result<Self, StoreError> {
        let mut dedup = Self::default();
        for key in store.result_keys().await? {
            dedup.mark_scored(&key.source_url, &key.profile_fingerprint, key.evaluated_at);
        }
        debug!(pairs = dedup.len(), "dedup index loaded");
        Ok(dedup)
    }

    pub fn last_evaluated(&self, source_url: &str, profile_fingerprint: &str) -> Option<DateTime<Utc>> {
        self.seen
            .get(profile_fingerprint)
            .and_then(|urls| urls.get(source_url))
            .copied()
    }

    pub fn is_scored(&self, source_url: &str, profile_fingerprint: &str) -> bool {
        self.last_evaluated(source_url, profile_fingerprint).is_some()
    }

    pub fn mark_scored(&mut self, source_url: &str, profile_fingerprint: &str, evaluated_at: DateTime<Utc>) {
        let entry = self
            .seen
            .entry(profile_fingerprint.to_string())
            .or_default()
            .entry(source_url.to_string())
            .or_insert(evaluated_at);
        if evaluated_at > *entry {
            *entry = evaluated_at;
        }
    }

    /// Postings that still need scoring for `profile_fingerprint`. `force` re-admits
    /// everything. Repeated URLs inside `postings` are collapsed to their first occurrence.
    pub fn filter_unscored(&self, postings: Vec<Posting>, profile_fingerprint: &str, force: bool) -> Vec<Posting> {
        let mut emitted = HashSet::new();
        postings
            .into_iter()
            .filter(|p| force || !self.is_scored(&p.source_url, profile_fingerprint))
            .filter(|p| emitted.insert(p.source_url.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.seen.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
