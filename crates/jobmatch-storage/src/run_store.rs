//! Append-only run persistence.
//!
//! Layout under the store root:
//!
//! ```text
//! <run_id>/run.json                         latest RunRecord snapshot while the run is live
//! <run_id>/results/<seq>-<posting_id>.json  one MatchResult per file, written atomically
//! <run_id>.json                             run document, written once when the run ends
//! ```
//!
//! A run is finalized once its run document exists; after that nothing under the run id
//! may change.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use jobmatch_core::{MatchResult, RunRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

use crate::{write_atomic, WriteOutcome};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed json at {path}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("run {0} already exists")]
    RunExists(Uuid),
    #[error("run {0} is finalized and can no longer be written")]
    RunFinalized(Uuid),
    #[error("run {0} not found")]
    RunNotFound(Uuid),
    #[error("run {run_id} cannot be finalized while {status:?}")]
    NotTerminal {
        run_id: Uuid,
        status: jobmatch_core::RunStatus,
    },
    #[error("result slot {path} is already taken")]
    DuplicateResult { path: PathBuf },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// The stable JSON document consumed by presentation layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDocument {
    pub schema_version: u32,
    pub run: RunRecord,
    pub results: Vec<MatchResult>,
}

pub const RUN_DOCUMENT_SCHEMA_VERSION: u32 = 1;

/// Minimal projection of a persisted result used to rebuild the dedup index.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ResultKey {
    pub source_url: String,
    pub profile_fingerprint: String,
    pub evaluated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    pub fn run_document_path(&self, run_id: Uuid) -> PathBuf {
        self.root.join(format!("{run_id}.json"))
    }

    fn record_path(&self, run_id: Uuid) -> PathBuf {
        self.run_dir(run_id).join("run.json")
    }

    fn results_dir(&self, run_id: Uuid) -> PathBuf {
        self.run_dir(run_id).join("results")
    }

    pub async fn is_finalized(&self, run_id: Uuid) -> Result<bool, StoreError> {
        let path = self.run_document_path(run_id);
        fs::try_exists(&path).await.map_err(io_err(&path))
    }

    async fn ensure_writable(&self, run_id: Uuid) -> Result<(), StoreError> {
        if self.is_finalized(run_id).await? {
            return Err(StoreError::RunFinalized(run_id));
        }
        Ok(())
    }

    /// Register a new run. Fails if the run id was used before.
    pub async fn begin_run(&self, record: &RunRecord) -> Result<(), StoreError> {
        let path = self.record_path(record.run_id);
        if fs::try_exists(&path).await.map_err(io_err(&path))? || self.is_finalized(record.run_id).await? {
            return Err(StoreError::RunExists(record.run_id));
        }
        let results_dir = self.results_dir(record.run_id);
        fs::create_dir_all(&results_dir).await.map_err(io_err(&results_dir))?;
        self.write_json(&path, record, false).await?;
        Ok(())
    }

    /// Replace the live snapshot of a run that has not been finalized.
    pub async fn save_run_record(&self, record: &RunRecord) -> Result<(), StoreError> {
        self.ensure_writable(record.run_id).await?;
        let path = self.record_path(record.run_id);
        self.write_json(&path, record, true).await
    }

    pub async fn load_run_record(&self, run_id: Uuid) -> Result<RunRecord, StoreError> {
        let document = self.run_document_path(run_id);
        if fs::try_exists(&document).await.map_err(io_err(&document))? {
            let doc: RunDocument = self.read_json(&document).await?;
            return Ok(doc.run);
        }
        let path = self.record_path(run_id);
        if !fs::try_exists(&path).await.map_err(io_err(&path))? {
            return Err(StoreError::RunNotFound(run_id));
        }
        self.read_json(&path).await
    }

    /// Persist one result. The file appears atomically; a crash mid-write leaves either the
    /// complete result or nothing.
    pub async fn append_result(&self, run_id: Uuid, seq: usize, result: &MatchResult) -> Result<PathBuf, StoreError> {
        self.ensure_writable(run_id).await?;
        let path = self
            .results_dir(run_id)
            .join(format!("{seq:06}-{}.json", result.posting.posting_id));
        let bytes = serde_json::to_vec_pretty(result).map_err(|source| StoreError::Serde {
            path: path.clone(),
            source,
        })?;
        match write_atomic(&path, &bytes, false).await.map_err(io_err(&path))? {
            WriteOutcome::Written => Ok(path),
            WriteOutcome::AlreadyPresent => Err(StoreError::DuplicateResult { path }),
        }
    }

    /// Results of one run in persistence order.
    pub async fn run_results(&self, run_id: Uuid) -> Result<Vec<MatchResult>, StoreError> {
        let mut out = Vec::new();
        for path in self.result_files(run_id).await? {
            match self.read_json::<MatchResult>(&path).await {
                Ok(result) => out.push(result),
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable result"),
            }
        }
        Ok(out)
    }

    async fn result_files(&self, run_id: Uuid) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.results_dir(run_id);
        if !fs::try_exists(&dir).await.map_err(io_err(&dir))? {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&dir).await.map_err(io_err(&dir))?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&dir))? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            files.push(entry.path());
        }
        files.sort();
        Ok(files)
    }

    /// Write the run document and the terminal record. The run is immutable afterwards.
    pub async fn finalize_run(&self, record: &RunRecord) -> Result<PathBuf, StoreError> {
        if !record.status.is_terminal() {
            return Err(StoreError::NotTerminal {
                run_id: record.run_id,
                status: record.status,
            });
        }
        self.ensure_writable(record.run_id).await?;

        let results = self.run_results(record.run_id).await?;
        let document = RunDocument {
            schema_version: RUN_DOCUMENT_SCHEMA_VERSION,
            run: record.clone(),
            results,
        };
        self.write_json(&self.record_path(record.run_id), record, true).await?;
        let path = self.run_document_path(record.run_id);
        self.write_json(&path, &document, false).await?;
        Ok(path)
    }

    pub async fn load_run_document(&self, run_id: Uuid) -> Result<RunDocument, StoreError> {
        let path = self.run_document_path(run_id);
        if !fs::try_exists(&path).await.map_err(io_err(&path))? {
            return Err(StoreError::RunNotFound(run_id));
        }
        self.read_json(&path).await
    }

    /// Every run id known to the store (live or finalized).
    pub async fn run_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        if !fs::try_exists(&self.root).await.map_err(io_err(&self.root))? {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&self.root).await.map_err(io_err(&self.root))?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&self.root))? {
            let is_dir = entry.file_type().await.map(|ft| ft.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            if let Ok(id) = Uuid::parse_str(&entry.file_name().to_string_lossy()) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Run records ordered newest first.
    pub async fn list_runs(&self) -> Result<Vec<RunRecord>, StoreError> {
        let mut runs = Vec::new();
        for run_id in self.run_ids().await? {
            match self.load_run_record(run_id).await {
                Ok(record) => runs.push(record),
                Err(err) => warn!(%run_id, error = %err, "skipping unreadable run record"),
            }
        }
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    pub(crate) async fn result_keys(&self) -> Result<Vec<ResultKey>, StoreError> {
        let mut keys = Vec::new();
        for run_id in self.run_ids().await? {
            for path in self.result_files(run_id).await? {
                match self.read_json::<ResultKey>(&path).await {
                    Ok(key) => keys.push(key),
                    Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable result"),
                }
            }
        }
        Ok(keys)
    }

    /// Latest result per (source_url, profile_fingerprint) across the whole history.
    pub async fn latest_results(&self, profile_fingerprint: &str) -> Result<Vec<MatchResult>, StoreError> {
        let mut latest: HashMap<String, MatchResult> = HashMap::new();
        for run_id in self.run_ids().await? {
            for result in self.run_results(run_id).await? {
                if result.profile_fingerprint != profile_fingerprint {
                    continue;
                }
                match latest.get(&result.posting.source_url) {
                    Some(existing) if existing.evaluated_at >= result.evaluated_at => {}
                    _ => {
                        latest.insert(result.posting.source_url.clone(), result);
                    }
                }
            }
        }
        let mut out: Vec<_> = latest.into_values().collect();
        out.sort_by(|a, b| b.final_score.cmp(&a.final_score).then(a.posting.source_url.cmp(&b.posting.source_url)));
        Ok(out)
    }

    async fn write_json<T: Serialize>(&self, path: &Path, value: &T, overwrite: bool) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serde {
            path: path.to_path_buf(),
            source,
        })?;
        write_atomic(path, &bytes, overwrite).await.map_err(io_err(path))?;
        Ok(())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<T, StoreError> {
        let bytes = fs::read(path).await.map_err(io_err(path))?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Serde {
            path: path.to_path_buf(),
            source,
        })
    }
}
