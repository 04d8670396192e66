use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use jobmatch_core::{Category, MatchResult, RunRecord};
use jobmatch_storage::{sha256_hex, RunStore};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use tokio::fs;

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn strings<'a>(results: &'a [MatchResult], f: impl Fn(&'a MatchResult) -> Option<String>) -> StringArray {
    StringArray::from(results.iter().map(f).collect::<Vec<_>>())
}

pub fn write_matches_parquet(path: &Path, results: &[MatchResult]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("posting_id", DataType::Utf8, false),
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("source_url", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("company", DataType::Utf8, true),
        ArrowField::new("locale", DataType::Utf8, false),
        ArrowField::new("query", DataType::Utf8, false),
        ArrowField::new("location", DataType::Utf8, true),
        ArrowField::new("work_percentage", DataType::Float64, true),
        ArrowField::new("posted_at", DataType::Utf8, true),
        ArrowField::new("deadline", DataType::Utf8, true),
        ArrowField::new("profile_fingerprint", DataType::Utf8, false),
        ArrowField::new("embed_score", DataType::Float64, false),
        ArrowField::new("llm_confidence", DataType::UInt32, true),
        ArrowField::new("llm_label", DataType::Utf8, true),
        ArrowField::new("llm_explanation", DataType::Utf8, true),
        ArrowField::new("final_score", DataType::UInt32, false),
        ArrowField::new("category", DataType::Utf8, false),
        ArrowField::new("evaluated_at", DataType::Utf8, false),
    ]));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(strings(results, |r| Some(r.posting.posting_id.to_string()))),
            Arc::new(strings(results, |r| Some(r.posting.source_id.clone()))),
            Arc::new(strings(results, |r| Some(r.posting.source_url.clone()))),
            Arc::new(strings(results, |r| Some(r.posting.title.clone()))),
            Arc::new(strings(results, |r| r.posting.company.clone())),
            Arc::new(strings(results, |r| Some(r.posting.locale.clone()))),
            Arc::new(strings(results, |r| Some(r.posting.query.clone()))),
            Arc::new(strings(results, |r| r.posting.location.clone())),
            Arc::new(Float64Array::from(
                results.iter().map(|r| r.posting.work_percentage).collect::<Vec<_>>(),
            )),
            Arc::new(strings(results, |r| r.posting.posted_at.map(|d| d.to_string()))),
            Arc::new(strings(results, |r| r.posting.deadline.map(|d| d.to_string()))),
            Arc::new(strings(results, |r| Some(r.profile_fingerprint.clone()))),
            Arc::new(Float64Array::from(results.iter().map(|r| r.embed_score).collect::<Vec<_>>())),
            Arc::new(UInt32Array::from(
                results
                    .iter()
                    .map(|r| r.llm_confidence().map(u32::from))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(strings(results, |r| r.llm_label().map(|l| l.as_str().to_string()))),
            Arc::new(strings(results, |r| r.llm_explanation().map(ToString::to_string))),
            Arc::new(UInt32Array::from(
                results.iter().map(|r| u32::from(r.final_score)).collect::<Vec<_>>(),
            )),
            Arc::new(strings(results, |r| Some(r.category.as_str().to_string()))),
            Arc::new(strings(results, |r| Some(r.evaluated_at.to_rfc3339()))),
        ],
    )
    .context("building matches record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, base: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path.strip_prefix(base).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
        rows,
    })
}

/// Writes `snapshots/matches.parquet` and `snapshots/manifest.json` under `run_dir`.
pub async fn export_run_snapshot(run_dir: &Path, results: &[MatchResult]) -> Result<PathBuf> {
    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let matches_path = snapshot_dir.join("matches.parquet");
    let base = run_dir.to_path_buf();
    let rows = results.to_vec();
    let entry = tokio::task::spawn_blocking(move || {
        write_matches_parquet(&matches_path, &rows)?;
        manifest_entry("matches", &base, &matches_path, rows.len())
    })
    .await
    .context("parquet export worker failed")??;

    let manifest = ParquetManifest {
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        files: vec![entry],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn run_section(record: &RunRecord, results: &[MatchResult]) -> Vec<String> {
    let mut histogram: BTreeMap<Category, usize> = Category::ALL.iter().map(|c| (*c, 0)).collect();
    for result in results {
        *histogram.entry(result.category).or_default() += 1;
    }
    let fallbacks = results.iter().filter(|r| r.is_fallback()).count();

    let mut lines = vec![
        format!("## Run `{}`", record.run_id),
        format!("- status: {:?}", record.status),
        format!("- started: {}", record.started_at.to_rfc3339()),
        format!(
            "- ended: {}",
            record.ended_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "running".to_string())
        ),
        format!(
            "- postings: {} seen, {} new, {} scored ({} embedding-only)",
            record.postings_seen,
            record.postings_new,
            results.len(),
            fallbacks
        ),
        format!("- failed pages: {}", record.pages_failed),
        format!("- errors: {}", record.errors.len()),
        "- categories:".to_string(),
    ];
    lines.extend(histogram.iter().map(|(category, count)| format!("  - {category}: {count}")));
    if let Some(best) = results.iter().max_by_key(|r| r.final_score) {
        lines.push(format!(
            "- top match: {} ({}) {}",
            best.posting.title, best.final_score, best.posting.source_url
        ));
    }
    lines.push(String::new());
    lines
}

/// Markdown summary of the `runs` most recent runs, newest first.
pub async fn report_markdown(store: &RunStore, runs: usize) -> Result<String> {
    let records = store.list_runs().await.context("listing runs")?;
    let mut lines = vec!["# Job Match Report".to_string(), String::new()];
    if records.is_empty() {
        lines.push("No runs recorded yet.".to_string());
    }
    for record in records.into_iter().take(runs.max(1)) {
        let results = store
            .run_results(record.run_id)
            .await
            .with_context(|| format!("reading results of run {}", record.run_id))?;
        lines.extend(run_section(&record, &results));
    }
    Ok(lines.join("\n"))
}
