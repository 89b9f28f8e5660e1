//! File-backed staging store: an `Uploader` that appends NDJSON under `incoming/`, and a
//! `ReconciliationService` that materializes staged files into `final/` on a background thread.
//!
//! Layout under the staging root:
//! - `incoming/<file>.ndjson`: rows as sent, in completion order, possibly with duplicates
//!   left by partially applied chunk uploads
//! - `final/<file>.ndjson`: one line per row id
//! - `summary.json`: written by the rollup

use crate::date::parse_canonical;
use crate::ndjson::{count_records, NdjsonReader, NdjsonWriter};
use crate::reconcile::{ReconcileHandle, ReconciliationService};
use crate::scheduler::{UploadContext, Uploader};
use crate::util::{create_with_backoff, replace_file_atomic_backoff};
use crate::validate::Row;
use ahash::AHashSet;
use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use walkdir::WalkDir;

/// One staged line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StagedRow {
    pub schema: String,
    pub file: String,
    pub line: u64,
    pub row_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub fields: BTreeMap<String, String>,
}

pub fn incoming_dir(root: &Path) -> PathBuf {
    root.join("incoming")
}

pub fn final_dir(root: &Path) -> PathBuf {
    root.join("final")
}

pub fn summary_path(root: &Path) -> PathBuf {
    root.join("summary.json")
}

/// `*.ndjson` files directly under `dir`, sorted by name. A missing directory yields nothing.
fn staged_files(dir: &Path) -> Vec<PathBuf> {
    if !dir.exists() {
        return Vec::new();
    }
    let mut out: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().map_or(false, |x| x == "ndjson"))
        .collect();
    out.sort();
    out
}

// ----------------------------- Uploader ----------------------------------

/// Appends every sent row to `incoming/<file>.ndjson`. One writer per source file, flushed per call.
pub struct NdjsonStagingUploader {
    root: PathBuf,
    writers: Mutex<HashMap<String, NdjsonWriter>>,
}

impl NdjsonStagingUploader {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let incoming = incoming_dir(&root);
        fs::create_dir_all(&incoming).with_context(|| format!("create {}", incoming.display()))?;
        Ok(Self { root, writers: Mutex::new(HashMap::new()) })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Uploader for NdjsonStagingUploader {
    fn send(&self, ctx: &UploadContext, rows: &[Row]) -> Result<()> {
        let mut writers = self.writers.lock();
        if !writers.contains_key(&ctx.file_name) {
            let path = incoming_dir(&self.root).join(format!("{}.ndjson", ctx.file_name));
            let w = NdjsonWriter::append(&path, 64 * 1024).with_context(|| format!("open {}", path.display()))?;
            writers.insert(ctx.file_name.clone(), w);
        }
        let w = writers
            .get_mut(&ctx.file_name)
            .ok_or_else(|| anyhow!("no staging writer for {}", ctx.file_name))?;
        for row in rows {
            w.write_value(&StagedRow {
                schema: ctx.schema.clone(),
                file: ctx.file_name.clone(),
                line: row.line,
                row_id: row.id.to_string(),
                labels: ctx.labels.clone(),
                fields: row.fields.clone(),
            })?;
        }
        w.flush().with_context(|| format!("flush {}", w.path().display()))?;
        Ok(())
    }
}

// ----------------------------- Reconciler ----------------------------------

#[derive(Default)]
struct RunState {
    percent: AtomicU8,
    error: Mutex<Option<String>>,
}

/// Derived bounds over the materialized rows.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingSummary {
    pub schema: String,
    pub files: usize,
    pub rows: u64,
    pub date_min: Option<String>,
    pub date_max: Option<String>,
}

pub struct StagingReconciler {
    root: PathBuf,
    next_id: AtomicU64,
    runs: Mutex<HashMap<String, Arc<RunState>>>,
}

impl StagingReconciler {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self { root: root.as_ref().to_path_buf(), next_id: AtomicU64::new(1), runs: Mutex::new(HashMap::new()) }
    }

    pub fn read_summary(&self) -> Result<StagingSummary> {
        let path = summary_path(&self.root);
        let text = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Copy `src` to `dest` keeping the first line seen for each row id.
fn materialize(src: &Path, dest: &Path) -> Result<u64> {
    let tmp = dest.with_extension("ndjson.tmp");
    let mut w = NdjsonWriter::create(&tmp, 256 * 1024).with_context(|| format!("create {}", tmp.display()))?;
    let mut seen = AHashSet::new();
    let mut kept = 0u64;
    NdjsonReader::open(src, 256 * 1024)
        .with_context(|| format!("open {}", src.display()))?
        .for_each_line(|line| {
            let row: StagedRow = serde_json::from_str(line).with_context(|| format!("parse {}", src.display()))?;
            if seen.insert(row.row_id) {
                w.write_line(line)?;
                kept += 1;
            }
            Ok(())
        })?;
    w.finish_atomic(dest)?;
    Ok(kept)
}

fn reconcile_all(root: &Path, state: &RunState) -> Result<()> {
    let files = staged_files(&incoming_dir(root));
    let out = final_dir(root);
    fs::create_dir_all(&out).with_context(|| format!("create {}", out.display()))?;
    let n = files.len().max(1);
    for (i, src) in files.iter().enumerate() {
        let name = src.file_name().ok_or_else(|| anyhow!("bad staged path {}", src.display()))?;
        let kept = materialize(src, &out.join(name))?;
        tracing::debug!(file = %src.display(), kept, "staged file materialized");
        // 100 is only reported once every file is in place.
        state.percent.store((((i + 1) * 100) / n).min(99) as u8, Ordering::SeqCst);
    }
    state.percent.store(100, Ordering::SeqCst);
    Ok(())
}

impl ReconciliationService for StagingReconciler {
    fn staged_rows(&self, _schema: &str) -> Result<u64> {
        staged_files(&incoming_dir(&self.root)).iter().map(|p| count_records(p)).sum()
    }

    fn trigger(&self, schema: &str) -> Result<ReconcileHandle> {
        let id = format!("{schema}-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let state = Arc::new(RunState::default());
        self.runs.lock().insert(id.clone(), state.clone());
        let root = self.root.clone();
        std::thread::Builder::new()
            .name(format!("reconcile-{id}"))
            .spawn(move || {
                if let Err(e) = reconcile_all(&root, &state) {
                    tracing::error!("staging reconciliation failed: {e:#}");
                    *state.error.lock() = Some(format!("{e:#}"));
                }
            })
            .context("spawn reconciliation thread")?;
        Ok(ReconcileHandle(id))
    }

    fn poll(&self, handle: &ReconcileHandle) -> Result<u8> {
        let state = self
            .runs
            .lock()
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| anyhow!("unknown reconciliation {}", handle.0))?;
        if let Some(e) = state.error.lock().as_ref() {
            return Err(anyhow!("reconciliation {} failed: {e}", handle.0));
        }
        Ok(state.percent.load(Ordering::SeqCst))
    }

    /// Scan `final/` in parallel and write `summary.json` with the row count and the
    /// min/max of every `YYYY-MM-DD` field value.
    fn rollup(&self, schema: &str) -> Result<()> {
        let files = staged_files(&final_dir(&self.root));
        let per_file: Vec<(u64, Option<String>, Option<String>)> = files
            .par_iter()
            .map(|path| -> Result<(u64, Option<String>, Option<String>)> {
                let (mut rows, mut lo, mut hi) = (0u64, None::<String>, None::<String>);
                NdjsonReader::open(path, 256 * 1024)
                    .with_context(|| format!("open {}", path.display()))?
                    .for_each_line(|line| {
                        let row: StagedRow = serde_json::from_str(line)?;
                        rows += 1;
                        for v in row.fields.values().filter(|v| parse_canonical(v).is_some()) {
                            if lo.as_deref().map_or(true, |l| v.as_str() < l) {
                                lo = Some(v.clone());
                            }
                            if hi.as_deref().map_or(true, |h| v.as_str() > h) {
                                hi = Some(v.clone());
                            }
                        }
                        Ok(())
                    })?;
                Ok((rows, lo, hi))
            })
            .collect::<Result<_>>()?;

        let mut summary = StagingSummary { schema: schema.to_string(), files: files.len(), ..Default::default() };
        for (rows, lo, hi) in per_file {
            summary.rows += rows;
            summary.date_min = match (summary.date_min.take(), lo) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            summary.date_max = match (summary.date_max.take(), hi) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
        }

        let dest = summary_path(&self.root);
        let tmp = dest.with_extension("json.tmp");
        {
            let f = create_with_backoff(&tmp, 16, 50).with_context(|| format!("create {}", tmp.display()))?;
            let mut w = BufWriter::new(f);
            serde_json::to_writer_pretty(&mut w, &summary)?;
            w.flush()?;
        }
        replace_file_atomic_backoff(&tmp, &dest)?;
        tracing::info!(schema, rows = summary.rows, files = summary.files, "rollup written");
        Ok(())
    }
}
