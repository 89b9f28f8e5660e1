use crate::config::IngestOptions;
use crate::counters::JobCounters;
use crate::delimiter::{resolve_delimiter, validate_delimiter, DelimiterCache, DelimiterProfile, FileIdentity, SAMPLE_BYTES};
use crate::flow::FlowGate;
use crate::parser::ChunkParser;
use crate::progress::{BarProgress, NoProgress, ProgressObserver, UploadProgress};
use crate::quarantine::{Quarantine, QuarantineMap};
use crate::reconcile::{Poller, ReconcileReport, ReconciliationService};
use crate::retry::RetryManager;
use crate::scheduler::{run_pool, Dispatcher, Uploader};
use crate::schema::SchemaDescriptor;
use crate::source::{read_sample, source_name};
use crate::util::init_tracing_once;
use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Requests cancellation of a running job from any thread.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    /// Every chunk terminal and reconciliation observed at 100%.
    Complete,
    /// Stopped before reconciliation; rows not yet sent stay pending.
    Cancelled,
}

#[derive(Debug)]
pub struct JobSummary {
    pub status: JobStatus,
    pub uploaded: u64,
    pub quarantined: QuarantineMap,
    pub total_rows: u64,
    pub chunks: u64,
    pub elapsed: Duration,
    pub delimiters: BTreeMap<String, DelimiterProfile>,
    pub reconcile: Option<ReconcileReport>,
}

impl JobSummary {
    pub fn quarantined_rows(&self) -> u64 {
        self.quarantined.values().map(|m| m.len() as u64).sum()
    }

    /// Rows read but neither uploaded nor quarantined; non-zero only for cancelled jobs.
    pub fn pending_rows(&self) -> u64 {
        self.total_rows.saturating_sub(self.uploaded + self.quarantined_rows())
    }
}

/// One ingestion job: an ordered list of files bound for one schema.
pub struct IngestJob {
    files: Vec<PathBuf>,
    schema: SchemaDescriptor,
    opts: IngestOptions,
    cancel: CancelHandle,
}

impl IngestJob {
    pub fn new(schema: SchemaDescriptor) -> Self {
        Self { files: Vec::new(), schema, opts: IngestOptions::default(), cancel: CancelHandle::default() }
    }

    // -------- Builder methods --------
    pub fn file(mut self, path: impl AsRef<Path>) -> Self { self.files.push(path.as_ref().to_path_buf()); self }
    pub fn files<I, P>(mut self, paths: I) -> Self where I: IntoIterator<Item = P>, P: AsRef<Path> {
        self.files.extend(paths.into_iter().map(|p| p.as_ref().to_path_buf()));
        self
    }
    pub fn options(mut self, opts: IngestOptions) -> Self { self.opts = opts; self }
    pub fn concurrency(mut self, n: usize) -> Self { self.opts = self.opts.with_concurrency(n); self }
    pub fn chunk_bytes(mut self, bytes: u64) -> Self { self.opts = self.opts.with_chunk_bytes(bytes); self }
    pub fn delimiter(mut self, delim: char) -> Self { self.opts = self.opts.with_delimiter(delim); self }
    pub fn poll_interval(mut self, every: Duration) -> Self { self.opts = self.opts.with_poll_interval(every); self }
    pub fn progress(mut self, yes: bool) -> Self { self.opts = self.opts.with_progress(yes); self }
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self { self.opts = self.opts.with_label(key, value); self }

    pub fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run with the observer the options ask for: terminal bars, or nothing.
    pub fn run(&self, uploader: &dyn Uploader, reconciler: &dyn ReconciliationService) -> Result<JobSummary> {
        if self.opts.progress {
            let bars = BarProgress::new(self.opts.progress_label.clone().unwrap_or_default());
            let out = self.run_observed(uploader, reconciler, &bars);
            bars.finish();
            out
        } else {
            self.run_observed(uploader, reconciler, &NoProgress)
        }
    }

    /// Upload every file, then reconcile. Returns early with `Cancelled` if cancelled during upload.
    pub fn run_observed(
        &self,
        uploader: &dyn Uploader,
        reconciler: &dyn ReconciliationService,
        observer: &dyn ProgressObserver,
    ) -> Result<JobSummary> {
        init_tracing_once();
        self.schema.check()?;
        if self.files.is_empty() {
            bail!("no source files given");
        }
        let started = Instant::now();

        let mut plan = Vec::with_capacity(self.files.len());
        let mut delimiters = BTreeMap::new();
        for (path, name) in self.files.iter().zip(unique_names(&self.files)) {
            let profile = self.delimiter_for(path, &name)?;
            delimiters.insert(name.clone(), profile.clone());
            plan.push((path.as_path(), name, profile.delimiter));
        }

        let chunk_bytes = self.opts.chunk_bytes.max(1);
        let estimate: u64 = self
            .files
            .iter()
            .map(|p| fs::metadata(p).map(|m| m.len().div_ceil(chunk_bytes)).unwrap_or(0))
            .sum();
        tracing::info!(
            files = self.files.len(),
            schema = %self.schema.name,
            concurrency = self.opts.concurrency,
            chunk_bytes,
            estimated_chunks = estimate,
            "upload phase started"
        );

        let counters = JobCounters::new(estimate);
        let quarantine = Quarantine::new();
        let gate = FlowGate::new();
        let retry = RetryManager::new();
        let progress = UploadProgress::new(&counters, observer);
        let dispatcher = Dispatcher {
            uploader,
            gate: &gate,
            retry: &retry,
            counters: &counters,
            quarantine: &quarantine,
            progress: &progress,
            cancel: &self.cancel,
            schema: &self.schema.name,
            labels: &self.opts.labels,
        };

        run_pool(
            self.opts.concurrency,
            |submitter| {
                'files: for (path, name, delimiter) in &plan {
                    let mut parser =
                        ChunkParser::open(path, *delimiter, &self.schema, chunk_bytes, self.opts.read_buffer_bytes)?
                            .named(name.as_str());
                    loop {
                        gate.wait_open();
                        if self.cancel.is_cancelled() {
                            break 'files;
                        }
                        let Some(batch) = parser.next_batch()? else { break };
                        counters.add_read(batch.rows_read);
                        for err in batch.quarantined {
                            tracing::debug!(file = %err.file, line = err.line, "row rejected: {}", err.reason);
                            if quarantine.insert(err) {
                                counters.add_quarantined(1);
                            }
                        }
                        if let Some(chunk) = batch.chunk {
                            counters.chunk_produced();
                            submitter.submit(chunk)?;
                        }
                    }
                    tracing::debug!(file = parser.file_name(), bytes = parser.bytes_consumed(), "file parsed");
                }
                counters.finish_parse();
                Ok(())
            },
            |chunk| {
                let o = dispatcher.deliver(chunk)?;
                tracing::trace!(
                    file = %o.file,
                    ordinal = o.ordinal,
                    state = ?o.state,
                    uploaded = o.uploaded,
                    quarantined = o.quarantined,
                    "chunk settled"
                );
                Ok(())
            },
        )?;
        progress.publish();

        let snap = counters.snapshot();
        let summary = |status, reconcile| JobSummary {
            status,
            uploaded: snap.rows_uploaded,
            quarantined: QuarantineMap::new(),
            total_rows: snap.rows_read,
            chunks: snap.chunks_completed,
            elapsed: started.elapsed(),
            delimiters: delimiters.clone(),
            reconcile,
        };

        if self.cancel.is_cancelled() {
            tracing::warn!(
                uploaded = snap.rows_uploaded,
                pending = snap.rows_pending,
                "job cancelled during upload; skipping reconciliation"
            );
            let mut out = summary(JobStatus::Cancelled, None);
            out.quarantined = quarantine.into_map();
            return Ok(out);
        }
        if counters.chunks_completed() != counters.chunks_produced() {
            bail!(
                "{} of {} chunks did not reach a terminal state",
                counters.chunks_produced() - counters.chunks_completed(),
                counters.chunks_produced()
            );
        }
        tracing::info!(
            rows = snap.rows_read,
            uploaded = snap.rows_uploaded,
            quarantined = snap.rows_quarantined,
            chunks = snap.chunks_completed,
            "upload phase complete"
        );

        let poller = Poller::new(self.opts.poll_interval, self.opts.max_poll_errors);
        let report = poller.run(reconciler, &self.schema.name, observer)?;
        if self.cancel.is_cancelled() {
            tracing::warn!("cancel requested after reconciliation started; ignored");
        }

        let mut out = summary(JobStatus::Complete, Some(report));
        out.quarantined = quarantine.into_map();
        tracing::info!(elapsed_ms = out.elapsed.as_millis() as u64, "job complete");
        Ok(out)
    }

    fn delimiter_for(&self, path: &Path, name: &str) -> Result<DelimiterProfile> {
        let sample = read_sample(path, SAMPLE_BYTES)?;
        let profile = match self.opts.delimiter_override {
            Some(d) => resolve_delimiter(&sample, Some(d)),
            None => {
                let id = FileIdentity::of(path).with_context(|| format!("stat {}", path.display()))?;
                DelimiterCache::global().get_or_insert_with(id, || resolve_delimiter(&sample, None))
            }
        };
        tracing::info!(file = %name, delimiter = ?profile.delimiter, confidence = profile.confidence, "delimiter resolved");

        let check = validate_delimiter(&sample, profile.delimiter, &self.schema.field_names());
        for issue in &check.issues {
            tracing::warn!(file = %name, "{issue}");
        }
        Ok(profile)
    }
}

/// Base names, with later duplicates renamed `name#2`, `name#3`, ... so rows from
/// `a/plot.csv` and `b/plot.csv` never share an id or a quarantine bucket.
fn unique_names(files: &[PathBuf]) -> Vec<String> {
    let mut taken = HashSet::with_capacity(files.len());
    files
        .iter()
        .map(|path| {
            let base = source_name(path);
            let mut name = base.clone();
            let mut n = 2;
            while !taken.insert(name.clone()) {
                name = format!("{base}#{n}");
                n += 1;
            }
            if name != base {
                tracing::warn!(path = %path.display(), name = %name, "duplicate file name; renamed for this job");
            }
            name
        })
        .collect()
}
