use anyhow::{anyhow, bail, Result};
use fieldingest::{
    CancelHandle, FieldSpec, FieldTransform, ProgressObserver, ProgressSnapshot, ReconcileHandle, ReconcileSnapshot,
    ReconciliationService, Row, SchemaDescriptor, UploadContext, Uploader,
};
use std::collections::{HashSet, VecDeque};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Tree census schema: tag and species required, measured date normalized.
pub fn tree_schema() -> SchemaDescriptor {
    SchemaDescriptor::new(
        "trees",
        vec![
            FieldSpec::new("tag").required(),
            FieldSpec::new("species").required(),
            FieldSpec::new("dbh"),
            FieldSpec::new("measured").transform(FieldTransform::Date),
        ],
    )
}

pub fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut f = File::create(&path).unwrap();
    f.write_all(content.as_bytes()).unwrap();
    path
}

/// Write `content` zstd-compressed.
pub fn write_zst(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    let f = File::create(&path).unwrap();
    let mut enc = zstd::stream::write::Encoder::new(f, 3).unwrap();
    enc.write_all(content.as_bytes()).unwrap();
    enc.finish().unwrap();
    path
}

/// Read a text file line-by-line into strings (useful for .ndjson, .csv), skipping empty lines.
pub fn read_lines(path: &Path) -> Vec<String> {
    let f = File::open(path).unwrap();
    let r = BufReader::new(f);
    r.lines().map(|l| l.unwrap()).filter(|s| !s.is_empty()).collect()
}

/// Header plus `n` valid rows tagged `T001..`, joined with `delim`.
pub fn tree_csv(n: usize, delim: char) -> String {
    let mut s = ["tag", "species", "dbh", "measured"].join(&delim.to_string());
    s.push('\n');
    for i in 1..=n {
        let row = [format!("T{i:03}"), "Acer rubrum".to_string(), format!("{}.5", 10 + i), "5/4/2023".to_string()];
        s.push_str(&row.join(&delim.to_string()));
        s.push('\n');
    }
    s
}

/// Shared, ordered record of calls across the mocks so tests can assert sequencing.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, e: impl Into<String>) {
        self.0.lock().unwrap().push(e.into());
    }
    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
    pub fn last_index_of(&self, prefix: &str) -> Option<usize> {
        self.events().iter().rposition(|e| e.starts_with(prefix))
    }
    pub fn first_index_of(&self, prefix: &str) -> Option<usize> {
        self.events().iter().position(|e| e.starts_with(prefix))
    }
}

/// Uploader double: fails any call containing a poisoned tag, optionally sleeps per call,
/// tracks the peak number of concurrent calls, and records every accepted row tag.
#[derive(Default)]
pub struct MockUploader {
    pub poisoned: HashSet<String>,
    pub latency: Duration,
    pub log: EventLog,
    pub cancel_on_first: Option<CancelHandle>,
    pub accepted: Mutex<Vec<String>>,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl MockUploader {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn poison(mut self, tags: &[&str]) -> Self {
        self.poisoned = tags.iter().map(|t| t.to_string()).collect();
        self
    }
    pub fn latency(mut self, d: Duration) -> Self {
        self.latency = d;
        self
    }
    pub fn log(mut self, log: EventLog) -> Self {
        self.log = log;
        self
    }
    pub fn cancel_on_first_call(mut self, h: CancelHandle) -> Self {
        self.cancel_on_first = Some(h);
        self
    }
    pub fn accepted_tags(&self) -> Vec<String> {
        let mut v = self.accepted.lock().unwrap().clone();
        v.sort();
        v
    }
    pub fn peak(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Uploader for MockUploader {
    fn send(&self, _ctx: &UploadContext, rows: &[Row]) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            if let Some(h) = &self.cancel_on_first {
                h.cancel();
            }
        }
        self.log.push(format!("upload:{}", rows.len()));
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        let bad = rows.iter().find(|r| self.poisoned.contains(&r.fields["tag"]));
        let out = match bad {
            Some(r) => Err(anyhow!("server rejected row {}: poisoned", r.fields["tag"])),
            None => {
                self.accepted.lock().unwrap().extend(rows.iter().map(|r| r.fields["tag"].clone()));
                Ok(())
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

/// Reconciliation double driven by a script of poll results. Once the script runs out every poll fails.
pub struct ScriptedReconciler {
    pub staged: u64,
    pub fail_trigger: bool,
    script: Mutex<VecDeque<Result<u8, String>>>,
    pub log: EventLog,
}

impl ScriptedReconciler {
    pub fn new(script: Vec<Result<u8, String>>) -> Self {
        Self { staged: 1, fail_trigger: false, script: Mutex::new(script.into()), log: EventLog::default() }
    }
    pub fn completing() -> Self {
        Self::new(vec![Ok(30), Ok(100)])
    }
    pub fn log(mut self, log: EventLog) -> Self {
        self.log = log;
        self
    }
}

impl ReconciliationService for ScriptedReconciler {
    fn staged_rows(&self, _schema: &str) -> Result<u64> {
        self.log.push("staged");
        Ok(self.staged)
    }
    fn trigger(&self, schema: &str) -> Result<ReconcileHandle> {
        self.log.push("trigger");
        if self.fail_trigger {
            bail!("backend refused to reconcile {schema}");
        }
        Ok(ReconcileHandle(format!("{schema}-1")))
    }
    fn poll(&self, _handle: &ReconcileHandle) -> Result<u8> {
        self.log.push("poll");
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(p)) => Ok(p),
            Some(Err(e)) => Err(anyhow!(e)),
            None => Err(anyhow!("backend unavailable")),
        }
    }
    fn rollup(&self, _schema: &str) -> Result<()> {
        self.log.push("rollup");
        Ok(())
    }
}

/// Observer that keeps every snapshot it is handed.
#[derive(Default)]
pub struct RecordingObserver {
    pub uploads: Mutex<Vec<ProgressSnapshot>>,
    pub reconciles: Mutex<Vec<ReconcileSnapshot>>,
}

impl ProgressObserver for RecordingObserver {
    fn on_upload(&self, snap: &ProgressSnapshot) {
        self.uploads.lock().unwrap().push(*snap);
    }
    fn on_reconcile(&self, snap: &ReconcileSnapshot) {
        self.reconciles.lock().unwrap().push(*snap);
    }
}
