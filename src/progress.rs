//! Progress and ETA: estimators for both job phases, the observer seam, and indicatif bars.

use crate::counters::{CounterSnapshot, JobCounters};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Optional global MultiProgress that allows multiple bars to render concurrently.
/// If unset, progress bars draw to the default terminal target.
static GLOBAL_MP: OnceLock<Arc<MultiProgress>> = OnceLock::new();

/// Install a global MultiProgress used by all subsequently created progress bars.
/// Safe to call once; additional calls are ignored.
pub fn set_global_multiprogress(mp: Arc<MultiProgress>) {
    let _ = GLOBAL_MP.set(mp);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Eta {
    Calculating,
    Remaining(Duration),
}

impl fmt::Display for Eta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eta::Calculating => f.write_str("calculating"),
            Eta::Remaining(d) => {
                let s = d.as_secs();
                write!(f, "{:02}:{:02}:{:02}", s / 3600, (s / 60) % 60, s % 60)
            }
        }
    }
}

/// Upload-phase ETA: time since the first completed chunk, scaled by the chunks still outstanding.
#[derive(Default)]
pub struct UploadEstimator {
    first_completion: Mutex<Option<Instant>>,
}

impl UploadEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the clock on the first call; later calls are no-ops.
    pub fn mark_completion(&self) {
        self.first_completion.lock().get_or_insert_with(Instant::now);
    }

    pub fn eta(&self, completed: u64, total: u64) -> Eta {
        let Some(first) = *self.first_completion.lock() else { return Eta::Calculating };
        if completed == 0 {
            return Eta::Calculating;
        }
        let remaining = total.saturating_sub(completed);
        Eta::Remaining(first.elapsed().mul_f64(remaining as f64 / completed as f64))
    }
}

/// Reconciliation ETA from the server-reported percentage.
pub struct ReconcileEstimator {
    started: Instant,
}

impl ReconcileEstimator {
    pub fn start() -> Self {
        Self { started: Instant::now() }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn eta(&self, percent: u8) -> Eta {
        Self::eta_after(self.started.elapsed(), percent)
    }

    pub fn eta_after(elapsed: Duration, percent: u8) -> Eta {
        let pct = percent.min(100) as f64;
        if pct == 0.0 {
            return Eta::Calculating;
        }
        Eta::Remaining(elapsed.mul_f64((100.0 - pct) / pct))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub counters: CounterSnapshot,
    pub elapsed: Duration,
    pub eta: Eta,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconcileSnapshot {
    pub percent: u8,
    pub polls: u32,
    pub elapsed: Duration,
    pub eta: Eta,
}

/// Receives progress as it happens. Called from worker threads.
pub trait ProgressObserver: Send + Sync {
    fn on_upload(&self, snap: &ProgressSnapshot);
    fn on_reconcile(&self, snap: &ReconcileSnapshot);
}

pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_upload(&self, _: &ProgressSnapshot) {}
    fn on_reconcile(&self, _: &ReconcileSnapshot) {}
}

/// Publishes a snapshot after each chunk completion. Snapshots are taken and delivered
/// under one lock, so observers see completions in non-decreasing order.
pub struct UploadProgress<'a> {
    counters: &'a JobCounters,
    observer: &'a dyn ProgressObserver,
    estimator: UploadEstimator,
    started: Instant,
    publish: Mutex<()>,
}

impl<'a> UploadProgress<'a> {
    pub fn new(counters: &'a JobCounters, observer: &'a dyn ProgressObserver) -> Self {
        Self { counters, observer, estimator: UploadEstimator::new(), started: Instant::now(), publish: Mutex::new(()) }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let counters = self.counters.snapshot();
        ProgressSnapshot {
            counters,
            elapsed: self.started.elapsed(),
            eta: self.estimator.eta(counters.chunks_completed, counters.chunks_total),
        }
    }

    pub fn chunk_completed(&self) {
        self.counters.chunk_completed();
        self.estimator.mark_completion();
        self.publish();
    }

    pub fn publish(&self) {
        let _order = self.publish.lock();
        self.observer.on_upload(&self.snapshot());
    }
}

fn new_bar(total: u64) -> ProgressBar {
    if let Some(mp) = GLOBAL_MP.get() {
        mp.add(ProgressBar::new(total))
    } else {
        ProgressBar::new(total)
    }
}

fn styled_bar(total: u64, template: &str, label: &str) -> ProgressBar {
    let pb = new_bar(total);
    let style = ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ");
    pb.set_style(style);
    if !label.is_empty() {
        pb.set_prefix(label.to_string());
    }
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Terminal bars: chunks during upload, percent during reconciliation.
pub struct BarProgress {
    label: String,
    upload: Mutex<Option<ProgressBar>>,
    reconcile: Mutex<Option<ProgressBar>>,
}

impl BarProgress {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into(), upload: Mutex::new(None), reconcile: Mutex::new(None) }
    }

    pub fn finish(&self) {
        if let Some(pb) = self.upload.lock().take() {
            pb.finish();
        }
        if let Some(pb) = self.reconcile.lock().take() {
            pb.finish();
        }
    }
}

impl ProgressObserver for BarProgress {
    fn on_upload(&self, snap: &ProgressSnapshot) {
        let mut slot = self.upload.lock();
        let pb = slot.get_or_insert_with(|| {
            styled_bar(
                snap.counters.chunks_total,
                "{spinner:.green} {prefix} upload {pos}/{len} [{bar:.cyan/blue}] {percent:>3}%  \
                 elapsed: {elapsed_precise}  {msg}",
                &self.label,
            )
        });
        pb.set_length(snap.counters.chunks_total);
        pb.set_position(snap.counters.chunks_completed);
        pb.set_message(format!(
            "rows {}/{} quarantined {}  eta: {}",
            snap.counters.rows_uploaded, snap.counters.rows_read, snap.counters.rows_quarantined, snap.eta
        ));
    }

    fn on_reconcile(&self, snap: &ReconcileSnapshot) {
        if let Some(pb) = self.upload.lock().take() {
            pb.finish();
        }
        let mut slot = self.reconcile.lock();
        let pb = slot.get_or_insert_with(|| {
            styled_bar(
                100,
                "{spinner:.green} {prefix} reconcile [{bar:.cyan/blue}] {pos:>3}%  elapsed: {elapsed_precise}  {msg}",
                &self.label,
            )
        });
        pb.set_position(snap.percent as u64);
        pb.set_message(format!("eta: {}", snap.eta));
    }
}
