//! Second phase of a job: trigger server-side reconciliation, poll it to completion, then roll up.

use crate::progress::{ProgressObserver, ReconcileEstimator, ReconcileSnapshot};
use anyhow::{bail, Context, Result};
use std::time::Duration;

/// Opaque token identifying one triggered reconciliation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileHandle(pub String);

/// The server side of reconciliation. `poll` reports percent complete; values above 100 are clamped.
pub trait ReconciliationService: Send + Sync {
    fn staged_rows(&self, schema: &str) -> Result<u64>;
    fn trigger(&self, schema: &str) -> Result<ReconcileHandle>;
    fn poll(&self, handle: &ReconcileHandle) -> Result<u8>;
    fn rollup(&self, schema: &str) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconcileReport {
    pub staged_rows: u64,
    pub polls: u32,
    pub elapsed: Duration,
}

#[derive(Clone, Copy, Debug)]
pub struct Poller {
    pub interval: Duration,
    pub max_consecutive_errors: u32,
}

impl Default for Poller {
    fn default() -> Self {
        Self { interval: Duration::from_secs(2), max_consecutive_errors: 5 }
    }
}

impl Poller {
    pub fn new(interval: Duration, max_consecutive_errors: u32) -> Self {
        Self { interval, max_consecutive_errors }
    }

    /// Runs to completion once triggered; there is no cancellation from here on.
    pub fn run(
        &self,
        service: &dyn ReconciliationService,
        schema: &str,
        observer: &dyn ProgressObserver,
    ) -> Result<ReconcileReport> {
        let staged_rows = service.staged_rows(schema).context("count staged rows")?;
        if staged_rows == 0 {
            tracing::warn!(schema, "no staged rows; reconciling anyway");
        }
        let handle = service.trigger(schema).context("trigger reconciliation")?;
        tracing::info!(schema, handle = %handle.0, staged_rows, "reconciliation started");

        let clock = ReconcileEstimator::start();
        let mut polls = 0u32;
        let mut consecutive_errors = 0u32;
        loop {
            match service.poll(&handle) {
                Ok(pct) => {
                    consecutive_errors = 0;
                    polls += 1;
                    let percent = pct.min(100);
                    let elapsed = clock.elapsed();
                    observer.on_reconcile(&ReconcileSnapshot {
                        percent,
                        polls,
                        elapsed,
                        eta: ReconcileEstimator::eta_after(elapsed, percent),
                    });
                    if percent >= 100 {
                        break;
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors > self.max_consecutive_errors {
                        bail!("reconciliation poll failed {consecutive_errors} times in a row: {e:#}");
                    }
                    tracing::warn!(attempt = consecutive_errors, "reconciliation poll failed: {e:#}");
                }
            }
            std::thread::sleep(self.interval);
        }

        service.rollup(schema).context("roll up reconciled rows")?;
        let report = ReconcileReport { staged_rows, polls, elapsed: clock.elapsed() };
        tracing::info!(schema, polls, elapsed_ms = report.elapsed.as_millis() as u64, "reconciliation complete");
        Ok(report)
    }
}
