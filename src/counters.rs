//! Job-wide tallies updated from concurrent completions. Increment-only; never read-modify-write.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Default)]
pub struct JobCounters {
    rows_read: AtomicU64,
    rows_uploaded: AtomicU64,
    rows_quarantined: AtomicU64,
    chunks_produced: AtomicU64,
    chunks_completed: AtomicU64,
    chunks_estimate: AtomicU64,
    parse_done: AtomicBool,
}

/// Point-in-time copy of the counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub rows_read: u64,
    pub rows_uploaded: u64,
    pub rows_quarantined: u64,
    pub rows_pending: u64,
    pub chunks_completed: u64,
    pub chunks_total: u64,
}

impl JobCounters {
    pub fn new(chunks_estimate: u64) -> Self {
        let c = Self::default();
        c.chunks_estimate.store(chunks_estimate, Ordering::Relaxed);
        c
    }

    /// Rows are counted as read before they are handed to a worker.
    pub fn add_read(&self, n: u64) {
        self.rows_read.fetch_add(n, Ordering::SeqCst);
    }
    pub fn add_uploaded(&self, n: u64) {
        self.rows_uploaded.fetch_add(n, Ordering::SeqCst);
    }
    pub fn add_quarantined(&self, n: u64) {
        self.rows_quarantined.fetch_add(n, Ordering::SeqCst);
    }
    pub fn chunk_produced(&self) {
        self.chunks_produced.fetch_add(1, Ordering::SeqCst);
    }
    pub fn chunk_completed(&self) {
        self.chunks_completed.fetch_add(1, Ordering::SeqCst);
    }

    /// The parser has emitted its last chunk; the total is exact from here on.
    pub fn finish_parse(&self) {
        self.parse_done.store(true, Ordering::SeqCst);
    }

    pub fn chunks_completed(&self) -> u64 {
        self.chunks_completed.load(Ordering::SeqCst)
    }

    pub fn chunks_produced(&self) -> u64 {
        self.chunks_produced.load(Ordering::SeqCst)
    }

    pub fn chunks_total(&self) -> u64 {
        let produced = self.chunks_produced.load(Ordering::SeqCst);
        if self.parse_done.load(Ordering::SeqCst) {
            produced
        } else {
            produced.max(self.chunks_estimate.load(Ordering::Relaxed))
        }
    }

    /// Loads completions before reads so `read >= uploaded + quarantined` holds in every snapshot,
    /// and completed chunks before produced so `completed <= total` does too.
    pub fn snapshot(&self) -> CounterSnapshot {
        let chunks_completed = self.chunks_completed();
        let rows_uploaded = self.rows_uploaded.load(Ordering::SeqCst);
        let rows_quarantined = self.rows_quarantined.load(Ordering::SeqCst);
        let rows_read = self.rows_read.load(Ordering::SeqCst);
        let chunks_total = self.chunks_total();
        CounterSnapshot {
            rows_read,
            rows_uploaded,
            rows_quarantined,
            rows_pending: rows_read.saturating_sub(rows_uploaded + rows_quarantined),
            chunks_completed,
            chunks_total,
        }
    }
}
