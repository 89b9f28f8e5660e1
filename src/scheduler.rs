//! Upload scheduler: the `Uploader` seam and a bounded pool of workers fed through a rendezvous channel.
//!
//! With `C` workers at most `C` uploads are outstanding at once, row-level retries included,
//! since a retry runs on the worker that observed the failure. The producer blocks in
//! [`Submitter::submit`] until a worker is free to take the chunk.

use crate::chunk::{Chunk, ChunkState, UploadAttempt};
use crate::counters::JobCounters;
use crate::flow::FlowGate;
use crate::pipeline::CancelHandle;
use crate::progress::UploadProgress;
use crate::quarantine::Quarantine;
use crate::retry::RetryManager;
use crate::validate::Row;
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

/// Where rows leave the pipeline. Assumed network-bound and not idempotent per call:
/// a failed multi-row call may have been partially applied.
pub trait Uploader: Send + Sync {
    fn send(&self, ctx: &UploadContext, rows: &[Row]) -> Result<()>;
}

/// Per-call context handed to the uploader.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UploadContext {
    pub schema: String,
    pub file_name: String,
    /// Job-level labels such as plot or census identifiers.
    pub labels: BTreeMap<String, String>,
}

/// Producer side of the pool.
pub struct Submitter {
    tx: SyncSender<Chunk>,
}

impl Submitter {
    /// Hand `chunk` to the next free worker, blocking until one takes it.
    pub fn submit(&self, chunk: Chunk) -> Result<()> {
        self.tx.send(chunk).map_err(|_| anyhow!("upload workers stopped before the chunk was taken"))
    }
}

/// Run `concurrency` workers calling `handle` for each submitted chunk while `produce` feeds them.
/// Returns once `produce` has finished and every worker has drained; the first worker error wins.
pub fn run_pool<T, P, H>(concurrency: usize, produce: P, handle: H) -> Result<T>
where
    P: FnOnce(&Submitter) -> Result<T>,
    H: Fn(Chunk) -> Result<()> + Sync,
{
    let (tx, rx): (SyncSender<Chunk>, Receiver<Chunk>) = sync_channel(0);
    let rx = Mutex::new(rx);
    let first_err: Mutex<Option<anyhow::Error>> = Mutex::new(None);

    let produced = std::thread::scope(|s| {
        for i in 0..concurrency.max(1) {
            let (rx, handle, first_err) = (&rx, &handle, &first_err);
            std::thread::Builder::new()
                .name(format!("upload-{i}"))
                .spawn_scoped(s, move || loop {
                    let next = rx.lock().recv();
                    let Ok(chunk) = next else { break };
                    if let Err(e) = handle(chunk) {
                        tracing::error!("upload worker: {e:#}");
                        first_err.lock().get_or_insert(e);
                    }
                })
                .map_err(|e| anyhow!("spawn upload worker: {e}"))?;
        }
        let submitter = Submitter { tx };
        produce(&submitter)
    });

    if let Some(e) = first_err.into_inner() {
        return Err(e);
    }
    produced
}

/// Result of delivering one chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub file: String,
    pub ordinal: u64,
    pub state: ChunkState,
    pub uploaded: u64,
    pub quarantined: u64,
}

/// Everything a worker needs to deliver a chunk and account for it.
pub struct Dispatcher<'a> {
    pub uploader: &'a dyn Uploader,
    pub gate: &'a FlowGate,
    pub retry: &'a RetryManager,
    pub counters: &'a JobCounters,
    pub quarantine: &'a Quarantine,
    pub progress: &'a UploadProgress<'a>,
    pub cancel: &'a CancelHandle,
    pub schema: &'a str,
    pub labels: &'a BTreeMap<String, String>,
}

impl Dispatcher<'_> {
    pub fn context(&self, file: &str) -> UploadContext {
        UploadContext { schema: self.schema.to_string(), file_name: file.to_string(), labels: self.labels.clone() }
    }

    /// Upload `chunk` whole; on failure hand it to the retry manager for row-level recovery.
    /// A chunk picked up after cancellation is left pending and never sent.
    pub fn deliver(&self, mut chunk: Chunk) -> Result<ChunkOutcome> {
        let ctx = self.context(&chunk.file);
        let attempt = {
            let _slot = self.gate.acquire();
            if self.cancel.is_cancelled() {
                tracing::debug!(unit = %chunk.unit(), "cancelled; chunk not sent");
                return Ok(self.outcome(&chunk, 0, 0));
            }
            chunk.transition(ChunkState::InFlight)?;
            UploadAttempt::run(chunk.unit(), 1, || self.uploader.send(&ctx, &chunk.rows))
        };

        let (uploaded, quarantined) = match &attempt.outcome {
            Ok(()) => {
                chunk.transition(ChunkState::Succeeded)?;
                self.counters.add_uploaded(chunk.len() as u64);
                (chunk.len() as u64, 0)
            }
            Err(reason) => {
                tracing::warn!(unit = %attempt.unit, rows = chunk.len(), "chunk upload failed: {reason}");
                chunk.transition(ChunkState::Failed)?;
                self.retry.recover(&mut chunk, self, &ctx)?
            }
        };
        self.progress.chunk_completed();
        Ok(self.outcome(&chunk, uploaded, quarantined))
    }

    fn outcome(&self, chunk: &Chunk, uploaded: u64, quarantined: u64) -> ChunkOutcome {
        ChunkOutcome { file: chunk.file.clone(), ordinal: chunk.ordinal, state: chunk.state(), uploaded, quarantined }
    }
}
