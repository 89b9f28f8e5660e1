//! Failure isolation: pause intake, drain in-flight uploads, then resolve a failed chunk row by row.

use crate::chunk::{Chunk, ChunkState, UploadAttempt, UploadUnit};
use crate::scheduler::{Dispatcher, UploadContext};
use crate::validate::{RowError, RowId};
use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::slice;

/// Row-level recovery for failed chunks. Each row gets exactly one solo attempt;
/// a row that fails it goes to the quarantine with the uploader's error as the reason.
#[derive(Default)]
pub struct RetryManager {
    // Serializes decompositions so two failed chunks never retry concurrently.
    lock: Mutex<()>,
    resolved: Mutex<HashSet<RowId>>,
}

impl RetryManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_resolved(&self, id: RowId) -> bool {
        self.resolved.lock().contains(&id)
    }

    /// Recover `chunk`, which must be `Failed`. Intake stays paused until every row is resolved.
    /// Returns `(uploaded, quarantined)` for the chunk's rows.
    pub fn recover(&self, chunk: &mut Chunk, d: &Dispatcher<'_>, ctx: &UploadContext) -> Result<(u64, u64)> {
        let _pause = d.gate.pause();
        d.gate.drain();
        let _serial = self.lock.lock();
        tracing::info!(file = %chunk.file, ordinal = chunk.ordinal, rows = chunk.len(), "decomposing failed chunk");

        let (mut uploaded, mut quarantined) = (0u64, 0u64);
        for row in &chunk.rows {
            if self.is_resolved(row.id) || d.quarantine.contains(&chunk.file, row.id) {
                continue;
            }
            let unit = UploadUnit::Row { file: chunk.file.clone(), id: row.id };
            let attempt = UploadAttempt::run(unit, 2, || d.uploader.send(ctx, slice::from_ref(row)));
            match attempt.outcome {
                Ok(()) => {
                    d.counters.add_uploaded(1);
                    uploaded += 1;
                }
                Err(reason) => {
                    tracing::warn!(file = %chunk.file, line = row.line, row = %row.id, "row quarantined: {reason}");
                    if d.quarantine.insert(RowError::from_row(&chunk.file, row.clone(), reason)) {
                        d.counters.add_quarantined(1);
                        quarantined += 1;
                    }
                }
            }
            self.resolved.lock().insert(row.id);
        }

        chunk.transition(ChunkState::Retried)?;
        tracing::info!(
            file = %chunk.file,
            ordinal = chunk.ordinal,
            uploaded,
            quarantined,
            "failed chunk resolved"
        );
        Ok((uploaded, quarantined))
    }
}
