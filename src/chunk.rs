//! Units of upload work: chunks with their lifecycle, and the record of each upload call.

use crate::validate::{Row, RowId};
use anyhow::{bail, Result};
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkState {
    Pending,
    InFlight,
    Succeeded,
    Failed,
    /// Failed, then decomposed and every row resolved individually.
    Retried,
}

impl ChunkState {
    pub fn can_become(self, next: ChunkState) -> bool {
        use ChunkState::*;
        matches!(
            (self, next),
            (Pending, InFlight) | (InFlight, Succeeded) | (InFlight, Failed) | (Failed, Retried)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ChunkState::Succeeded | ChunkState::Retried)
    }
}

/// Consecutive valid rows from one file, sized by the source bytes they were read from.
#[derive(Debug)]
pub struct Chunk {
    pub file: String,
    /// 0-based, unique within `file`, assigned in read order.
    pub ordinal: u64,
    pub rows: Vec<Row>,
    pub source_bytes: u64,
    state: ChunkState,
}

impl Chunk {
    pub fn new(file: impl Into<String>, ordinal: u64, rows: Vec<Row>, source_bytes: u64) -> Self {
        Self { file: file.into(), ordinal, rows, source_bytes, state: ChunkState::Pending }
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn unit(&self) -> UploadUnit {
        UploadUnit::Chunk { file: self.file.clone(), ordinal: self.ordinal }
    }

    pub fn transition(&mut self, next: ChunkState) -> Result<()> {
        if !self.state.can_become(next) {
            bail!("chunk {}#{}: illegal transition {:?} -> {:?}", self.file, self.ordinal, self.state, next);
        }
        self.state = next;
        Ok(())
    }
}

/// What a single `Uploader::send` call carried.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadUnit {
    Chunk { file: String, ordinal: u64 },
    Row { file: String, id: RowId },
}

impl fmt::Display for UploadUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadUnit::Chunk { file, ordinal } => write!(f, "{file}#{ordinal}"),
            UploadUnit::Row { file, id } => write!(f, "{file}@{id}"),
        }
    }
}

/// One call to the uploader and how it ended.
#[derive(Debug)]
pub struct UploadAttempt {
    pub unit: UploadUnit,
    pub started: Instant,
    pub attempt: u32,
    pub duration: Duration,
    pub outcome: Result<(), String>,
}

impl UploadAttempt {
    /// Time `send` and record its result.
    pub fn run(unit: UploadUnit, attempt: u32, send: impl FnOnce() -> Result<()>) -> Self {
        let started = Instant::now();
        let outcome = send().map_err(|e| format!("{e:#}"));
        let a = Self { unit, started, attempt, duration: started.elapsed(), outcome };
        tracing::debug!(
            unit = %a.unit,
            attempt = a.attempt,
            ok = a.outcome.is_ok(),
            elapsed_ms = a.duration.as_millis() as u64,
            "upload attempt"
        );
        a
    }
}
