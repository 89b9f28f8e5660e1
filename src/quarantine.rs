//! The quarantine: rows permanently excluded from upload, grouped by source file and keyed by row id.

use crate::validate::{RowError, RowId};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub type QuarantineMap = BTreeMap<String, BTreeMap<RowId, RowError>>;

#[derive(Default)]
pub struct Quarantine {
    inner: Mutex<QuarantineMap>,
}

impl Quarantine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the row was already quarantined (the entry is left as is).
    pub fn insert(&self, err: RowError) -> bool {
        let mut inner = self.inner.lock();
        let per_file = inner.entry(err.file.clone()).or_default();
        if per_file.contains_key(&err.id) {
            return false;
        }
        per_file.insert(err.id, err);
        true
    }

    pub fn contains(&self, file: &str, id: RowId) -> bool {
        self.inner.lock().get(file).map_or(false, |m| m.contains_key(&id))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_map(self) -> QuarantineMap {
        self.inner.into_inner()
    }
}

/// Write `<file>.errors.csv` per source file: line, row id, reason, then the original fields.
/// Returns the written paths.
pub fn export_csv(map: &QuarantineMap, dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let mut written = Vec::with_capacity(map.len());
    for (file, rows) in map {
        if rows.is_empty() {
            continue;
        }
        let mut columns: Vec<&str> = rows.values().flat_map(|e| e.fields.keys().map(|k| k.as_str())).collect();
        columns.sort_unstable();
        columns.dedup();

        let path = dir.join(format!("{file}.errors.csv"));
        let mut w = csv::Writer::from_path(&path).with_context(|| format!("create {}", path.display()))?;
        let mut header = vec!["line", "row_id", "reason"];
        header.extend(columns.iter().copied());
        w.write_record(&header)?;

        let mut ordered: Vec<&RowError> = rows.values().collect();
        ordered.sort_by_key(|e| e.line);
        for e in ordered {
            let mut rec = vec![e.line.to_string(), e.id.to_string(), e.reason.clone()];
            rec.extend(columns.iter().map(|c| e.fields.get(*c).cloned().unwrap_or_default()));
            w.write_record(&rec)?;
        }
        w.flush()?;
        written.push(path);
    }
    Ok(written)
}
