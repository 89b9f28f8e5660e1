//! Rows, their stable identifiers, and per-row validation/transformation against a schema.

use crate::date::normalize_date;
use crate::schema::{FieldTransform, HeaderMapping, SchemaDescriptor};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Values that count as "absent" for required fields (compared case-insensitively after trim).
pub const SENTINELS: [&str; 4] = ["", "na", "n/a", "null"];

/// Stable 64-bit identifier for one physical source row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowId(pub u64);

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

fn put(h: &mut Sha256, s: &str) {
    h.update((s.len() as u64).to_le_bytes());
    h.update(s.as_bytes());
}

impl RowId {
    /// Derived from file name, source line, and the raw field map. The line number keeps
    /// two identical rows in one file distinct.
    ///
    /// Ids are persisted with staged rows and error exports, so the digest must not depend on
    /// the build: SHA-256 over length-prefixed parts, first 8 bytes big-endian.
    pub fn derive(file: &str, line: u64, fields: &BTreeMap<String, String>) -> Self {
        let mut h = Sha256::new();
        put(&mut h, file);
        h.update(line.to_le_bytes());
        h.update((fields.len() as u64).to_le_bytes());
        for (k, v) in fields {
            put(&mut h, k);
            put(&mut h, v);
        }
        let digest = h.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        RowId(u64::from_be_bytes(head))
    }
}

/// One logical record headed for upload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// 1-based line of the record in its source (the header is line 1).
    pub line: u64,
    pub id: RowId,
    pub fields: BTreeMap<String, String>,
}

/// A record permanently excluded from upload, with the reason it was excluded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RowError {
    pub file: String,
    pub line: u64,
    pub id: RowId,
    pub reason: String,
    pub fields: BTreeMap<String, String>,
}

impl RowError {
    pub fn from_row(file: &str, row: Row, reason: impl Into<String>) -> Self {
        Self { file: file.to_string(), line: row.line, id: row.id, reason: reason.into(), fields: row.fields }
    }
}

#[inline]
pub fn is_sentinel(v: &str) -> bool {
    let v = v.trim();
    SENTINELS.iter().any(|s| v.eq_ignore_ascii_case(s))
}

fn round_coordinate(raw: &str, precision: u32) -> String {
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => {
            let scale = 10f64.powi(precision as i32);
            format!("{:.*}", precision as usize, (v * scale).round() / scale)
        }
        _ => raw.to_string(),
    }
}

/// Applies a schema to raw records: header mapping, required-field checks, field transforms.
pub struct RowValidator {
    file: String,
    schema: SchemaDescriptor,
    mapping: HeaderMapping,
}

impl RowValidator {
    pub fn new(file: impl Into<String>, schema: SchemaDescriptor, mapping: HeaderMapping) -> Self {
        Self { file: file.into(), schema, mapping }
    }

    /// Identify rows under `file` from now on.
    pub fn rename(&mut self, file: impl Into<String>) {
        self.file = file.into();
    }

    /// Build the mapped field map for a raw record; columns past the end of a short record are absent.
    pub fn field_map<'a>(&self, values: impl IntoIterator<Item = &'a str>) -> BTreeMap<String, String> {
        let values: Vec<&str> = values.into_iter().collect();
        self.mapping
            .columns
            .iter()
            .filter_map(|(i, name)| values.get(*i).map(|v| (name.clone(), v.trim().to_string())))
            .collect()
    }

    /// Validate and transform one record. The id is computed from the raw (pre-transform) fields.
    pub fn check(&self, line: u64, raw: BTreeMap<String, String>) -> Result<Row, RowError> {
        let id = RowId::derive(&self.file, line, &raw);
        let missing: Vec<&str> = self
            .schema
            .fields
            .iter()
            .filter(|f| f.required)
            .filter(|f| raw.get(&f.name).map_or(true, |v| is_sentinel(v)))
            .map(|f| f.name.as_str())
            .collect();
        if !missing.is_empty() {
            let reason = format!("missing required field(s): {}", missing.join(", "));
            return Err(RowError { file: self.file.clone(), line, id, reason, fields: raw });
        }

        let mut fields = raw;
        for spec in &self.schema.fields {
            let Some(v) = fields.get_mut(&spec.name) else { continue };
            if is_sentinel(v) {
                continue;
            }
            match spec.transform {
                FieldTransform::None => {}
                FieldTransform::Date => *v = normalize_date(v, self.schema.day_first),
                FieldTransform::Coordinate { precision } => *v = round_coordinate(v, precision),
            }
        }
        Ok(Row { line, id, fields })
    }
}
