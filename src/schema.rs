//! Per-job schema descriptor (external config) and source-header to field mapping.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Per-field value normalization.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FieldTransform {
    #[default]
    None,
    Date,
    /// Round to `precision` decimal places.
    Coordinate { precision: u32 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub transform: FieldTransform,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), required: false, transform: FieldTransform::None }
    }
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
    pub fn transform(mut self, t: FieldTransform) -> Self {
        self.transform = t;
        self
    }
}

/// Ordered field list for one target table, which fields are required, and how to normalize them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub name: String,
    pub fields: Vec<FieldSpec>,
    /// Resolve ambiguous `NN/NN/YYYY` dates as day/month (true) or month/day (false, the default).
    #[serde(default)]
    pub day_first: bool,
}

impl SchemaDescriptor {
    pub fn new(name: impl Into<String>, fields: Vec<FieldSpec>) -> Self {
        Self { name: name.into(), fields, day_first: false }
    }

    pub fn with_day_first(mut self, yes: bool) -> Self {
        self.day_first = yes;
        self
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let f = File::open(path).with_context(|| format!("open schema {}", path.display()))?;
        let schema: SchemaDescriptor = serde_json::from_reader(BufReader::new(f))
            .with_context(|| format!("parse schema {}", path.display()))?;
        schema.check()?;
        Ok(schema)
    }

    /// Reject descriptors that cannot drive a job.
    pub fn check(&self) -> Result<()> {
        if self.fields.is_empty() {
            bail!("schema '{}' declares no fields", self.name);
        }
        let mut seen = std::collections::HashSet::new();
        for f in &self.fields {
            if !seen.insert(normalize_header(&f.name)) {
                bail!("schema '{}' declares field '{}' twice", self.name, f.name);
            }
        }
        Ok(())
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }
}

/// Lowercase, trim, and drop `_`, `-` and whitespace so `Tree Tag`, `tree_tag` and `TreeTag` compare equal.
pub fn normalize_header(h: &str) -> String {
    h.trim().to_lowercase().chars().filter(|c| !matches!(c, '_' | '-') && !c.is_whitespace()).collect()
}

/// Source column index -> schema field name, built once from the header row.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HeaderMapping {
    pub columns: Vec<(usize, String)>,
    pub unmapped_source: Vec<String>,
    pub missing_fields: Vec<String>,
}

/// Bookkeeping columns written by the quarantine export; they map only by exact name.
pub const RESERVED_COLUMNS: [&str; 3] = ["line", "rowid", "reason"];

/// Map trimmed source headers onto schema fields, order-independently.
/// Exact normalized matches are settled for every field first; the remaining fields then take
/// the first unused header that contains (or is contained in) the field name.
/// Each source column is used at most once.
pub fn map_headers(headers: &[String], schema: &SchemaDescriptor) -> HeaderMapping {
    let norm: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();
    let mut used = vec![false; headers.len()];
    let mut hits: Vec<Option<usize>> = vec![None; schema.fields.len()];
    let wanted: Vec<String> = schema.fields.iter().map(|f| normalize_header(&f.name)).collect();

    for (slot, want) in hits.iter_mut().zip(&wanted) {
        if let Some(i) = (0..norm.len()).find(|&i| !used[i] && norm[i] == *want) {
            used[i] = true;
            *slot = Some(i);
        }
    }
    for (slot, want) in hits.iter_mut().zip(&wanted) {
        if slot.is_some() {
            continue;
        }
        let partial = (0..norm.len()).find(|&i| {
            let h = &norm[i];
            !used[i]
                && !h.is_empty()
                && !RESERVED_COLUMNS.contains(&h.as_str())
                && (h.contains(want.as_str()) || want.contains(h.as_str()))
        });
        if let Some(i) = partial {
            used[i] = true;
            *slot = Some(i);
        }
    }

    let mut mapping = HeaderMapping::default();
    for (field, hit) in schema.fields.iter().zip(hits) {
        match hit {
            Some(i) => mapping.columns.push((i, field.name.clone())),
            None => mapping.missing_fields.push(field.name.clone()),
        }
    }

    mapping.unmapped_source = headers
        .iter()
        .zip(&used)
        .filter(|(_, u)| !**u)
        .map(|(h, _)| h.trim().to_string())
        .collect();
    mapping.columns.sort_by_key(|(i, _)| *i);
    mapping
}
