//! Delimiter inference over a content sample, a header/preview sanity check,
//! and a small bounded cache keyed by file identity.

use crate::schema::normalize_header;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::OnceLock;
use std::time::SystemTime;

/// Delimiters considered by inference, in tie-break order.
pub const CANDIDATES: [char; 4] = [',', '\t', ';', '|'];
/// How much of the head of a file is read for inference.
pub const SAMPLE_BYTES: usize = 20 * 1024;
const SAMPLE_LINES: usize = 10;
const PREVIEW_LINES: usize = 5;
const MIN_CONFIDENCE: f64 = 50.0;
const CACHE_CAPACITY: usize = 50;

/// Result of analyzing a sample against one delimiter.
#[derive(Clone, Debug, PartialEq)]
pub struct DelimiterProfile {
    pub delimiter: char,
    /// 0..=100
    pub confidence: f64,
    pub sample_rows: usize,
    pub avg_columns: f64,
}

/// Split one line on `delim`, honoring `"` quoting.
/// Inside quotes the delimiter is literal and `""` is a single literal quote.
/// Fields are trimmed; the enclosing quotes are not part of the value.
pub fn split_quoted(line: &str, delim: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    cur.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                cur.push(c);
            }
        } else if c == '"' {
            in_quotes = true;
        } else if c == delim {
            fields.push(cur.trim().to_string());
            cur.clear();
        } else {
            cur.push(c);
        }
    }
    fields.push(cur.trim().to_string());
    fields
}

fn variance(xs: &[usize]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<usize>() as f64 / n;
    xs.iter().map(|&x| (x as f64 - mean).powi(2)).sum::<f64>() / n
}

fn sample_lines(sample: &str, n: usize) -> Vec<&str> {
    sample.split('\n').take(n).map(|l| l.strip_suffix('\r').unwrap_or(l)).collect()
}

/// Score how well `delim` explains `lines`.
pub fn analyze_delimiter(lines: &[&str], delim: char) -> DelimiterProfile {
    let counts: Vec<usize> = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| split_quoted(l, delim).len())
        .filter(|&n| n > 1)
        .collect();

    if counts.is_empty() {
        return DelimiterProfile { delimiter: delim, confidence: 0.0, sample_rows: 0, avg_columns: 0.0 };
    }

    let valid = counts.len() as f64;
    let avg = counts.iter().sum::<usize>() as f64 / valid;
    let consistency = (1.0 - variance(&counts) / avg.max(1.0)).max(0.0);
    let volume = (valid / lines.len().max(1) as f64).min(1.0);
    let column = (avg / 10.0).min(1.0);

    DelimiterProfile {
        delimiter: delim,
        confidence: 100.0 * (0.6 * consistency + 0.2 * volume + 0.2 * column),
        sample_rows: counts.len(),
        avg_columns: avg,
    }
}

/// Pick the best-scoring candidate for `sample`. Ties go to the earlier candidate.
pub fn detect_delimiter(sample: &str) -> DelimiterProfile {
    let lines = sample_lines(sample, SAMPLE_LINES);
    let mut best = analyze_delimiter(&lines, CANDIDATES[0]);
    for &d in &CANDIDATES[1..] {
        let p = analyze_delimiter(&lines, d);
        if p.confidence > best.confidence {
            best = p;
        }
    }
    best
}

/// Inference with the user's override applied and the low-confidence comma fallback.
pub fn resolve_delimiter(sample: &str, user_override: Option<char>) -> DelimiterProfile {
    if let Some(d) = user_override {
        return analyze_delimiter(&sample_lines(sample, SAMPLE_LINES), d);
    }
    let best = detect_delimiter(sample);
    if best.confidence <= MIN_CONFIDENCE && best.delimiter != ',' {
        tracing::debug!(
            "delimiter {:?} scored {:.1}; falling back to comma",
            best.delimiter,
            best.confidence
        );
        return analyze_delimiter(&sample_lines(sample, SAMPLE_LINES), ',');
    }
    best
}

// ----------------------------- Validation preview ----------------------------------

/// Outcome of checking a chosen delimiter against the head of a file.
#[derive(Clone, Debug, PartialEq)]
pub struct DelimiterValidation {
    pub is_valid: bool,
    pub delimiter: char,
    pub issues: Vec<String>,
    /// Header row followed by up to four data rows, split with `delimiter`.
    pub preview: Vec<Vec<String>>,
}

/// Check that `delim` yields a sane header and consistent data rows over the first lines of `sample`.
pub fn validate_delimiter(sample: &str, delim: char, expected_headers: &[String]) -> DelimiterValidation {
    let lines: Vec<&str> = sample_lines(sample, PREVIEW_LINES);
    let mut issues = Vec::new();
    let mut preview = Vec::new();

    if sample.trim().is_empty() {
        return DelimiterValidation {
            is_valid: false,
            delimiter: delim,
            issues: vec!["file appears to be empty".to_string()],
            preview,
        };
    }

    let header_line = lines[0].trim();
    if header_line.is_empty() {
        issues.push("first row is empty or contains only whitespace".to_string());
    }
    let headers = split_quoted(header_line, delim);

    if !expected_headers.is_empty() {
        let have: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();
        let missing: Vec<&str> = expected_headers
            .iter()
            .filter(|e| {
                let e = normalize_header(e);
                !have.iter().any(|h| !h.is_empty() && (h.contains(&e) || e.contains(h.as_str())))
            })
            .map(|e| e.as_str())
            .collect();
        if !missing.is_empty() {
            issues.push(format!("missing expected headers: {}", missing.join(", ")));
        }
        if (headers.len() as f64) < expected_headers.len() as f64 * 0.7 {
            issues.push(format!(
                "too few columns detected ({}) compared to expected ({})",
                headers.len(),
                expected_headers.len()
            ));
        }
    }

    let mut counts = Vec::new();
    for (i, line) in lines.iter().enumerate().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let cols = split_quoted(line, delim);
        if cols.len() != headers.len() {
            issues.push(format!("row {} has {} columns, expected {}", i + 1, cols.len(), headers.len()));
        }
        counts.push(cols.len());
        preview.push(cols);
    }
    if variance(&counts) > 1.0 {
        issues.push("inconsistent number of columns across rows".to_string());
    }
    preview.insert(0, headers);

    DelimiterValidation { is_valid: issues.is_empty(), delimiter: delim, issues, preview }
}

// ----------------------------- Cache ----------------------------------

/// Identity of a source file as seen by the cache: name, size, and modification time.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    pub name: String,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

impl FileIdentity {
    pub fn of(path: &std::path::Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self {
            name: path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
            size: meta.len(),
            modified: meta.modified().ok(),
        })
    }
}

struct CacheInner {
    map: HashMap<FileIdentity, DelimiterProfile>,
    order: VecDeque<FileIdentity>,
}

/// Bounded profile cache; inserting past capacity evicts the oldest entry.
pub struct DelimiterCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

static GLOBAL_CACHE: OnceLock<DelimiterCache> = OnceLock::new();

impl DelimiterCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner { map: HashMap::new(), order: VecDeque::new() }),
        }
    }

    /// Process-wide cache shared by every job in this process.
    pub fn global() -> &'static DelimiterCache {
        GLOBAL_CACHE.get_or_init(|| DelimiterCache::new(CACHE_CAPACITY))
    }

    pub fn get(&self, key: &FileIdentity) -> Option<DelimiterProfile> {
        self.inner.lock().map.get(key).cloned()
    }

    pub fn insert(&self, key: FileIdentity, profile: DelimiterProfile) {
        let mut inner = self.inner.lock();
        if inner.map.insert(key.clone(), profile).is_none() {
            inner.order.push_back(key);
        }
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.map.remove(&oldest);
            }
        }
    }

    /// Return the cached profile for `key`, computing and caching it on a miss.
    pub fn get_or_insert_with(&self, key: FileIdentity, compute: impl FnOnce() -> DelimiterProfile) -> DelimiterProfile {
        if let Some(p) = self.get(&key) {
            return p;
        }
        let p = compute();
        self.insert(key, p.clone());
        p
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
