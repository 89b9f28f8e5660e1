use std::collections::BTreeMap;
use std::time::Duration;

/// User-facing options with sensible defaults and builder chaining.
#[derive(Clone, Debug)]
pub struct IngestOptions {
    pub concurrency: usize,              // max outstanding uploader calls, row retries included
    pub chunk_bytes: u64,                // source bytes per chunk
    pub delimiter_override: Option<char>,
    pub poll_interval: Duration,         // reconciliation polling cadence
    pub max_poll_errors: u32,            // consecutive poll failures tolerated before the job fails
    pub progress: bool,                  // show progress bars
    pub progress_label: Option<String>,  // optional label for progress bars
    pub labels: BTreeMap<String, String>, // passed to every upload call (plot, census, ...)

    // IO tuning
    pub read_buffer_bytes: usize,        // BufReader capacity
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            concurrency: 3,
            chunk_bytes: 256 * 1024,
            delimiter_override: None,
            poll_interval: Duration::from_secs(2),
            max_poll_errors: 5,
            progress: true,
            progress_label: None,
            labels: BTreeMap::new(),
            read_buffer_bytes: 256 * 1024,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring {key}={raw:?}: not a valid value");
            None
        }
    }
}

impl IngestOptions {
    /// Defaults overridden by `FIELDINGEST_CONCURRENCY`, `FIELDINGEST_CHUNK_BYTES` and `FIELDINGEST_POLL_MS`.
    pub fn from_env() -> Self {
        let mut o = Self::default();
        if let Some(n) = env_parse::<usize>("FIELDINGEST_CONCURRENCY") {
            o = o.with_concurrency(n);
        }
        if let Some(n) = env_parse::<u64>("FIELDINGEST_CHUNK_BYTES") {
            o = o.with_chunk_bytes(n);
        }
        if let Some(ms) = env_parse::<u64>("FIELDINGEST_POLL_MS") {
            o = o.with_poll_interval(Duration::from_millis(ms));
        }
        o
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }
    pub fn with_chunk_bytes(mut self, bytes: u64) -> Self {
        self.chunk_bytes = bytes.max(1);
        self
    }
    pub fn with_delimiter(mut self, delim: char) -> Self {
        self.delimiter_override = Some(delim);
        self
    }
    pub fn with_poll_interval(mut self, every: Duration) -> Self {
        self.poll_interval = every;
        self
    }
    pub fn with_max_poll_errors(mut self, n: u32) -> Self {
        self.max_poll_errors = n;
        self
    }
    pub fn with_progress(mut self, yes: bool) -> Self {
        self.progress = yes;
        self
    }
    pub fn with_progress_label(mut self, label: impl Into<String>) -> Self {
        self.progress_label = Some(label.into());
        self
    }
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    // IO buffers tuning
    pub fn with_io_read_buffer(mut self, bytes: usize) -> Self {
        self.read_buffer_bytes = bytes.max(8 * 1024);
        self
    }
}
