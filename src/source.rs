//! Opening source files: plain delimited text, or the same wrapped in a `.zst` frame.

use crate::util::open_with_backoff;
use anyhow::{Context, Result};
use std::io::{BufReader, Read};
use std::path::Path;
use zstd::stream::read::Decoder;

fn is_zstd(path: &Path) -> bool {
    path.extension().map_or(false, |e| e.eq_ignore_ascii_case("zst"))
}

/// Open `path` for streaming, decoding zstd transparently.
pub fn open_source(path: &Path, read_buf_bytes: usize) -> Result<Box<dyn Read + Send>> {
    let file = open_with_backoff(path, 16, 50).with_context(|| format!("open source {}", path.display()))?;
    let cap = read_buf_bytes.max(8 * 1024);
    if is_zstd(path) {
        let mut decoder = Decoder::new(file).with_context(|| format!("zstd header {}", path.display()))?;
        // Large-window frames otherwise fail with "Frame requires too much memory".
        decoder.window_log_max(31)?;
        Ok(Box::new(BufReader::with_capacity(cap, decoder)))
    } else {
        Ok(Box::new(BufReader::with_capacity(cap, file)))
    }
}

/// Decoded text from the head of `path`, at most `max_bytes`. A multi-byte character cut at the
/// boundary is replaced rather than failing the read.
pub fn read_sample(path: &Path, max_bytes: usize) -> Result<String> {
    let reader = open_source(path, 16 * 1024)?;
    let mut buf = Vec::with_capacity(max_bytes);
    reader
        .take(max_bytes as u64)
        .read_to_end(&mut buf)
        .with_context(|| format!("read sample {}", path.display()))?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Display name used for quarantine grouping and upload context: the file name without directories.
pub fn source_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| path.display().to_string())
}
