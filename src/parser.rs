//! Streaming parser: decodes one source file into byte-sized chunks of validated rows,
//! routing invalid rows to the quarantine side of each batch.

use crate::chunk::Chunk;
use crate::schema::{map_headers, SchemaDescriptor};
use crate::source::{open_source, source_name};
use crate::validate::{RowError, RowValidator};
use anyhow::{bail, Context, Result};
use std::io::Read;
use std::path::{Path, PathBuf};

/// What one call to [`ChunkParser::next_batch`] produced.
#[derive(Debug)]
pub struct ParsedBatch {
    /// `None` when every row read for this batch was quarantined.
    pub chunk: Option<Chunk>,
    pub quarantined: Vec<RowError>,
    pub rows_read: u64,
}

pub struct ChunkParser {
    path: PathBuf,
    file: String,
    reader: csv::Reader<Box<dyn Read + Send>>,
    validator: RowValidator,
    chunk_bytes: u64,
    next_ordinal: u64,
    record: csv::ByteRecord,
    done: bool,
}

impl ChunkParser {
    /// Open `path` and read its header row. Fails only if the source cannot be opened or read.
    pub fn open(
        path: &Path,
        delimiter: char,
        schema: &SchemaDescriptor,
        chunk_bytes: u64,
        read_buf_bytes: usize,
    ) -> Result<Self> {
        if !delimiter.is_ascii() {
            bail!("delimiter {delimiter:?} is not a single-byte character");
        }
        let file = source_name(path);
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter as u8)
            .has_headers(true)
            .flexible(true)
            .double_quote(true)
            .from_reader(open_source(path, read_buf_bytes)?);

        let headers: Vec<String> = reader
            .byte_headers()
            .with_context(|| format!("read header row of {}", path.display()))?
            .iter()
            .map(|h| String::from_utf8_lossy(h).trim().to_string())
            .collect();

        let mapping = map_headers(&headers, schema);
        if !mapping.missing_fields.is_empty() {
            tracing::warn!(file = %file, "no column for schema field(s): {}", mapping.missing_fields.join(", "));
        }
        if !mapping.unmapped_source.is_empty() {
            tracing::debug!(file = %file, "ignoring column(s): {}", mapping.unmapped_source.join(", "));
        }

        Ok(Self {
            path: path.to_path_buf(),
            validator: RowValidator::new(file.clone(), schema.clone(), mapping),
            file,
            reader,
            chunk_bytes: chunk_bytes.max(1),
            next_ordinal: 0,
            record: csv::ByteRecord::new(),
            done: false,
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file
    }

    /// Identify this source's rows and chunks as `name` instead of its base name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.file = name.into();
        self.validator.rename(self.file.clone());
        self
    }

    /// Source bytes consumed so far (decoded bytes for compressed sources).
    pub fn bytes_consumed(&self) -> u64 {
        self.reader.position().byte()
    }

    /// Read records until `chunk_bytes` of source have been consumed or the input ends.
    /// Returns `Ok(None)` once the input is exhausted.
    pub fn next_batch(&mut self) -> Result<Option<ParsedBatch>> {
        if self.done {
            return Ok(None);
        }
        let start = self.bytes_consumed();
        let mut rows = Vec::new();
        let mut quarantined = Vec::new();
        let mut rows_read = 0u64;

        loop {
            let more = self
                .reader
                .read_byte_record(&mut self.record)
                .with_context(|| format!("read {}", self.path.display()))?;
            if !more {
                self.done = true;
                break;
            }
            let line = self.record.position().map_or(0, |p| p.line());
            let values: Vec<std::borrow::Cow<'_, str>> = self.record.iter().map(String::from_utf8_lossy).collect();
            let raw = self.validator.field_map(values.iter().map(|v| v.as_ref()));
            match self.validator.check(line, raw) {
                Ok(row) => rows.push(row),
                Err(e) => quarantined.push(e),
            }
            rows_read += 1;
            if self.bytes_consumed() - start >= self.chunk_bytes {
                break;
            }
        }

        if rows_read == 0 {
            return Ok(None);
        }
        let source_bytes = self.bytes_consumed() - start;
        let chunk = if rows.is_empty() {
            None
        } else {
            let c = Chunk::new(self.file.clone(), self.next_ordinal, rows, source_bytes);
            self.next_ordinal += 1;
            Some(c)
        };
        Ok(Some(ParsedBatch { chunk, quarantined, rows_read }))
    }
}

impl Iterator for ChunkParser {
    type Item = Result<ParsedBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_batch() {
            Ok(Some(b)) => Some(Ok(b)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
