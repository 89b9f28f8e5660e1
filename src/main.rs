use anyhow::{bail, Context, Result};
use clap::Parser;
use fieldingest::{
    export_csv, init_tracing_once, IngestJob, IngestOptions, JobStatus, NdjsonStagingUploader, SchemaDescriptor,
    StagingReconciler,
};
use std::path::PathBuf;
use std::time::Duration;

/// Ingest delimited field-measurement files into a file-backed staging store.
#[derive(Parser, Debug)]
#[command(name = "fieldingest", version, about)]
struct Args {
    /// Source files (.csv/.tsv/.txt, optionally .zst-compressed)
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Schema descriptor (JSON)
    #[arg(long)]
    schema: PathBuf,

    /// Staging root; receives incoming/, final/ and summary.json
    #[arg(long)]
    staging: PathBuf,

    /// Max concurrent uploads
    #[arg(long, env = "FIELDINGEST_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Source bytes per chunk
    #[arg(long, env = "FIELDINGEST_CHUNK_BYTES")]
    chunk_bytes: Option<u64>,

    /// Force a delimiter instead of inferring one (use `\t` for tab)
    #[arg(long)]
    delimiter: Option<String>,

    /// Reconciliation poll interval in milliseconds
    #[arg(long, env = "FIELDINGEST_POLL_MS")]
    poll_ms: Option<u64>,

    /// Write quarantined rows as <file>.errors.csv into this directory
    #[arg(long)]
    errors_dir: Option<PathBuf>,

    /// Upload label as key=value (repeatable)
    #[arg(long = "label", value_parser = parse_label)]
    labels: Vec<(String, String)>,

    /// Disable progress bars
    #[arg(long)]
    no_progress: bool,
}

fn parse_label(s: &str) -> Result<(String, String), String> {
    let (k, v) = s.split_once('=').ok_or_else(|| format!("expected key=value, got {s:?}"))?;
    Ok((k.trim().to_string(), v.trim().to_string()))
}

fn parse_delimiter(s: &str) -> Result<char> {
    let d = match s {
        "\\t" | "tab" => '\t',
        _ => {
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => c,
                _ => bail!("delimiter must be a single character, got {s:?}"),
            }
        }
    };
    Ok(d)
}

fn main() -> Result<()> {
    init_tracing_once();
    let args = Args::parse();

    let schema = SchemaDescriptor::from_json_file(&args.schema)?;
    let mut opts = IngestOptions::default().with_progress(!args.no_progress).with_progress_label(&schema.name);
    if let Some(n) = args.concurrency {
        opts = opts.with_concurrency(n);
    }
    if let Some(n) = args.chunk_bytes {
        opts = opts.with_chunk_bytes(n);
    }
    if let Some(ms) = args.poll_ms {
        opts = opts.with_poll_interval(Duration::from_millis(ms));
    }
    if let Some(d) = args.delimiter.as_deref() {
        opts = opts.with_delimiter(parse_delimiter(d)?);
    }
    for (k, v) in args.labels {
        opts = opts.with_label(k, v);
    }

    let uploader = NdjsonStagingUploader::new(&args.staging)
        .with_context(|| format!("prepare staging dir {}", args.staging.display()))?;
    let reconciler = StagingReconciler::new(&args.staging);

    let job = IngestJob::new(schema).files(&args.files).options(opts);
    let summary = job.run(&uploader, &reconciler)?;

    println!(
        "{:?}: {} rows read, {} uploaded, {} quarantined, {} chunks in {:.1}s",
        summary.status,
        summary.total_rows,
        summary.uploaded,
        summary.quarantined_rows(),
        summary.chunks,
        summary.elapsed.as_secs_f64()
    );
    for (file, profile) in &summary.delimiters {
        println!("  {file}: delimiter {:?} ({:.0}% confidence)", profile.delimiter, profile.confidence);
    }
    if let Some(dir) = &args.errors_dir {
        for path in export_csv(&summary.quarantined, dir)? {
            println!("  quarantine written to {}", path.display());
        }
    }
    if summary.status == JobStatus::Complete {
        let s = reconciler.read_summary()?;
        println!("  staged rows: {}  dates: {} .. {}", s.rows, s.date_min.as_deref().unwrap_or("-"), s.date_max.as_deref().unwrap_or("-"));
    }
    Ok(())
}
