mod config;
mod date;
mod source;
mod util;

mod delimiter;
mod schema;
mod validate;
mod parser;

mod chunk;
mod flow;
mod counters;
mod quarantine;
mod scheduler;
mod retry;
mod progress;
mod reconcile;
mod pipeline;

mod ndjson;
mod staging;

pub use crate::config::IngestOptions;
pub use crate::pipeline::{CancelHandle, IngestJob, JobStatus, JobSummary};

// schema, validation and date normalization
pub use crate::schema::{map_headers, normalize_header, FieldSpec, FieldTransform, HeaderMapping, SchemaDescriptor};
pub use crate::validate::{is_sentinel, Row, RowError, RowId, RowValidator, SENTINELS};
pub use crate::date::{normalize_date, parse_canonical, parse_flexible};

// delimiter inference, exposed for preview screens and the CLI
pub use crate::delimiter::{
    analyze_delimiter, detect_delimiter, resolve_delimiter, split_quoted, validate_delimiter, DelimiterCache,
    DelimiterProfile, DelimiterValidation, FileIdentity, CANDIDATES, SAMPLE_BYTES,
};
pub use crate::source::{open_source, read_sample, source_name};
pub use crate::parser::{ChunkParser, ParsedBatch};

// upload machinery
pub use crate::chunk::{Chunk, ChunkState, UploadAttempt, UploadUnit};
pub use crate::flow::{FlowGate, InFlightGuard, PauseGuard};
pub use crate::counters::{CounterSnapshot, JobCounters};
pub use crate::quarantine::{export_csv, Quarantine, QuarantineMap};
pub use crate::scheduler::{run_pool, ChunkOutcome, Dispatcher, Submitter, UploadContext, Uploader};
pub use crate::retry::RetryManager;

// progress and reconciliation
pub use crate::progress::{
    set_global_multiprogress, BarProgress, Eta, NoProgress, ProgressObserver, ProgressSnapshot, ReconcileEstimator,
    ReconcileSnapshot, UploadEstimator, UploadProgress,
};
pub use crate::reconcile::{Poller, ReconcileHandle, ReconcileReport, ReconciliationService};

// file-backed staging sink
pub use crate::staging::{NdjsonStagingUploader, StagedRow, StagingReconciler, StagingSummary};
pub use crate::ndjson::{NdjsonReader, NdjsonWriter};

// logging and robust file ops, so binaries can import from crate root
pub use crate::util::{init_tracing_once, open_with_backoff, create_with_backoff, replace_file_atomic_backoff};
