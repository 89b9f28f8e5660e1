#[path = "common/mod.rs"]
mod common;

use common::*;
use fieldingest::{Eta, IngestJob, IngestOptions, JobStatus, NoProgress};
use std::sync::atomic::Ordering;
use std::time::Duration;

fn job(dir: &std::path::Path, name: &str, rows: usize) -> IngestJob {
    let path = write_file(dir, name, &tree_csv(rows, ','));
    IngestJob::new(tree_schema()).file(path).progress(false).poll_interval(Duration::from_millis(1))
}

/// One chunk of ten rows with two poisoned rows: the chunk fails once, then every row is sent
/// alone exactly once. Eight land, two are quarantined with the uploader's message.
#[test]
fn poisoned_rows_are_isolated_by_decomposition() {
    let dir = tempfile::tempdir().unwrap();
    let uploader = MockUploader::new().poison(&["T003", "T007"]);
    let reconciler = ScriptedReconciler::completing();

    let summary = job(dir.path(), "poisoned.csv", 10).run(&uploader, &reconciler).unwrap();

    assert_eq!(summary.status, JobStatus::Complete);
    assert_eq!(summary.total_rows, 10);
    assert_eq!(summary.uploaded, 8);
    assert_eq!(summary.quarantined_rows(), 2);
    assert_eq!(summary.pending_rows(), 0);
    assert_eq!(summary.chunks, 1);
    assert_eq!(uploader.calls.load(Ordering::SeqCst), 11, "one chunk call plus ten row calls");

    let accepted = uploader.accepted_tags();
    assert_eq!(accepted.len(), 8);
    assert!(!accepted.contains(&"T003".to_string()));

    let errors = &summary.quarantined["poisoned.csv"];
    let mut tags: Vec<&str> = errors.values().map(|e| e.fields["tag"].as_str()).collect();
    tags.sort();
    assert_eq!(tags, vec!["T003", "T007"]);
    assert!(errors.values().all(|e| e.reason.contains("poisoned")));
}

/// Ten slow single-row chunks under a limit of three never have more than three sends in flight.
#[test]
fn concurrency_is_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let uploader = MockUploader::new().latency(Duration::from_millis(40));
    let reconciler = ScriptedReconciler::completing();

    let summary = job(dir.path(), "bounded.csv", 10)
        .concurrency(3)
        .chunk_bytes(1)
        .run(&uploader, &reconciler)
        .unwrap();

    assert_eq!(summary.chunks, 10);
    assert_eq!(summary.uploaded, 10);
    assert!(uploader.peak() <= 3, "peak {} exceeds limit", uploader.peak());
    assert!(uploader.peak() >= 2, "uploads never overlapped");
}

/// Row-level retries count against the same limit as chunk uploads.
#[test]
fn retries_stay_within_the_limit() {
    let dir = tempfile::tempdir().unwrap();
    let uploader = MockUploader::new().latency(Duration::from_millis(5)).poison(&["T002", "T011", "T019"]);
    let reconciler = ScriptedReconciler::completing();

    let summary = job(dir.path(), "retries.csv", 24)
        .concurrency(2)
        .chunk_bytes(100)
        .run(&uploader, &reconciler)
        .unwrap();

    assert!(uploader.peak() <= 2, "peak {}", uploader.peak());
    assert_eq!(summary.uploaded, 21);
    assert_eq!(summary.quarantined_rows(), 3);
    assert_eq!(summary.uploaded + summary.quarantined_rows(), summary.total_rows);
}

/// Every snapshot conserves rows, completed chunks never go backwards, and never pass the total.
#[test]
fn progress_is_monotonic_and_conserving() {
    let dir = tempfile::tempdir().unwrap();
    let uploader = MockUploader::new().latency(Duration::from_millis(2)).poison(&["T005"]);
    let reconciler = ScriptedReconciler::completing();
    let observer = RecordingObserver::default();

    let summary = job(dir.path(), "progress.csv", 30)
        .concurrency(3)
        .chunk_bytes(64)
        .run_observed(&uploader, &reconciler, &observer)
        .unwrap();

    let snaps = observer.uploads.lock().unwrap().clone();
    assert!(!snaps.is_empty());
    let mut last = 0;
    for s in &snaps {
        let c = s.counters;
        assert_eq!(c.rows_uploaded + c.rows_quarantined + c.rows_pending, c.rows_read);
        assert!(c.chunks_completed >= last, "completed went from {last} to {}", c.chunks_completed);
        assert!(c.chunks_completed <= c.chunks_total);
        assert_ne!(s.eta, Eta::Calculating, "a snapshot follows at least one completion");
        last = c.chunks_completed;
    }
    let final_snap = snaps.last().unwrap().counters;
    assert_eq!(final_snap.chunks_completed, final_snap.chunks_total);
    assert_eq!(final_snap.rows_pending, 0);
    assert_eq!(final_snap.rows_read, summary.total_rows);
}

/// Reconciliation starts only after the last upload, and the job completes after the poll reaching 100.
#[test]
fn reconciliation_waits_for_uploads() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::default();
    let uploader = MockUploader::new().latency(Duration::from_millis(10)).log(log.clone());
    let reconciler = ScriptedReconciler::new(vec![Ok(10), Ok(55), Ok(100)]).log(log.clone());
    let observer = RecordingObserver::default();

    let summary = job(dir.path(), "gated.csv", 12)
        .concurrency(3)
        .chunk_bytes(40)
        .run_observed(&uploader, &reconciler, &observer)
        .unwrap();

    let last_upload = log.last_index_of("upload").unwrap();
    assert!(last_upload < log.first_index_of("staged").unwrap());
    assert!(log.first_index_of("trigger").unwrap() < log.first_index_of("poll").unwrap());
    assert_eq!(log.last_index_of("rollup"), Some(log.events().len() - 1));

    let report = summary.reconcile.unwrap();
    assert_eq!(report.polls, 3);
    let percents: Vec<u8> = observer.reconciles.lock().unwrap().iter().map(|s| s.percent).collect();
    assert_eq!(percents, vec![10, 55, 100]);
}

/// Transient poll failures are tolerated; a run of them beyond the limit fails the job.
#[test]
fn poll_errors_are_retried_then_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let uploader = MockUploader::new();
    let flaky = ScriptedReconciler::new(vec![Err("timeout".into()), Err("timeout".into()), Ok(40), Ok(100)]);
    let summary = job(dir.path(), "flaky.csv", 3).run(&uploader, &flaky).unwrap();
    assert_eq!(summary.status, JobStatus::Complete);
    assert_eq!(summary.reconcile.unwrap().polls, 2);

    let down = ScriptedReconciler::new(vec![Ok(20)]);
    let opts = IngestOptions::default()
        .with_progress(false)
        .with_poll_interval(Duration::from_millis(1))
        .with_max_poll_errors(2);
    let err = IngestJob::new(tree_schema())
        .file(write_file(dir.path(), "down.csv", &tree_csv(3, ',')))
        .options(opts)
        .run(&uploader, &down)
        .unwrap_err();
    assert!(format!("{err:#}").contains("backend unavailable"), "{err:#}");
    assert!(down.log.first_index_of("rollup").is_none());
}

/// A failed trigger is fatal; zero staged rows only warns.
#[test]
fn trigger_failure_is_fatal_but_empty_staging_is_not() {
    let dir = tempfile::tempdir().unwrap();
    let uploader = MockUploader::new();

    let mut refusing = ScriptedReconciler::completing();
    refusing.fail_trigger = true;
    assert!(job(dir.path(), "refused.csv", 2).run(&uploader, &refusing).is_err());
    assert!(refusing.log.first_index_of("poll").is_none());

    let mut empty = ScriptedReconciler::completing();
    empty.staged = 0;
    let summary = job(dir.path(), "empty.csv", 2).run(&uploader, &empty).unwrap();
    assert_eq!(summary.status, JobStatus::Complete);
}

/// Cancelling during upload stops intake, leaves unsent rows pending, and skips reconciliation.
#[test]
fn cancellation_stops_before_reconciliation() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), "cancelled.csv", 10).concurrency(1).chunk_bytes(1);
    let uploader = MockUploader::new().cancel_on_first_call(job.cancel_handle());
    let reconciler = ScriptedReconciler::completing();

    let summary = job.run_observed(&uploader, &reconciler, &NoProgress).unwrap();

    assert_eq!(summary.status, JobStatus::Cancelled);
    assert_eq!(summary.uploaded, 1);
    assert!(summary.total_rows < 10);
    assert_eq!(summary.pending_rows(), summary.total_rows - 1);
    assert!(summary.reconcile.is_none());
    assert!(reconciler.log.events().is_empty());
}

/// A job cancelled before it starts reads nothing.
#[test]
fn cancel_before_start() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), "early.csv", 5);
    job.cancel_handle().cancel();
    let uploader = MockUploader::new();
    let summary = job.run(&uploader, &ScriptedReconciler::completing()).unwrap();
    assert_eq!(summary.status, JobStatus::Cancelled);
    assert_eq!(summary.total_rows, 0);
    assert_eq!(uploader.calls.load(Ordering::SeqCst), 0);
}

/// Labels and the schema name reach the uploader.
#[test]
fn upload_context_carries_labels() {
    use fieldingest::{Row, UploadContext, Uploader};
    use std::sync::Mutex;

    #[derive(Default)]
    struct ContextProbe(Mutex<Vec<UploadContext>>);
    impl Uploader for ContextProbe {
        fn send(&self, ctx: &UploadContext, _rows: &[Row]) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(ctx.clone());
            Ok(())
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let probe = ContextProbe::default();
    job(dir.path(), "labelled.csv", 2)
        .label("plot", "BCI")
        .label("census", "8")
        .run(&probe, &ScriptedReconciler::completing())
        .unwrap();

    let seen = probe.0.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].schema, "trees");
    assert_eq!(seen[0].file_name, "labelled.csv");
    assert_eq!(seen[0].labels["plot"], "BCI");
    assert_eq!(seen[0].labels["census"], "8");
}

/// Files sharing a base name in different directories keep separate row ids and quarantine
/// buckets, so every row is either uploaded or quarantined.
#[test]
fn same_named_files_are_kept_apart() {
    let dir = tempfile::tempdir().unwrap();
    let body = "tag,species,dbh,measured\nT001,Acer,1,5/4/2023\nT002,,2,5/4/2023\n";
    let a = write_file(&dir.path().join("a"), "plot.csv", body);
    let b = write_file(&dir.path().join("b"), "plot.csv", body);
    let uploader = MockUploader::new();
    let reconciler = ScriptedReconciler::completing();

    let summary = IngestJob::new(tree_schema())
        .files([&a, &b])
        .progress(false)
        .poll_interval(Duration::from_millis(1))
        .run(&uploader, &reconciler)
        .unwrap();

    assert_eq!(summary.status, JobStatus::Complete);
    assert_eq!(summary.total_rows, 4);
    assert_eq!(summary.uploaded, 2);
    assert_eq!(summary.quarantined_rows(), 2);
    assert_eq!(summary.pending_rows(), 0);
    let buckets: Vec<&str> = summary.quarantined.keys().map(|k| k.as_str()).collect();
    assert_eq!(buckets, vec!["plot.csv", "plot.csv#2"]);
    let names: Vec<&str> = summary.delimiters.keys().map(|k| k.as_str()).collect();
    assert_eq!(names, vec!["plot.csv", "plot.csv#2"]);
}

/// A zero chunk budget set directly on the options behaves like a one-byte budget.
#[test]
fn zero_chunk_bytes_in_options_is_clamped() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "zero.csv", &tree_csv(3, ','));
    let mut opts = IngestOptions::default().with_progress(false).with_poll_interval(Duration::from_millis(1));
    opts.chunk_bytes = 0;
    let uploader = MockUploader::new();
    let reconciler = ScriptedReconciler::completing();

    let summary = IngestJob::new(tree_schema()).file(path).options(opts).run(&uploader, &reconciler).unwrap();

    assert_eq!(summary.status, JobStatus::Complete);
    assert_eq!(summary.chunks, 3);
    assert_eq!(summary.uploaded, 3);
}
