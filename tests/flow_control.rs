use fieldingest::{run_pool, Chunk, ChunkState, FlowGate, JobCounters};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

/// Pauses nest: intake resumes only after the last guard is dropped.
#[test]
fn pause_is_counting() {
    let gate = FlowGate::new();
    let a = gate.pause();
    let b = gate.pause();
    drop(a);
    assert!(gate.is_paused());
    drop(b);
    assert!(!gate.is_paused());
}

/// `acquire` blocks while paused and proceeds as soon as the pause is lifted.
#[test]
fn acquire_waits_for_resume() {
    let gate = FlowGate::new();
    let pause = gate.pause();
    let (tx, rx) = mpsc::channel();

    std::thread::scope(|s| {
        s.spawn(|| {
            let _slot = gate.acquire();
            tx.send(()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err(), "acquired while paused");
        assert_eq!(gate.in_flight(), 0);
        drop(pause);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    });
    assert_eq!(gate.in_flight(), 0);
}

/// `drain` returns only once every in-flight guard is gone.
#[test]
fn drain_waits_for_in_flight() {
    let gate = FlowGate::new();
    let slot = gate.acquire();
    let released = AtomicUsize::new(0);

    std::thread::scope(|s| {
        s.spawn(|| {
            std::thread::sleep(Duration::from_millis(50));
            released.store(1, Ordering::SeqCst);
            drop(slot);
        });
        gate.drain();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    });
}

/// Only the documented lifecycle edges are accepted.
#[test]
fn chunk_lifecycle_rejects_illegal_transitions() {
    let mut c = Chunk::new("f.csv", 0, Vec::new(), 0);
    assert!(c.transition(ChunkState::Succeeded).is_err());
    c.transition(ChunkState::InFlight).unwrap();
    c.transition(ChunkState::Failed).unwrap();
    assert!(c.transition(ChunkState::Succeeded).is_err(), "failed chunks never succeed directly");
    c.transition(ChunkState::Retried).unwrap();
    assert!(c.state().is_terminal());
    assert!(c.transition(ChunkState::InFlight).is_err());
}

/// The pool hands every submitted chunk to exactly one worker and never runs more than its size.
#[test]
fn pool_delivers_each_chunk_once() {
    let active = AtomicUsize::new(0);
    let peak = AtomicUsize::new(0);
    let handled = AtomicUsize::new(0);

    let submitted = run_pool(
        4,
        |sub| {
            for i in 0..20 {
                sub.submit(Chunk::new("pool.csv", i, Vec::new(), 0))?;
            }
            Ok(20)
        },
        |_chunk| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            active.fetch_sub(1, Ordering::SeqCst);
            handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    )
    .unwrap();

    assert_eq!(submitted, 20);
    assert_eq!(handled.load(Ordering::SeqCst), 20);
    assert!(peak.load(Ordering::SeqCst) <= 4);
}

/// A worker error surfaces from the pool after the producer finishes.
#[test]
fn pool_reports_worker_errors() {
    let out = run_pool(
        2,
        |sub| {
            for i in 0..3 {
                sub.submit(Chunk::new("bad.csv", i, Vec::new(), 0))?;
            }
            Ok(())
        },
        |chunk| {
            if chunk.ordinal == 1 {
                anyhow::bail!("chunk {} broke", chunk.ordinal);
            }
            Ok(())
        },
    );
    assert!(format!("{:#}", out.unwrap_err()).contains("chunk 1 broke"));
}

/// Totals follow the estimate while parsing and become exact afterwards.
#[test]
fn chunk_total_tracks_estimate_then_produced() {
    let c = JobCounters::new(5);
    c.chunk_produced();
    c.chunk_produced();
    assert_eq!(c.chunks_total(), 5);
    for _ in 0..4 {
        c.chunk_produced();
    }
    assert_eq!(c.chunks_total(), 6);
    c.finish_parse();
    assert_eq!(c.chunks_total(), 6);

    c.add_read(10);
    c.add_uploaded(7);
    c.add_quarantined(1);
    let s = c.snapshot();
    assert_eq!(s.rows_pending, 2);
}
