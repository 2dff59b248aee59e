/// End-to-end worker pool tests at realistic batch sizes.
///
/// The pool is the one place where every unit of work in a comparison is
/// scheduled, so these tests check its guarantees with thousands of units
/// rather than the handful used by the unit tests.
use diffsleuth_core::pool::{CancelToken, PoolConfig, UnitOutcome, WorkUnit, WorkerPool};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// ── Helpers ──────────────────────────────────────────────────────────────────

const UNITS: usize = 10_000;
const WORKERS: usize = 4;
const STUCK_UNIT: usize = 4_321;

/// Track how many units are running at once and the highest value seen.
#[derive(Default)]
struct Gauge {
    active: AtomicUsize,
    peak: AtomicUsize,
    runs: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A unit that sleeps in small steps until it is cancelled or `total` passes.
fn stuck_unit(gauge: Arc<Gauge>, total: Duration) -> WorkUnit<usize, String> {
    WorkUnit::new("stuck", move |token: &CancelToken| {
        gauge.enter();
        let start = Instant::now();
        while start.elapsed() < total && !token.is_cancelled() {
            thread::sleep(Duration::from_millis(5));
        }
        gauge.leave();
        Ok(STUCK_UNIT)
    })
    .with_timeout(Some(Duration::from_millis(100)))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// 10 000 units on 4 workers: every unit reports exactly once, the cap holds,
/// and the one timed-out unit does not fail or block any other.
#[test]
fn ten_thousand_units_with_one_timeout() {
    let gauge = Arc::new(Gauge::default());

    let units: Vec<WorkUnit<usize, String>> = (0..UNITS)
        .map(|i| {
            if i == STUCK_UNIT {
                return stuck_unit(gauge.clone(), Duration::from_secs(10));
            }
            let gauge = gauge.clone();
            WorkUnit::new(format!("unit-{i}"), move |_: &CancelToken| {
                gauge.enter();
                let value = i * 2;
                gauge.leave();
                Ok(value)
            })
        })
        .collect();

    let start = Instant::now();
    let reports = WorkerPool::new(PoolConfig::with_workers(WORKERS)).run(units, &CancelToken::new());

    assert!(
        start.elapsed() < Duration::from_secs(10),
        "the stuck unit held up the run for {:?}",
        start.elapsed()
    );
    assert_eq!(reports.len(), UNITS);

    let indices: HashSet<usize> = reports.iter().map(|r| r.index).collect();
    assert_eq!(indices.len(), UNITS, "every unit must report exactly once");

    let mut completed = 0;
    for report in &reports {
        match &report.outcome {
            UnitOutcome::Completed(value) => {
                assert_eq!(*value, report.index * 2);
                completed += 1;
            }
            UnitOutcome::TimedOut(_) => assert_eq!(report.index, STUCK_UNIT),
            other => panic!("unit {} ended as {other:?}", report.index),
        }
    }
    assert_eq!(completed, UNITS - 1);
    assert_eq!(gauge.runs.load(Ordering::SeqCst), UNITS);
    // The abandoned unit may still be winding down while a replacement
    // worker runs, so the cap can be exceeded by at most that one unit.
    assert!(gauge.peak.load(Ordering::SeqCst) <= WORKERS + 1);
}

/// Cancelling mid-run reports every unit once and returns promptly.
#[test]
fn global_cancel_mid_run() {
    let started = Arc::new(AtomicUsize::new(0));
    let cancel = CancelToken::new();

    let units: Vec<WorkUnit<(), String>> = (0..1_000)
        .map(|i| {
            let started = started.clone();
            WorkUnit::new(format!("unit-{i}"), move |token: &CancelToken| {
                started.fetch_add(1, Ordering::SeqCst);
                while !token.is_cancelled() {
                    thread::sleep(Duration::from_millis(5));
                }
                Err("cancelled".to_string())
            })
        })
        .collect();

    let trigger = cancel.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        trigger.cancel();
    });

    let start = Instant::now();
    let reports = WorkerPool::new(PoolConfig::with_workers(WORKERS)).run(units, &cancel);
    canceller.join().unwrap();

    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(reports.len(), 1_000);
    assert!(started.load(Ordering::SeqCst) <= WORKERS * 2);
    assert!(reports
        .iter()
        .all(|r| matches!(r.outcome, UnitOutcome::Cancelled | UnitOutcome::Failed(_))));
}
