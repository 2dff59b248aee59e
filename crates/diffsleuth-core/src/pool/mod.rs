//! Bounded worker pool with per-unit timeouts and cooperative cancellation.
//!
//! Units are queued on a `crossbeam` channel and consumed by at most
//! `workers` threads. Each unit reports back over a result channel, and the
//! calling thread acts as the supervisor: it records start times, expires
//! units that exceed their timeout, and watches the run token for a global
//! abort.
//!
//! # Timeouts
//!
//! Rust threads cannot be killed. A unit that overruns is therefore
//! *abandoned*: its token is cancelled (so cooperative code such as
//! [`crate::content::CancellableReader`] stops at the next chunk), it is
//! reported as [`UnitOutcome::TimedOut`], its worker is retired, and a
//! replacement worker is spawned so the remaining units keep the full worker
//! count. Whatever the abandoned unit eventually returns is discarded.
//!
//! # Guarantees
//!
//! Every submitted unit yields exactly one [`UnitReport`], in submission
//! order. Failure or timeout of one unit never cancels its siblings.
pub mod cancel;

pub use cancel::CancelToken;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Upper bound on how long the supervisor sleeps before re-checking the run
/// token, so a global abort is noticed promptly even when no unit reports.
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Pool sizing and default timeout.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of units executing at once.
    pub workers: usize,
    /// Applied to units submitted without their own timeout.
    pub default_timeout: Option<Duration>,
    /// Prefix for worker thread names.
    pub thread_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
            default_timeout: None,
            thread_name: "diffsleuth-worker".into(),
        }
    }
}

impl PoolConfig {
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }
}

type Job<T, E> = Box<dyn FnOnce(&CancelToken) -> Result<T, E> + Send + 'static>;

/// One independent piece of work.
pub struct WorkUnit<T, E> {
    label: String,
    timeout: Option<Duration>,
    job: Job<T, E>,
}

impl<T, E> WorkUnit<T, E> {
    /// Wrap `job`. The job receives its own cancellation token and should
    /// check it at natural boundaries (between reads, between keys).
    pub fn new<F>(label: impl Into<String>, job: F) -> Self
    where
        F: FnOnce(&CancelToken) -> Result<T, E> + Send + 'static,
    {
        Self {
            label: label.into(),
            timeout: None,
            job: Box::new(job),
        }
    }

    /// Set (or clear) this unit's timeout, overriding the pool default.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// How a unit ended.
#[derive(Debug)]
pub enum UnitOutcome<T, E> {
    Completed(T),
    /// The job returned an error.
    Failed(E),
    /// The job panicked; the payload message is preserved.
    Panicked(String),
    /// The job exceeded its timeout and was abandoned.
    TimedOut(Duration),
    /// The run was aborted before or while the job ran.
    Cancelled,
    /// No worker thread was available to run the job.
    Unscheduled(String),
}

impl<T, E: fmt::Display> UnitOutcome<T, E> {
    /// Human-readable reason for any non-completed outcome.
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            Self::Completed(_) => None,
            Self::Failed(e) => Some(e.to_string()),
            Self::Panicked(msg) => Some(format!("panicked: {msg}")),
            Self::TimedOut(limit) => Some(format!("timed out after {limit:?}")),
            Self::Cancelled => Some("cancelled".to_string()),
            Self::Unscheduled(msg) => Some(format!("not scheduled: {msg}")),
        }
    }
}

impl<T, E> UnitOutcome<T, E> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Final record for one submitted unit.
#[derive(Debug)]
pub struct UnitReport<T, E> {
    /// Position in the submitted `Vec`.
    pub index: usize,
    pub label: String,
    pub outcome: UnitOutcome<T, E>,
    /// Time from start of execution to completion (zero if never started).
    pub elapsed: Duration,
}

/// A unit handed to a worker.
struct Dispatch<T, E> {
    index: usize,
    token: CancelToken,
    job: Job<T, E>,
}

/// Messages from workers to the supervisor.
enum Event<T, E> {
    Started {
        index: usize,
        worker: usize,
    },
    Finished {
        index: usize,
        result: thread::Result<Result<T, E>>,
    },
    /// The unit was dequeued after its token had already been cancelled.
    Skipped { index: usize },
}

struct Slot<T, E> {
    label: String,
    timeout: Option<Duration>,
    token: CancelToken,
    started: Option<(Instant, usize)>,
    outcome: Option<UnitOutcome<T, E>>,
    elapsed: Duration,
}

struct Worker {
    handle: Option<thread::JoinHandle<()>>,
    retired: Arc<AtomicBool>,
}

/// Executes batches of [`WorkUnit`]s across a bounded set of threads.
///
/// Each call to [`WorkerPool::run`] spawns its own workers and tears them
/// down before returning, so nested runs (a tree walk that hashes its files
/// through a second run) can never deadlock on a shared queue.
#[derive(Debug, Clone, Default)]
pub struct WorkerPool {
    config: PoolConfig,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        Self { config }
    }

    pub fn workers(&self) -> usize {
        self.config.workers.max(1)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Run all `units` to completion and return one report per unit, in
    /// submission order.
    ///
    /// Cancelling `cancel` aborts the run: queued units are reported as
    /// [`UnitOutcome::Cancelled`] without running, running units see their
    /// token cancelled, and the call returns without waiting for them.
    pub fn run<T, E>(&self, units: Vec<WorkUnit<T, E>>, cancel: &CancelToken) -> Vec<UnitReport<T, E>>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let total = units.len();
        if total == 0 {
            return Vec::new();
        }

        let (job_tx, job_rx) = unbounded::<Dispatch<T, E>>();
        let (event_tx, event_rx) = unbounded::<Event<T, E>>();

        let mut slots: Vec<Slot<T, E>> = Vec::with_capacity(total);
        for (index, unit) in units.into_iter().enumerate() {
            let token = cancel.child();
            slots.push(Slot {
                label: unit.label,
                timeout: unit.timeout.or(self.config.default_timeout),
                token: token.clone(),
                started: None,
                outcome: None,
                elapsed: Duration::ZERO,
            });
            // The receiver is alive for the whole run, so this cannot fail.
            let _ = job_tx.send(Dispatch {
                index,
                token,
                job: unit.job,
            });
        }
        // Everything is queued; workers exit once the queue drains.
        drop(job_tx);

        let initial = self.workers().min(total);
        debug!("Pool run: {total} units on {initial} workers");

        let mut workers: Vec<Worker> = Vec::with_capacity(initial);
        for _ in 0..initial {
            self.spawn_worker(&mut workers, &job_rx, &event_tx);
        }

        let mut remaining = total;
        let mut running: BTreeSet<usize> = BTreeSet::new();
        let mut aborted = false;

        while remaining > 0 {
            if cancel.is_cancelled() {
                // Keep results that already arrived; everything else is cancelled.
                while let Ok(event) = event_rx.try_recv() {
                    apply_event(&mut slots, &mut running, &mut remaining, event);
                }
                for slot in slots.iter_mut().filter(|s| s.outcome.is_none()) {
                    slot.token.cancel();
                    slot.elapsed = slot.started.map(|(at, _)| at.elapsed()).unwrap_or_default();
                    slot.outcome = Some(UnitOutcome::Cancelled);
                }
                debug!("Pool run aborted with {remaining} units outstanding");
                aborted = true;
                break;
            }

            if live_workers(&workers) == 0 {
                warn!("Pool has no live workers; {remaining} units cannot be scheduled");
                for slot in slots.iter_mut().filter(|s| s.outcome.is_none()) {
                    slot.outcome = Some(UnitOutcome::Unscheduled(
                        "no worker thread could be spawned".into(),
                    ));
                }
                aborted = true;
                break;
            }

            let wait = next_wakeup(&slots, &running, Instant::now());
            match event_rx.recv_timeout(wait) {
                Ok(event) => apply_event(&mut slots, &mut running, &mut remaining, event),
                Err(RecvTimeoutError::Timeout) => {}
                // The supervisor holds a sender, so this only happens if the
                // channel itself is torn down.
                Err(RecvTimeoutError::Disconnected) => {
                    for slot in slots.iter_mut().filter(|s| s.outcome.is_none()) {
                        slot.outcome = Some(UnitOutcome::Unscheduled("result channel closed".into()));
                    }
                    aborted = true;
                    break;
                }
            }

            // Expire overdue units.
            let now = Instant::now();
            let overdue: Vec<usize> = running
                .iter()
                .copied()
                .filter(|&i| match (slots[i].started, slots[i].timeout) {
                    (Some((at, _)), Some(limit)) => now.duration_since(at) >= limit,
                    _ => false,
                })
                .collect();

            for index in overdue {
                running.remove(&index);
                remaining -= 1;

                let slot = &mut slots[index];
                let (started_at, worker) = slot.started.unwrap_or((now, usize::MAX));
                let limit = slot.timeout.unwrap_or_default();
                slot.token.cancel();
                slot.elapsed = now.duration_since(started_at);
                slot.outcome = Some(UnitOutcome::TimedOut(limit));
                warn!("Unit '{}' timed out after {:?}", slot.label, limit);

                // Abandon the stuck worker and keep the pool at full strength.
                if let Some(stuck) = workers.get_mut(worker) {
                    stuck.retired.store(true, Ordering::Relaxed);
                    stuck.handle.take();
                }
                if remaining > 0 {
                    self.spawn_worker(&mut workers, &job_rx, &event_tx);
                }
            }
        }

        if !aborted {
            // Every unit is resolved, so non-retired workers are idle on an
            // empty, closed queue and exit immediately.
            for worker in workers.iter_mut() {
                if let Some(handle) = worker.handle.take() {
                    let _ = handle.join();
                }
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| UnitReport {
                index,
                label: slot.label,
                outcome: slot.outcome.unwrap_or(UnitOutcome::Cancelled),
                elapsed: slot.elapsed,
            })
            .collect()
    }

    fn spawn_worker<T, E>(
        &self,
        workers: &mut Vec<Worker>,
        jobs: &Receiver<Dispatch<T, E>>,
        events: &Sender<Event<T, E>>,
    ) where
        T: Send + 'static,
        E: Send + 'static,
    {
        let id = workers.len();
        let retired = Arc::new(AtomicBool::new(false));
        let jobs = jobs.clone();
        let events = events.clone();
        let retired_clone = retired.clone();

        let spawned = thread::Builder::new()
            .name(format!("{}-{id}", self.config.thread_name))
            .spawn(move || worker_loop(id, jobs, events, retired_clone));

        let handle = match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!("Failed to spawn pool worker {id}: {err}");
                None
            }
        };
        workers.push(Worker { handle, retired });
    }
}

fn worker_loop<T, E>(
    id: usize,
    jobs: Receiver<Dispatch<T, E>>,
    events: Sender<Event<T, E>>,
    retired: Arc<AtomicBool>,
) {
    while let Ok(Dispatch { index, token, job }) = jobs.recv() {
        if token.is_cancelled() {
            let _ = events.send(Event::Skipped { index });
            continue;
        }

        let _ = events.send(Event::Started { index, worker: id });
        let result = panic::catch_unwind(AssertUnwindSafe(|| job(&token)));
        let _ = events.send(Event::Finished { index, result });

        if retired.load(Ordering::Relaxed) {
            break;
        }
    }
}

fn apply_event<T, E>(
    slots: &mut [Slot<T, E>],
    running: &mut BTreeSet<usize>,
    remaining: &mut usize,
    event: Event<T, E>,
) {
    match event {
        Event::Started { index, worker } => {
            let slot = &mut slots[index];
            if slot.outcome.is_none() {
                slot.started = Some((Instant::now(), worker));
                running.insert(index);
            }
        }
        Event::Finished { index, result } => {
            let slot = &mut slots[index];
            if slot.outcome.is_some() {
                debug!("Discarding late result for abandoned unit '{}'", slot.label);
                return;
            }
            running.remove(&index);
            slot.elapsed = slot.started.map(|(at, _)| at.elapsed()).unwrap_or_default();
            slot.outcome = Some(match result {
                Ok(Ok(value)) => UnitOutcome::Completed(value),
                Ok(Err(err)) => UnitOutcome::Failed(err),
                Err(payload) => UnitOutcome::Panicked(panic_message(payload.as_ref())),
            });
            *remaining -= 1;
        }
        Event::Skipped { index } => {
            let slot = &mut slots[index];
            if slot.outcome.is_none() {
                slot.outcome = Some(UnitOutcome::Cancelled);
                *remaining -= 1;
            }
        }
    }
}

/// How long the supervisor may block before the next deadline or poll.
fn next_wakeup<T, E>(slots: &[Slot<T, E>], running: &BTreeSet<usize>, now: Instant) -> Duration {
    running
        .iter()
        .filter_map(|&i| {
            let (at, _) = slots[i].started?;
            let limit = slots[i].timeout?;
            Some((at + limit).saturating_duration_since(now))
        })
        .min()
        .map_or(CANCEL_POLL_INTERVAL, |d| d.min(CANCEL_POLL_INTERVAL))
}

fn live_workers(workers: &[Worker]) -> usize {
    workers.iter().filter(|w| w.handle.is_some()).count()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
