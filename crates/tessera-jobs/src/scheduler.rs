//! Fixed-pool background job scheduler.
//!
//! A [`JobScheduler`] owns a fixed set of worker threads that pull jobs from a
//! lock-free FIFO ([`crossbeam::queue::SegQueue`]). Every job gets an
//! increasing [`JobId`]; a [`CompletionTracker`] records which ids finished so
//! a [`JobHandle`] can be polled without waiting on older jobs.
//!
//! # Lifecycle
//!
//! `Running` accepts jobs. [`JobScheduler::dispose`] moves to `Draining`
//! (new submissions are rejected, queued jobs still run), joins the workers and
//! ends in `Disposed`. Dropping the scheduler disposes it.
//!
//! # Id overflow
//!
//! Once the id counter reaches [`SchedulerConfig::id_limit`], the next
//! submission blocks new ones, waits until every issued job finished, resets
//! the counter and bumps the scheduler *version*. A handle from an older
//! version always reports completed.
//!
//! # Example
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use tessera_jobs::prelude::*;
//!
//! let scheduler = JobScheduler::new(SchedulerConfig::default()).unwrap();
//! let hits = Arc::new(AtomicUsize::new(0));
//! let counter = hits.clone();
//! let handle = scheduler
//!     .schedule(move || {
//!         counter.fetch_add(1, Ordering::SeqCst);
//!     })
//!     .unwrap();
//! handle.wait_for_completion();
//! assert_eq!(hits.load(Ordering::SeqCst), 1);
//! scheduler.dispose();
//! ```

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam::queue::SegQueue;
use crossbeam::utils::Backoff;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use crate::completion::{CompletionTracker, JobId};
use crate::SchedulerError;

// ---------------------------------------------------------------------------
// SchedulerConfig
// ---------------------------------------------------------------------------

/// Configuration for a [`JobScheduler`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker threads to start. `None` uses the available parallelism minus
    /// one, and never fewer than one.
    pub worker_count: Option<usize>,
    /// Issued ids that trigger a drain-and-reset. Must be at least 1.
    pub id_limit: u64,
    /// Worker threads are named `{prefix}-{slot}-{n}`.
    pub thread_name_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: None,
            id_limit: u64::MAX / 2,
            thread_name_prefix: "tessera-worker".to_owned(),
        }
    }
}

impl SchedulerConfig {
    /// Worker count this configuration resolves to on this machine.
    pub fn resolved_worker_count(&self) -> usize {
        self.worker_count
            .unwrap_or_else(|| {
                thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
                    .saturating_sub(1)
            })
            .max(1)
    }
}

/// Lifecycle state of a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerState {
    Running,
    /// Disposal started; queued jobs still run, new ones are refused.
    Draining,
    Disposed,
}

// ---------------------------------------------------------------------------
// Slot pool
// ---------------------------------------------------------------------------

/// Numeric scheduler slots, recycled when a scheduler is disposed.
struct SlotPool {
    free: Vec<u32>,
    next: u32,
}

static SLOTS: Mutex<SlotPool> = parking_lot::const_mutex(SlotPool {
    free: Vec::new(),
    next: 0,
});

fn acquire_slot() -> u32 {
    let mut pool = SLOTS.lock();
    if let Some(slot) = pool.free.pop() {
        return slot;
    }
    let slot = pool.next;
    pool.next += 1;
    slot
}

fn release_slot(slot: u32) {
    SLOTS.lock().free.push(slot);
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

type Job = Box<dyn FnOnce() + Send + 'static>;

/// State shared between the scheduler, its workers and its handles.
struct Shared {
    slot: u32,
    queue: SegQueue<(JobId, Job)>,
    tracker: CompletionTracker,
    /// Last id handed out; 0 before the first submission.
    issued: AtomicU64,
    version: AtomicU32,
    /// Workers exit once this is set and the queue is empty.
    cancelled: AtomicBool,
    /// Submissions hold the read side; drains and state changes the write
    /// side.
    gate: RwLock<SchedulerState>,
}

impl Shared {
    /// Spin until every issued job has finished.
    fn wait_drained(&self) {
        let backoff = Backoff::new();
        while !self
            .tracker
            .all_completed_through(self.issued.load(Ordering::Acquire))
        {
            backoff.snooze();
        }
    }

    fn run(&self, id: JobId, job: Job) {
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(scheduler = self.slot, job = id, "job panicked");
        }
        // A panicked job still counts as finished so the mark keeps moving.
        if self.tracker.complete(id) {
            trace!(scheduler = self.slot, job = id, mark = self.tracker.mark(), "mark advanced");
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let backoff = Backoff::new();
    loop {
        match shared.queue.pop() {
            Some((id, job)) => {
                backoff.reset();
                shared.run(id, job);
            }
            None if shared.cancelled.load(Ordering::Acquire) => break,
            None => backoff.snooze(),
        }
    }
}

// ---------------------------------------------------------------------------
// JobHandle
// ---------------------------------------------------------------------------

/// Token for polling or waiting on one scheduled job.
#[derive(Clone)]
pub struct JobHandle {
    scheduler: u32,
    version: u32,
    id: JobId,
    shared: Weak<Shared>,
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("scheduler", &self.scheduler)
            .field("version", &self.version)
            .field("id", &self.id)
            .finish()
    }
}

impl JobHandle {
    /// Slot of the scheduler that issued this handle.
    pub fn scheduler(&self) -> u32 {
        self.scheduler
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Whether the job has finished (or ran and panicked).
    ///
    /// Handles outliving their scheduler, or issued before an id reset,
    /// always report completed.
    pub fn is_completed(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return true;
        };
        if shared.version.load(Ordering::SeqCst) != self.version {
            return true;
        }
        // Re-check the version: a reset between the two reads clears the
        // tracker.
        shared.tracker.is_completed(self.id)
            || shared.version.load(Ordering::SeqCst) != self.version
    }

    /// Busy-poll with backoff until the job has finished.
    pub fn wait_for_completion(&self) {
        let backoff = Backoff::new();
        while !self.is_completed() {
            backoff.snooze();
        }
    }
}

// ---------------------------------------------------------------------------
// JobScheduler
// ---------------------------------------------------------------------------

/// A fixed pool of worker threads draining a shared job queue.
pub struct JobScheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    config: SchedulerConfig,
}

impl fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobScheduler")
            .field("slot", &self.shared.slot)
            .field("state", &self.state())
            .field("version", &self.version())
            .field("issued", &self.shared.issued.load(Ordering::Relaxed))
            .field("mark", &self.shared.tracker.mark())
            .finish()
    }
}

impl JobScheduler {
    /// Start the worker pool.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Spawn`] if a worker thread cannot be started; any
    /// workers already running are stopped first.
    pub fn new(mut config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.id_limit = config.id_limit.max(1);
        let worker_count = config.resolved_worker_count();
        let shared = Arc::new(Shared {
            slot: acquire_slot(),
            queue: SegQueue::new(),
            tracker: CompletionTracker::new(),
            issued: AtomicU64::new(0),
            version: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            gate: RwLock::new(SchedulerState::Running),
        });

        let mut workers = Vec::with_capacity(worker_count);
        for n in 0..worker_count {
            let worker = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("{}-{}-{n}", config.thread_name_prefix, shared.slot))
                .spawn(move || worker_loop(worker));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(error) => {
                    shared.cancelled.store(true, Ordering::Release);
                    for handle in workers {
                        let _ = handle.join();
                    }
                    release_slot(shared.slot);
                    return Err(SchedulerError::Spawn(error));
                }
            }
        }
        debug!(scheduler = shared.slot, workers = worker_count, "scheduler started");

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            config,
        })
    }

    #[inline]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Numeric slot; reused by a later scheduler once this one is disposed.
    pub fn slot(&self) -> u32 {
        self.shared.slot
    }

    /// Bumped on every id reset.
    pub fn version(&self) -> u32 {
        self.shared.version.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SchedulerState {
        *self.shared.gate.read()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Jobs waiting to be picked up.
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    /// Lowest job id not yet known complete.
    pub fn low_water_mark(&self) -> JobId {
        self.shared.tracker.mark()
    }

    /// Queue `job` and return a handle to it.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Draining`] once disposal has started,
    /// [`SchedulerError::Disposed`] afterwards.
    pub fn schedule<F>(&self, job: F) -> Result<JobHandle, SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.issued.load(Ordering::Acquire) >= self.config.id_limit {
            self.reset_ids();
        }

        let gate = self.shared.gate.read();
        match *gate {
            SchedulerState::Running => {}
            SchedulerState::Draining => return Err(SchedulerError::Draining),
            SchedulerState::Disposed => return Err(SchedulerError::Disposed),
        }
        let id = self.shared.issued.fetch_add(1, Ordering::AcqRel) + 1;
        let version = self.shared.version.load(Ordering::SeqCst);
        self.shared.queue.push((id, Box::new(job)));
        drop(gate);

        trace!(scheduler = self.shared.slot, job = id, version, "job scheduled");
        Ok(JobHandle {
            scheduler: self.shared.slot,
            version,
            id,
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Block submissions, drain, then restart ids at 1 under a new version.
    fn reset_ids(&self) {
        let gate = self.shared.gate.write();
        let issued = self.shared.issued.load(Ordering::Acquire);
        if *gate != SchedulerState::Running || issued < self.config.id_limit {
            // Another submitter already reset, or disposal is under way.
            return;
        }
        self.shared.wait_drained();
        // Version first, so a poller that sees the cleared tracker also sees
        // the new version.
        let version = self.shared.version.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.tracker.reset();
        self.shared.issued.store(0, Ordering::Release);
        drop(gate);
        debug!(scheduler = self.shared.slot, version, drained = issued, "job ids reset");
    }

    /// Block until every job submitted so far has finished.
    pub fn wait_idle(&self) {
        self.shared.wait_drained();
    }

    /// Stop accepting jobs, run everything already queued, join the workers
    /// and recycle the slot. Calling it again is a no-op.
    ///
    /// Must not be called from inside one of this scheduler's jobs.
    pub fn dispose(&self) {
        {
            let mut gate = self.shared.gate.write();
            if *gate != SchedulerState::Running {
                return;
            }
            *gate = SchedulerState::Draining;
        }
        debug!(
            scheduler = self.shared.slot,
            queued = self.shared.queue.len(),
            "scheduler draining"
        );

        self.shared.wait_drained();
        self.shared.cancelled.store(true, Ordering::Release);
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                error!(scheduler = self.shared.slot, "worker thread panicked");
            }
        }

        *self.shared.gate.write() = SchedulerState::Disposed;
        release_slot(self.shared.slot);
        debug!(scheduler = self.shared.slot, "scheduler disposed");
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn one_worker() -> SchedulerConfig {
        SchedulerConfig {
            worker_count: Some(1),
            ..Default::default()
        }
    }

    #[test]
    fn ids_start_at_one_and_increase() {
        let scheduler = JobScheduler::new(one_worker()).unwrap();
        let a = scheduler.schedule(|| {}).unwrap();
        let b = scheduler.schedule(|| {}).unwrap();
        assert_eq!((a.id(), b.id()), (1, 2));
        assert_eq!(a.scheduler(), scheduler.slot());
        b.wait_for_completion();
        scheduler.wait_idle();
        assert_eq!(scheduler.low_water_mark(), 3);
    }

    #[test]
    fn resolved_worker_count_is_at_least_one() {
        assert!(SchedulerConfig::default().resolved_worker_count() >= 1);
        let zero = SchedulerConfig {
            worker_count: Some(0),
            ..Default::default()
        };
        assert_eq!(zero.resolved_worker_count(), 1);
    }

    #[test]
    fn dispose_is_idempotent_and_rejects_new_jobs() {
        let scheduler = JobScheduler::new(one_worker()).unwrap();
        scheduler.dispose();
        scheduler.dispose();
        assert_eq!(scheduler.state(), SchedulerState::Disposed);
        assert_eq!(scheduler.worker_count(), 0);
        assert!(matches!(scheduler.schedule(|| {}), Err(SchedulerError::Disposed)));
    }

    #[test]
    fn panicking_job_still_completes() {
        let scheduler = JobScheduler::new(one_worker()).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let bad = scheduler.schedule(|| panic!("job failure")).unwrap();
        let counter = ran.clone();
        let good = scheduler
            .schedule(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        bad.wait_for_completion();
        good.wait_for_completion();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handle_outliving_scheduler_reports_completed() {
        let handle = {
            let scheduler = JobScheduler::new(one_worker()).unwrap();
            scheduler.schedule(|| {}).unwrap()
        };
        assert!(handle.is_completed());
    }
}
