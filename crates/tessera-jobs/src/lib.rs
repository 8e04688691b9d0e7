//! Tessera Jobs -- a fixed-pool background job scheduler.
//!
//! Jobs are closures submitted to a [`JobScheduler`](scheduler::JobScheduler)
//! and run on its worker threads in submission order, finishing in any order.
//! Each submission returns a [`JobHandle`](scheduler::JobHandle) that can be
//! polled or waited on. Completion is tracked exactly per job: a handle
//! reports complete as soon as its own job finished, whether or not older jobs
//! have.
//!
//! See [`scheduler`] for the lifecycle and id-reset rules, and [`completion`]
//! for the tracking structure.

pub mod completion;
pub mod scheduler;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by the job scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Disposal has started; the scheduler accepts no new jobs.
    #[error("scheduler is draining and accepts no new jobs")]
    Draining,

    /// The scheduler has been disposed.
    #[error("scheduler has been disposed")]
    Disposed,

    /// A worker thread could not be started.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports.
pub mod prelude {
    pub use crate::completion::{CompletionTracker, JobId};
    pub use crate::scheduler::{JobHandle, JobScheduler, SchedulerConfig, SchedulerState};
    pub use crate::SchedulerError;
}
