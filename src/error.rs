//! Error type shared by the job system, fiber pool and wait groups.

use crate::job::Affinity;
use thiserror::Error;

/// Errors reported by the job system.
///
/// Most programming errors (double scheduling, over-signaling a wait group)
/// panic in debug builds. Release builds log them and surface the variant
/// below instead.
#[derive(Debug, Error)]
pub enum JobSystemError {
    /// The configuration passed to [`JobSystem::start`](crate::JobSystem::start) is unusable.
    #[error("invalid job system configuration: {0}")]
    InvalidConfig(String),

    /// The fiber stack arena could not be allocated.
    #[error("failed to allocate {size} bytes of fiber stack memory")]
    StackAllocation { size: usize },

    /// Every block of the wait group pool is in use.
    #[error("small block pool exhausted ({capacity} blocks in use)")]
    SmallBlockPoolExhausted { capacity: usize },

    /// The job is still pending from an earlier `schedule` call.
    #[error("job is already scheduled")]
    AlreadyScheduled,

    /// No worker of this job system matches the requested affinity.
    #[error("no worker can run jobs with affinity {0:?}")]
    UnknownAffinity(Affinity),

    /// The job asks for an extended stack but the system has no extended fibers.
    #[error("job needs an extended stack but extended_fiber_count is 0")]
    ExtendedStackUnavailable,

    /// The job system is shutting down and no longer accepts work.
    #[error("job system is stopped")]
    Stopped,

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    /// One or more worker threads panicked outside of a job.
    #[error("{0} worker thread(s) panicked")]
    WorkerPanicked(usize),
}
