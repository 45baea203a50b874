//! # fiber-jobs - Fiber-Based Cooperative Job Scheduler
//!
//! A small, fixed set of worker threads runs a much larger number of
//! logically concurrent jobs. Jobs run on fibers (user-space stacks) carved
//! out of one pre-allocated arena. A job that waits for other jobs parks its
//! fiber instead of blocking its thread, and the worker moves on to other
//! work until the wait is over.
//!
//! ## Architecture
//!
//! - **Context**: raw stack switch between fibers
//! - **FiberPool**: fixed arena of normal and extended-stack fibers
//! - **WaitGroup**: countdown latch that parks fibers instead of threads
//! - **Job**: shared unit of work scheduled at one of three priorities
//! - **JobSystem**: worker threads, priority queues and lifecycle
//!
//! Scheduling is cooperative: the only suspension point is
//! [`WaitGroup::wait`]. Higher priorities always run first. An [`Affinity`]
//! restricts a job to one worker or to the foreground or background pool.
//!
//! ## Example
//!
//! ```no_run
//! use fiber_jobs::{JobPriority, JobSystem, JobSystemConfig};
//!
//! let job_system = JobSystem::start(JobSystemConfig::with_workers(4)).unwrap();
//!
//! let done = job_system
//!     .run(JobPriority::Normal, || {
//!         println!("Hello from a fiber job!");
//!     })
//!     .unwrap();
//!
//! job_system.wait_for(&done);
//! job_system.stop().unwrap();
//! ```

pub mod context;
pub mod error;
pub mod fiber_pool;
pub mod job;
pub mod job_system;
pub mod metrics;
pub mod wait_group;

mod shared;
mod small_block;
mod worker;

use serde::{Deserialize, Serialize};

/// Strategy for pinning worker threads to CPU cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    #[default]
    None,
    /// Linear pinning (worker i -> logical processor i).
    Linear,
    /// Pin to physical cores only (even-numbered logical processors), avoiding SMT contention.
    AvoidSMT,
}

impl PinningStrategy {
    /// Core for worker `index`. Wraps around when there are more workers than
    /// cores.
    pub fn core_for(self, index: usize, cores: &[core_affinity::CoreId]) -> Option<core_affinity::CoreId> {
        if cores.is_empty() {
            return None;
        }

        match self {
            PinningStrategy::None => None,
            PinningStrategy::Linear => Some(cores[index % cores.len()]),
            PinningStrategy::AvoidSMT => {
                let physical = cores.len().div_ceil(2);
                Some(cores[(index % physical) * 2])
            }
        }
    }
}

pub use context::{Context, ContextHandle, TransferParams};
pub use error::JobSystemError;
pub use fiber_pool::{FiberHandle, FiberPool};
pub use job::{Affinity, Execute, Job, JobPriority, JobRef, ScheduledJob};
pub use job_system::{JobScheduler, JobSystem, JobSystemConfig, JobSystemHandle};
pub use metrics::{Metrics, MetricsSnapshot};
pub use wait_group::WaitGroup;

#[cfg(test)]
mod tests {
    use super::*;
    use core_affinity::CoreId;

    fn cores(count: usize) -> Vec<CoreId> {
        (0..count).map(|id| CoreId { id }).collect()
    }

    #[test]
    fn test_pinning_none() {
        assert_eq!(PinningStrategy::None.core_for(0, &cores(8)), None);
    }

    #[test]
    fn test_pinning_linear_wraps() {
        let cores = cores(4);
        assert_eq!(PinningStrategy::Linear.core_for(1, &cores), Some(CoreId { id: 1 }));
        assert_eq!(PinningStrategy::Linear.core_for(5, &cores), Some(CoreId { id: 1 }));
        assert_eq!(PinningStrategy::Linear.core_for(0, &[]), None);
    }

    #[test]
    fn test_pinning_avoid_smt() {
        let cores = cores(8);
        let picked: Vec<_> = (0..5)
            .filter_map(|index| PinningStrategy::AvoidSMT.core_for(index, &cores))
            .map(|core| core.id)
            .collect();
        assert_eq!(picked, vec![0, 2, 4, 6, 0]);

        assert_eq!(PinningStrategy::AvoidSMT.core_for(1, &[CoreId { id: 0 }]), Some(CoreId { id: 0 }));
    }
}
