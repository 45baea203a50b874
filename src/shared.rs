//! State shared by the job system handle, its workers and every wait group.
//!
//! This outlives the worker threads: wait groups keep it alive through their
//! `Arc`, so their blocks stay valid even after the system has been stopped.

use crate::error::JobSystemError;
use crate::fiber_pool::FiberHandle;
use crate::job::{Affinity, JobPriority, JobRef};
use crate::job_system::JobSystemConfig;
use crate::metrics::Metrics;
use crate::small_block::SmallBlockPool;
use crate::wait_group::{WaitGroupState, WaiterLink};
use crossbeam::queue::SegQueue;
use crossbeam::utils::CachePadded;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering, fence};
use std::thread::Thread;

/// A parked fiber whose wait group has been signaled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ReadyFiber {
    pub fiber: FiberHandle,
    pub priority: JobPriority,
    pub affinity: Affinity,
}

/// Next piece of work for a worker, with the affinity of the queue it came
/// from.
pub(crate) enum Work {
    Fiber(ReadyFiber),
    Job(JobRef, JobPriority, Affinity),
}

/// Job and ready-fiber queues, one of each per priority tier.
#[derive(Default)]
struct Queues {
    jobs: [SegQueue<JobRef>; JobPriority::COUNT],
    ready: [SegQueue<ReadyFiber>; JobPriority::COUNT],
}

impl Queues {
    fn is_empty(&self) -> bool {
        self.jobs.iter().all(SegQueue::is_empty) && self.ready.iter().all(SegQueue::is_empty)
    }
}

#[derive(Default)]
struct Sleeper {
    sleeping: AtomicBool,
    thread: OnceLock<Thread>,
}

pub(crate) struct Shared {
    any: Queues,
    foreground: Queues,
    background: Queues,
    /// Work only the worker with the same index may take.
    local: Box<[CachePadded<Queues>]>,
    /// Workers below this index form the foreground pool.
    foreground_count: usize,
    extended_fibers: bool,
    pub(crate) wait_groups: SmallBlockPool<WaitGroupState>,
    /// One waiter-list link per fiber; a fiber waits on at most one group.
    pub(crate) waiter_links: Box<[CachePadded<WaiterLink>]>,
    sleepers: Box<[CachePadded<Sleeper>]>,
    stopping: AtomicBool,
    /// Jobs accepted but not yet completed.
    active: AtomicUsize,
    pub(crate) metrics: Metrics,
}

impl Shared {
    pub(crate) fn new(config: &JobSystemConfig) -> Self {
        let fiber_count = (config.fiber_count + config.extended_fiber_count) as usize;
        Shared {
            any: Queues::default(),
            foreground: Queues::default(),
            background: Queues::default(),
            local: (0..config.worker_count).map(|_| CachePadded::new(Queues::default())).collect(),
            foreground_count: config.worker_count.saturating_sub(config.background_worker_count),
            extended_fibers: config.extended_fiber_count > 0,
            wait_groups: SmallBlockPool::new(config.small_block_count),
            waiter_links: (0..fiber_count).map(|_| CachePadded::new(WaiterLink::default())).collect(),
            sleepers: (0..config.worker_count).map(|_| CachePadded::new(Sleeper::default())).collect(),
            stopping: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            metrics: Metrics::new(),
        }
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.local.len()
    }

    /// Pool affinity of worker `index`.
    pub(crate) fn pool_of(&self, index: usize) -> Affinity {
        if index < self.foreground_count {
            Affinity::Foreground
        } else {
            Affinity::Background
        }
    }

    fn can_run(&self, index: usize, affinity: Affinity) -> bool {
        match affinity {
            Affinity::Any => true,
            Affinity::Worker(worker) => worker == index,
            pool => self.pool_of(index) == pool,
        }
    }

    /// Fails unless some worker can run work with `affinity`.
    pub(crate) fn check_affinity(&self, affinity: Affinity) -> Result<(), JobSystemError> {
        if (0..self.worker_count()).any(|index| self.can_run(index, affinity)) {
            Ok(())
        } else {
            Err(JobSystemError::UnknownAffinity(affinity))
        }
    }

    fn queues(&self, affinity: Affinity) -> &Queues {
        match affinity {
            Affinity::Any => &self.any,
            Affinity::Foreground => &self.foreground,
            Affinity::Background => &self.background,
            Affinity::Worker(index) => &self.local[index],
        }
    }

    /// Queues worker `index` takes work from, in the order it looks at them.
    fn queues_of(&self, index: usize) -> [(&Queues, Affinity); 3] {
        let pool = self.pool_of(index);
        [
            (&self.local[index], Affinity::Worker(index)),
            (self.queues(pool), pool),
            (&self.any, Affinity::Any),
        ]
    }

    /// Queues a job. Refused once the system is stopping and has drained;
    /// until then running jobs may still spawn more work.
    pub(crate) fn push_job(&self, job: JobRef, priority: JobPriority, affinity: Affinity) -> Result<(), JobSystemError> {
        self.check_affinity(affinity)?;
        if job.needs_extended_stack() && !self.extended_fibers {
            return Err(JobSystemError::ExtendedStackUnavailable);
        }

        let previous = self.active.fetch_add(1, Ordering::SeqCst);
        if previous == 0 && self.stopping.load(Ordering::SeqCst) {
            self.active.fetch_sub(1, Ordering::SeqCst);
            return Err(JobSystemError::Stopped);
        }

        Metrics::bump(&self.metrics.jobs_submitted);
        self.queues(affinity).jobs[priority.index()].push(job);
        self.wake_for(affinity);
        Ok(())
    }

    /// Puts an accepted job back at the end of its queue.
    pub(crate) fn requeue_job(&self, job: JobRef, priority: JobPriority, affinity: Affinity) {
        self.queues(affinity).jobs[priority.index()].push(job);
        self.wake_for(affinity);
    }

    /// Requeues a parked fiber at the priority and affinity it waited with.
    pub(crate) fn add_ready_fiber(&self, fiber: FiberHandle, priority: JobPriority, affinity: Affinity) {
        tracing::trace!(fiber = fiber.index(), ?priority, ?affinity, "fiber ready");
        self.queues(affinity).ready[priority.index()].push(ReadyFiber {
            fiber,
            priority,
            affinity,
        });
        self.wake_for(affinity);
    }

    /// Next work for worker `index`. Highest tier first; within a tier resumed
    /// fibers go before new jobs, and the worker's own queue before its pool's
    /// before the shared one.
    pub(crate) fn fetch(&self, index: usize) -> Option<Work> {
        let sources = self.queues_of(index);
        for priority in JobPriority::SCAN_ORDER {
            for (queues, _) in sources {
                if let Some(ready) = queues.ready[priority.index()].pop() {
                    return Some(Work::Fiber(ready));
                }
            }
            for (queues, affinity) in sources {
                if let Some(job) = queues.jobs[priority.index()].pop() {
                    return Some(Work::Job(job, priority, affinity));
                }
            }
        }
        None
    }

    pub(crate) fn has_work_for(&self, index: usize) -> bool {
        self.queues_of(index).iter().any(|(queues, _)| !queues.is_empty())
    }

    pub(crate) fn job_finished(&self) {
        let previous = self.active.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 && self.is_stopping() {
            // Idle workers may be waiting for the last job to drain.
            self.wake_all();
        }
    }

    pub(crate) fn begin_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.wake_all();
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Workers leave once stopping and every accepted job has completed.
    pub(crate) fn should_exit(&self) -> bool {
        self.stopping.load(Ordering::SeqCst) && self.active.load(Ordering::SeqCst) == 0
    }

    pub(crate) fn register_worker_thread(&self, index: usize) {
        let _ = self.sleepers[index].thread.set(std::thread::current());
    }

    /// Parks worker `index` for at most `timeout` unless work shows up first.
    pub(crate) fn sleep(&self, index: usize, timeout: std::time::Duration) {
        let sleeper = &self.sleepers[index];
        sleeper.sleeping.store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);

        if !self.has_work_for(index) && !self.should_exit() {
            std::thread::park_timeout(timeout);
        }
        sleeper.sleeping.store(false, Ordering::Release);
    }

    /// Unparks one sleeping worker that may run work with `affinity`.
    fn wake_for(&self, affinity: Affinity) {
        fence(Ordering::SeqCst);
        for (index, sleeper) in self.sleepers.iter().enumerate() {
            if !self.can_run(index, affinity) {
                continue;
            }
            if sleeper.sleeping.swap(false, Ordering::AcqRel) {
                if let Some(thread) = sleeper.thread.get() {
                    thread.unpark();
                }
                return;
            }
        }
    }

    fn wake_all(&self) {
        fence(Ordering::SeqCst);
        for sleeper in self.sleepers.iter() {
            if let Some(thread) = sleeper.thread.get() {
                thread.unpark();
            }
        }
    }
}
