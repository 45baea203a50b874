//! Job definitions and execution logic.
//!
//! A job wraps user work behind the [`Execute`] trait. The submitter owns it
//! through an [`Arc`]; the scheduler only holds a clone until the work has run
//! and the attached [`WaitGroup`] has been signaled.

use crate::error::JobSystemError;
use crate::job_system::JobScheduler;
use crate::wait_group::WaitGroup;
use crossbeam::atomic::AtomicCell;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Scheduling tier of a job. Workers always drain higher tiers first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl JobPriority {
    /// Number of priority tiers (one queue each).
    pub const COUNT: usize = 3;

    /// Tiers from the highest to the lowest, in scan order.
    pub const SCAN_ORDER: [JobPriority; Self::COUNT] = [JobPriority::High, JobPriority::Normal, JobPriority::Low];

    pub fn index(self) -> usize {
        self as usize
    }

    pub(crate) fn from_index(index: usize) -> Self {
        match index {
            0 => JobPriority::Low,
            2 => JobPriority::High,
            _ => JobPriority::Normal,
        }
    }
}

/// Which workers may run a job.
///
/// A fiber that parks while running a job resumes under the same affinity, so
/// a job pinned to one worker also continues on that worker after a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Affinity {
    /// Any worker.
    #[default]
    Any,
    /// Any worker of the foreground pool.
    Foreground,
    /// Any worker of the background pool.
    Background,
    /// Only the worker with this index.
    Worker(usize),
}

impl Affinity {
    /// Packs the affinity into one word for lock-free storage.
    pub(crate) fn encode(self) -> usize {
        match self {
            Affinity::Any => 0,
            Affinity::Foreground => 1,
            Affinity::Background => 2,
            Affinity::Worker(index) => index.saturating_add(3),
        }
    }

    pub(crate) fn decode(raw: usize) -> Self {
        match raw {
            0 => Affinity::Any,
            1 => Affinity::Foreground,
            2 => Affinity::Background,
            index => Affinity::Worker(index - 3),
        }
    }
}

/// User work run by a job. May run on any worker thread.
pub trait Execute: Send + Sync + 'static {
    fn execute(&self);
}

impl<F> Execute for F
where
    F: Fn() + Send + Sync + 'static,
{
    fn execute(&self) {
        self()
    }
}

/// Wraps a one-shot closure. Executing it a second time does nothing.
pub(crate) struct OnceJob<F>(AtomicCell<Option<F>>);

impl<F> OnceJob<F>
where
    F: FnOnce() + Send + 'static,
{
    pub(crate) fn new(work: F) -> Self {
        OnceJob(AtomicCell::new(Some(work)))
    }
}

impl<F> Execute for OnceJob<F>
where
    F: FnOnce() + Send + 'static,
{
    fn execute(&self) {
        if let Some(work) = self.0.take() {
            work();
        }
    }
}

/// A unit of work to be executed by the job system.
///
/// A job can be scheduled again once its previous run has completed, but
/// never while it is still pending.
pub struct Job<E: ?Sized = dyn Execute> {
    scheduled: AtomicBool,
    extended_stack: bool,
    /// Group to signal when the work has run.
    completion: AtomicCell<Option<WaitGroup>>,
    work: E,
}

/// Type-erased job as it travels through the scheduler queues.
pub type JobRef = Arc<Job>;

impl<E: Execute> Job<E> {
    /// Creates a job that runs on a normal-sized fiber stack.
    pub fn new(work: E) -> Arc<Self> {
        Self::with_stack(work, false)
    }

    /// Creates a job that asks for an extended-stack fiber, for deep
    /// recursion or large stack frames.
    pub fn new_extended(work: E) -> Arc<Self> {
        Self::with_stack(work, true)
    }

    fn with_stack(work: E, extended_stack: bool) -> Arc<Self> {
        Arc::new(Job {
            scheduled: AtomicBool::new(false),
            extended_stack,
            completion: AtomicCell::new(None),
            work,
        })
    }

    /// Schedules the job on `scheduler`, runnable by any worker.
    ///
    /// If `wait_group` is given it is incremented now and signaled once the
    /// work has run.
    pub fn schedule<S: JobScheduler + ?Sized>(
        self: &Arc<Self>,
        scheduler: &S,
        wait_group: Option<&WaitGroup>,
        priority: JobPriority,
    ) -> Result<(), JobSystemError> {
        self.schedule_on(scheduler, wait_group, priority, Affinity::Any)
    }

    /// Same as [`Job::schedule`], restricted to the workers named by
    /// `affinity`.
    pub fn schedule_on<S: JobScheduler + ?Sized>(
        self: &Arc<Self>,
        scheduler: &S,
        wait_group: Option<&WaitGroup>,
        priority: JobPriority,
        affinity: Affinity,
    ) -> Result<(), JobSystemError> {
        let job: JobRef = self.clone();
        <Job>::schedule_ref(job, scheduler, wait_group, priority, affinity)
    }
}

impl Job {
    /// Same as [`Job::schedule_on`] for an already type-erased job.
    pub fn schedule_ref<S: JobScheduler + ?Sized>(
        job: JobRef,
        scheduler: &S,
        wait_group: Option<&WaitGroup>,
        priority: JobPriority,
        affinity: Affinity,
    ) -> Result<(), JobSystemError> {
        let claimed = ScheduledJob::claim(job)?;

        if let Some(wait_group) = wait_group {
            wait_group.add(1);
            claimed.0.completion.store(Some(wait_group.clone()));
        }

        let rollback = claimed.0.clone();
        if let Err(error) = scheduler.enqueue(claimed, priority, affinity) {
            if let Some(wait_group) = rollback.complete() {
                wait_group.signal();
            }
            return Err(error);
        }

        Ok(())
    }
}

/// A job claimed for exactly one run.
///
/// Only [`Job::schedule`] and [`JobScheduler::add_job`] create these, so a job
/// that is still pending can never reach a queue a second time.
pub struct ScheduledJob(JobRef);

impl ScheduledJob {
    /// Marks `job` as scheduled. Fails if a previous run is still pending.
    pub(crate) fn claim(job: JobRef) -> Result<Self, JobSystemError> {
        job.mark_scheduled()?;
        Ok(ScheduledJob(job))
    }

    pub fn job(&self) -> &JobRef {
        &self.0
    }

    pub fn into_job(self) -> JobRef {
        self.0
    }
}

impl std::fmt::Debug for ScheduledJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ScheduledJob").field(&self.0).finish()
    }
}

impl<E: ?Sized> Job<E> {
    pub fn work(&self) -> &E {
        &self.work
    }

    /// Whether the job is queued or running.
    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    pub fn needs_extended_stack(&self) -> bool {
        self.extended_stack
    }

    /// Claims the job for one run.
    pub(crate) fn mark_scheduled(&self) -> Result<(), JobSystemError> {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            tracing::error!("job scheduled while a previous run is still pending");
            if cfg!(debug_assertions) {
                panic!("job is already scheduled");
            }
            return Err(JobSystemError::AlreadyScheduled);
        }
        Ok(())
    }

    /// Ends the current run and hands back the group to signal.
    pub(crate) fn complete(&self) -> Option<WaitGroup> {
        let wait_group = self.completion.take();
        self.scheduled.store(false, Ordering::Release);
        wait_group
    }
}

impl<E: Execute + ?Sized> Job<E> {
    pub(crate) fn run(&self) {
        self.work.execute();
    }
}

impl<E: ?Sized> std::fmt::Debug for Job<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("scheduled", &self.is_scheduled())
            .field("extended_stack", &self.extended_stack)
            .finish_non_exhaustive()
    }
}
