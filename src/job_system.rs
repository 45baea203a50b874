//! High-level job system interface.
//!
//! The JobSystem is the primary entry point for scheduling and managing
//! parallel work. It owns the worker threads and the fiber pool, accepts jobs
//! at three priorities, and hands out wait groups for tracking completion.

use crate::PinningStrategy;
use crate::context::MIN_STACK_SIZE;
use crate::error::JobSystemError;
use crate::job::{Affinity, Job, JobPriority, JobRef, OnceJob, ScheduledJob};
use crate::metrics::MetricsSnapshot;
use crate::shared::Shared;
use crate::wait_group::WaitGroup;
use crate::worker::WorkerPool;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Anything jobs can be submitted to.
pub trait JobScheduler {
    /// Queues a claimed job at `priority` for the workers named by `affinity`.
    /// Fails with [`JobSystemError::Stopped`] once the scheduler no longer
    /// accepts work.
    fn enqueue(&self, job: ScheduledJob, priority: JobPriority, affinity: Affinity) -> Result<(), JobSystemError>;

    /// Claims `job` and queues it for any worker.
    ///
    /// A job that is still pending is refused with
    /// [`JobSystemError::AlreadyScheduled`] (a panic in debug builds).
    fn add_job(&self, job: JobRef, priority: JobPriority) -> Result<(), JobSystemError> {
        self.add_job_on(job, priority, Affinity::Any)
    }

    /// Same as [`JobScheduler::add_job`] for the workers named by `affinity`.
    fn add_job_on(&self, job: JobRef, priority: JobPriority, affinity: Affinity) -> Result<(), JobSystemError> {
        let claimed = ScheduledJob::claim(job)?;
        let rollback = claimed.job().clone();
        self.enqueue(claimed, priority, affinity).inspect_err(|_| {
            rollback.complete();
        })
    }
}

/// Configuration for the job system.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSystemConfig {
    /// Number of worker threads. Default: available parallelism.
    pub worker_count: usize,
    /// How many of the workers form the background pool; the rest are
    /// foreground workers. Default: 0.
    pub background_worker_count: usize,
    /// Fibers with a normal stack. Every worker holds one at all times and
    /// every parked fiber holds one more. Default: 128.
    pub fiber_count: u32,
    /// Fibers with an extended stack, for jobs created with
    /// [`Job::new_extended`]. Default: 32.
    pub extended_fiber_count: u32,
    /// Normal stack size in bytes. Default: 256KB.
    pub stack_byte_size: usize,
    /// Extended stack size in bytes. Default: 1MB.
    pub extended_stack_byte_size: usize,
    /// Maximum number of live wait groups. Default: 4096.
    pub small_block_count: u32,
    /// How worker threads are pinned to cores.
    pub pinning: PinningStrategy,
}

impl Default for JobSystemConfig {
    fn default() -> Self {
        Self {
            worker_count: thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            background_worker_count: 0,
            fiber_count: 128,
            extended_fiber_count: 32,
            stack_byte_size: 256 * 1024,
            extended_stack_byte_size: 1024 * 1024,
            small_block_count: 4096,
            pinning: PinningStrategy::None,
        }
    }
}

impl JobSystemConfig {
    /// Default configuration with `worker_count` workers.
    pub fn with_workers(worker_count: usize) -> Self {
        Self {
            worker_count,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), JobSystemError> {
        let invalid = |message: String| Err(JobSystemError::InvalidConfig(message));

        if self.worker_count == 0 {
            return invalid("worker_count must be at least 1".into());
        }
        if self.background_worker_count >= self.worker_count {
            return invalid(format!(
                "background_worker_count ({}) must leave at least one foreground worker out of {}",
                self.background_worker_count, self.worker_count
            ));
        }
        if (self.fiber_count as usize) <= self.worker_count {
            return invalid(format!(
                "fiber_count ({}) must exceed worker_count ({})",
                self.fiber_count, self.worker_count
            ));
        }
        if self.fiber_count.checked_add(self.extended_fiber_count).is_none() {
            return invalid("too many fibers".into());
        }
        if self.stack_byte_size < MIN_STACK_SIZE * 2 {
            return invalid(format!(
                "stack_byte_size ({}) must be at least {}",
                self.stack_byte_size,
                MIN_STACK_SIZE * 2
            ));
        }
        if self.extended_fiber_count > 0 && self.extended_stack_byte_size < self.stack_byte_size {
            return invalid(format!(
                "extended_stack_byte_size ({}) must be at least stack_byte_size ({})",
                self.extended_stack_byte_size, self.stack_byte_size
            ));
        }
        if self.small_block_count == 0 {
            return invalid("small_block_count must be at least 1".into());
        }
        Ok(())
    }
}

/// Cloneable handle to a running job system, for submitting work and
/// creating wait groups from inside jobs.
#[derive(Clone)]
pub struct JobSystemHandle {
    shared: Arc<Shared>,
}

impl JobSystemHandle {
    /// Allocates a wait group with a count of zero.
    pub fn wait_group(&self) -> Result<WaitGroup, JobSystemError> {
        WaitGroup::with_shared(self.shared.clone())
    }

    /// Runs a one-shot closure and returns a wait group signaled when it
    /// has finished.
    pub fn run<F>(&self, priority: JobPriority, work: F) -> Result<WaitGroup, JobSystemError>
    where
        F: FnOnce() + Send + 'static,
    {
        let wait_group = self.wait_group()?;
        self.run_in(&wait_group, priority, work)?;
        Ok(wait_group)
    }

    /// Runs a one-shot closure on the workers named by `affinity` and
    /// returns a wait group signaled when it has finished.
    pub fn run_on<F>(&self, affinity: Affinity, priority: JobPriority, work: F) -> Result<WaitGroup, JobSystemError>
    where
        F: FnOnce() + Send + 'static,
    {
        let wait_group = self.wait_group()?;
        Job::new(OnceJob::new(work)).schedule_on(self, Some(&wait_group), priority, affinity)?;
        Ok(wait_group)
    }

    /// Runs a one-shot closure tracked by an existing wait group.
    pub fn run_in<F>(&self, wait_group: &WaitGroup, priority: JobPriority, work: F) -> Result<(), JobSystemError>
    where
        F: FnOnce() + Send + 'static,
    {
        Job::new(OnceJob::new(work)).schedule(self, Some(wait_group), priority)
    }

    /// Runs each closure as its own job, all tracked by one wait group.
    pub fn run_multiple<I, F>(&self, priority: JobPriority, jobs: I) -> Result<WaitGroup, JobSystemError>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() + Send + 'static,
    {
        let wait_group = self.wait_group()?;
        for work in jobs {
            self.run_in(&wait_group, priority, work)?;
        }
        Ok(wait_group)
    }

    /// Affinity that pins work to the worker running the caller, or `None`
    /// when the caller is not a job of this system.
    pub fn current_affinity(&self) -> Option<Affinity> {
        WorkerPool::current_for(&self.shared).map(|worker| Affinity::Worker(worker.index()))
    }
}

impl JobScheduler for JobSystemHandle {
    fn enqueue(&self, job: ScheduledJob, priority: JobPriority, affinity: Affinity) -> Result<(), JobSystemError> {
        self.shared.push_job(job.into_job(), priority, affinity)
    }
}

impl std::fmt::Debug for JobSystemHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSystemHandle").finish_non_exhaustive()
    }
}

/// The main job system managing worker threads and job execution.
///
/// Dropping the job system stops it. Call [`JobSystem::stop`] instead to
/// learn whether a worker thread panicked.
pub struct JobSystem {
    handle: JobSystemHandle,
    pool: Option<Arc<WorkerPool>>,
    threads: Vec<JoinHandle<()>>,
    config: JobSystemConfig,
}

impl JobSystem {
    /// Validates `config`, builds the fiber pool and starts the workers.
    ///
    /// # Example
    ///
    /// ```
    /// use fiber_jobs::{JobSystem, JobSystemConfig};
    ///
    /// let job_system = JobSystem::start(JobSystemConfig::with_workers(2)).unwrap();
    /// job_system.stop().unwrap();
    /// ```
    pub fn start(config: JobSystemConfig) -> Result<Self, JobSystemError> {
        config.validate()?;

        let shared = Arc::new(Shared::new(&config));
        let pool = Arc::new(WorkerPool::new(shared.clone(), &config)?);
        let cores = match config.pinning {
            PinningStrategy::None => Vec::new(),
            _ => core_affinity::get_core_ids().unwrap_or_default(),
        };

        let mut job_system = JobSystem {
            handle: JobSystemHandle { shared },
            pool: Some(pool.clone()),
            threads: Vec::with_capacity(config.worker_count),
            config,
        };

        for index in 0..job_system.config.worker_count {
            let core = job_system.config.pinning.core_for(index, &cores);
            let pool = pool.clone();
            let spawned = thread::Builder::new()
                .name(format!("Worker {index}"))
                .spawn(move || pool.thread_main(index, core));

            match spawned {
                Ok(handle) => job_system.threads.push(handle),
                Err(error) => {
                    tracing::error!(index, %error, "failed to spawn worker thread");
                    if let Err(error) = job_system.shutdown() {
                        tracing::error!(%error, "job system shut down with errors");
                    }
                    return Err(JobSystemError::ThreadSpawn(error));
                }
            }
        }

        tracing::debug!(
            workers = job_system.config.worker_count,
            fibers = pool.fibers().capacity(),
            pinning = ?job_system.config.pinning,
            "job system started"
        );
        Ok(job_system)
    }

    /// Creates a job system with one worker per available core and default
    /// settings otherwise.
    pub fn with_default_config() -> Result<Self, JobSystemError> {
        Self::start(JobSystemConfig::default())
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.handle.shared
    }

    /// Handle for submitting work from jobs or other threads.
    pub fn handle(&self) -> JobSystemHandle {
        self.handle.clone()
    }

    /// Runs a one-shot closure and returns a wait group signaled when it
    /// has finished.
    ///
    /// # Example
    ///
    /// ```
    /// use fiber_jobs::{JobPriority, JobSystem, JobSystemConfig};
    ///
    /// let job_system = JobSystem::start(JobSystemConfig::with_workers(2)).unwrap();
    /// let done = job_system.run(JobPriority::Normal, || println!("Hello from a fiber job!")).unwrap();
    /// job_system.wait_for(&done);
    /// ```
    pub fn run<F>(&self, priority: JobPriority, work: F) -> Result<WaitGroup, JobSystemError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.run(priority, work)
    }

    /// Runs each closure as its own job, all tracked by one wait group.
    pub fn run_multiple<I, F>(&self, priority: JobPriority, jobs: I) -> Result<WaitGroup, JobSystemError>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() + Send + 'static,
    {
        self.handle.run_multiple(priority, jobs)
    }

    /// Runs a one-shot closure on the workers named by `affinity`.
    pub fn run_on<F>(&self, affinity: Affinity, priority: JobPriority, work: F) -> Result<WaitGroup, JobSystemError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.run_on(affinity, priority, work)
    }

    /// See [`JobSystemHandle::current_affinity`].
    pub fn current_affinity(&self) -> Option<Affinity> {
        self.handle.current_affinity()
    }

    /// Allocates a wait group with a count of zero.
    pub fn wait_group(&self) -> Result<WaitGroup, JobSystemError> {
        self.handle.wait_group()
    }

    /// Waits for `wait_group` to reach zero. From a job this parks the fiber;
    /// from any other thread it blocks.
    pub fn wait_for(&self, wait_group: &WaitGroup) {
        wait_group.wait();
    }

    pub fn num_workers(&self) -> usize {
        self.config.worker_count
    }

    pub fn config(&self) -> &JobSystemConfig {
        &self.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared().metrics.snapshot()
    }

    /// Stops accepting external work, lets the workers drain every queued
    /// job, and joins them.
    ///
    /// Returns [`JobSystemError::WorkerPanicked`] if any worker thread
    /// panicked outside of a job.
    pub fn stop(mut self) -> Result<(), JobSystemError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), JobSystemError> {
        let Some(pool) = self.pool.take() else {
            return Ok(());
        };

        self.shared().begin_stop();

        let mut failed_count = 0;
        for (index, handle) in self.threads.drain(..).enumerate() {
            if handle.join().is_err() {
                failed_count += 1;
                tracing::error!(worker = index, "worker thread panicked");
            }
        }

        let fibers = pool.fibers();
        if failed_count == 0 && fibers.free_count() != fibers.capacity() {
            tracing::error!(
                free = fibers.free_count(),
                capacity = fibers.capacity(),
                "fibers still rented after all workers exited"
            );
        }
        drop(pool);

        tracing::debug!(metrics = ?self.metrics(), "job system stopped");

        if failed_count > 0 {
            Err(JobSystemError::WorkerPanicked(failed_count))
        } else {
            Ok(())
        }
    }
}

impl JobScheduler for JobSystem {
    fn enqueue(&self, job: ScheduledJob, priority: JobPriority, affinity: Affinity) -> Result<(), JobSystemError> {
        self.handle.enqueue(job, priority, affinity)
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown() {
            tracing::error!(%error, "job system shut down with errors");
        }
    }
}

impl std::fmt::Debug for JobSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSystem")
            .field("config", &self.config)
            .field("running", &self.pool.is_some())
            .finish_non_exhaustive()
    }
}
