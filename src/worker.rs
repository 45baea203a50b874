//! Worker threads and the fiber body they run.
//!
//! Each worker thread rents a fiber and switches into it from its native
//! stack. Fibers then run the scheduling loop themselves: they fetch work,
//! execute jobs, resume fibers whose wait group was signaled, and hand their
//! worker over to another fiber when they park. A fiber may come back on a
//! different worker thread than the one it parked on, so the current worker
//! is looked up again after every switch.

use crate::context::{Context, ContextHandle, TransferParams};
use crate::error::JobSystemError;
use crate::fiber_pool::{FiberHandle, FiberPool};
use crate::job::{Affinity, JobPriority, JobRef};
use crate::job_system::JobSystemConfig;
use crate::metrics::Metrics;
use crate::shared::{ReadyFiber, Shared, Work};
use crossbeam::utils::{Backoff, CachePadded};
use std::any::Any;
use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

/// How long an idle worker parks before polling the queues again.
const IDLE_PARK: Duration = Duration::from_millis(1);

thread_local! {
    /// Address of the pool and index of the worker running on this thread.
    static CURRENT_WORKER: Cell<(usize, usize)> = const { Cell::new((0, 0)) };
}

// Fibers migrate between threads; never let a TLS address be cached across a
// switch.
#[inline(never)]
fn current_worker() -> (usize, usize) {
    CURRENT_WORKER.get()
}

#[inline(never)]
fn set_current_worker(worker: (usize, usize)) {
    CURRENT_WORKER.set(worker);
}

/// Per-worker bookkeeping. Only the thread currently running as that worker
/// touches it.
struct WorkerSlot {
    name: String,
    /// Root context of the worker thread, where fibers go to end the thread.
    exit_context: Cell<ContextHandle>,
    current_fiber: Cell<Option<FiberHandle>>,
    /// Fiber that switched away most recently, to be cleaned up by the next one.
    prev_fiber: Cell<Option<FiberHandle>>,
    /// Whether `prev_fiber` parked on a wait group instead of going idle.
    parking: Cell<bool>,
    /// Priority of the work the current fiber runs.
    priority: Cell<JobPriority>,
    /// Affinity of the work the current fiber runs.
    affinity: Cell<Affinity>,
    /// Job passed to a freshly rented extended-stack fiber.
    handoff: Cell<Option<JobRef>>,
}

// SAFETY: a slot is only accessed from the OS thread that owns the worker
// index, through `CURRENT_WORKER`.
unsafe impl Sync for WorkerSlot {}

impl WorkerSlot {
    fn new(index: usize) -> Self {
        WorkerSlot {
            name: format!("Worker {index}"),
            exit_context: Cell::new(ContextHandle::INVALID),
            current_fiber: Cell::new(None),
            prev_fiber: Cell::new(None),
            parking: Cell::new(false),
            priority: Cell::new(JobPriority::Normal),
            affinity: Cell::new(Affinity::Any),
            handoff: Cell::new(None),
        }
    }
}

/// The worker running the calling fiber.
pub(crate) struct CurrentWorker<'a> {
    pool: &'a WorkerPool,
    index: usize,
    fiber: FiberHandle,
    priority: JobPriority,
    affinity: Affinity,
}

impl<'a> CurrentWorker<'a> {
    pub(crate) fn pool(&self) -> &'a WorkerPool {
        self.pool
    }

    pub(crate) fn fiber(&self) -> FiberHandle {
        self.fiber
    }

    pub(crate) fn priority(&self) -> JobPriority {
        self.priority
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn affinity(&self) -> Affinity {
        self.affinity
    }
}

/// Fibers plus per-worker state. Shared by the worker threads through an
/// `Arc` and torn down once all of them have been joined.
pub(crate) struct WorkerPool {
    shared: Arc<Shared>,
    fibers: FiberPool,
    workers: Box<[CachePadded<WorkerSlot>]>,
}

impl WorkerPool {
    pub(crate) fn new(shared: Arc<Shared>, config: &JobSystemConfig) -> Result<Self, JobSystemError> {
        let fibers = FiberPool::new(fiber_entry, config)?;
        let workers = (0..config.worker_count)
            .map(|index| CachePadded::new(WorkerSlot::new(index)))
            .collect();

        Ok(WorkerPool { shared, fibers, workers })
    }

    fn addr(&self) -> usize {
        self as *const WorkerPool as usize
    }

    pub(crate) fn fibers(&self) -> &FiberPool {
        &self.fibers
    }

    /// Looks up the worker running the calling fiber, if it belongs to the
    /// job system owning `shared`.
    pub(crate) fn current_for(shared: &Arc<Shared>) -> Option<CurrentWorker<'_>> {
        if !Context::in_context() {
            return None;
        }

        let (pool, index) = current_worker();
        if pool == 0 {
            return None;
        }

        // SAFETY: `CURRENT_WORKER` is set only while the pool's thread is running,
        // and the pool outlives its threads.
        let pool = unsafe { &*(pool as *const WorkerPool) };
        if !Arc::ptr_eq(&pool.shared, shared) {
            return None;
        }

        let slot = &pool.workers[index];
        Some(CurrentWorker {
            pool,
            index,
            fiber: slot.current_fiber.get()?,
            priority: slot.priority.get(),
            affinity: slot.affinity.get(),
        })
    }

    fn current_index(&self) -> usize {
        let (pool, index) = current_worker();
        debug_assert_eq!(pool, self.addr(), "fiber runs on a thread of another pool");
        index
    }

    fn current_slot(&self) -> &WorkerSlot {
        &self.workers[self.current_index()]
    }

    /// Rents a fiber for the scheduler. Running out of fibers means the pool
    /// is too small for the nesting depth of waits, and aborts the process.
    pub(crate) fn rent_fiber(&self, extended: bool) -> FiberHandle {
        match self.fibers.rent(extended) {
            Some(fiber) => fiber,
            None => {
                tracing::error!(
                    extended,
                    capacity = self.fibers.capacity(),
                    "fiber pool exhausted, raise `fiber_count`"
                );
                eprintln!("fiber pool exhausted ({} fibers); raise `fiber_count`", self.fibers.capacity());
                std::process::abort();
            }
        }
    }

    pub(crate) fn release_fiber(&self, fiber: FiberHandle) {
        self.fibers.release(fiber);
    }

    pub(crate) fn begin_suspend(&self, fiber: FiberHandle) {
        self.fibers.begin_suspend(fiber);
    }

    /// Entry point of worker thread `index`.
    pub(crate) fn thread_main(self: Arc<Self>, index: usize, core: Option<core_affinity::CoreId>) {
        let slot = &self.workers[index];

        if let Some(core) = core {
            if !core_affinity::set_for_current(core) {
                tracing::warn!(worker = %slot.name, core = core.id, "failed to pin worker thread");
            }
        }

        self.shared.register_worker_thread(index);
        set_current_worker((self.addr(), index));
        slot.exit_context.set(Context::current());

        let fiber = self.rent_fiber(false);
        slot.current_fiber.set(Some(fiber));
        slot.prev_fiber.set(None);
        tracing::debug!(worker = %slot.name, fiber = %self.fibers.name(fiber), "worker started");

        let transfer = self.fibers.switch(fiber, self.addr());

        // Back on the native stack: whichever fiber ran last on this worker exited.
        if let Some(fiber) = slot.current_fiber.take() {
            self.fibers.update(fiber, transfer.context);
            self.fibers.release(fiber);
        }

        set_current_worker((0, 0));
        tracing::debug!(worker = %slot.name, "worker stopped");
    }

    /// Body of every fiber. Never returns: an exiting fiber switches to its
    /// worker's root context and, when rented again, starts over.
    fn fiber_main(&self, mut transfer: TransferParams) {
        loop {
            self.clean_up_after_switch(transfer);
            self.run_until_exit();

            let exit = self.current_slot().exit_context.get();
            // SAFETY: the root context of this thread is alive until the thread ends.
            transfer = unsafe { Context::switch(exit, self.addr()) };
        }
    }

    /// Finishes the switch that brought us here: the fiber that switched away
    /// is either parked on a wait group or free for reuse.
    fn clean_up_after_switch(&self, transfer: TransferParams) {
        let slot = self.current_slot();
        let Some(prev) = slot.prev_fiber.take() else {
            return;
        };

        Metrics::bump(&self.shared.metrics.fiber_switches);
        self.fibers.update(prev, transfer.context);
        if slot.parking.replace(false) {
            self.fibers.finish_suspend(prev);
            Metrics::bump(&self.shared.metrics.suspensions);
        } else {
            self.fibers.release(prev);
        }
    }

    fn run_until_exit(&self) {
        let backoff = Backoff::new();
        loop {
            let slot = self.current_slot();
            if let Some(job) = slot.handoff.take() {
                self.execute(job);
                backoff.reset();
                continue;
            }

            match self.shared.fetch(self.current_index()) {
                Some(Work::Fiber(ready)) => {
                    self.resume_ready(ready);
                    backoff.reset();
                }
                Some(Work::Job(job, priority, affinity)) => {
                    slot.priority.set(priority);
                    slot.affinity.set(affinity);
                    if self.dispatch(job, priority, affinity) {
                        backoff.reset();
                    } else {
                        backoff.snooze();
                    }
                }
                None if self.shared.should_exit() => return,
                None if backoff.is_completed() => self.shared.sleep(self.current_index(), IDLE_PARK),
                None => backoff.snooze(),
            }
        }
    }

    fn resume_ready(&self, ready: ReadyFiber) {
        // The signal may arrive before the fiber has finished switching out.
        let backoff = Backoff::new();
        while !self.fibers.try_take_suspended(ready.fiber) {
            backoff.snooze();
        }

        let slot = self.current_slot();
        slot.prev_fiber.set(slot.current_fiber.get());
        slot.parking.set(false);
        slot.current_fiber.set(Some(ready.fiber));
        slot.priority.set(ready.priority);
        slot.affinity.set(ready.affinity);

        let transfer = self.fibers.switch(ready.fiber, self.addr());
        self.clean_up_after_switch(transfer);
    }

    /// Runs `job` on this fiber, or on an extended fiber if it asks for one.
    /// Returns `false` if the job went back to its queue because every
    /// extended fiber is busy.
    fn dispatch(&self, job: JobRef, priority: JobPriority, affinity: Affinity) -> bool {
        let slot = self.current_slot();
        let current = slot.current_fiber.get();
        let on_extended = current.is_some_and(|fiber| self.fibers.is_extended(fiber));

        if !job.needs_extended_stack() || on_extended {
            self.execute(job);
            return true;
        }

        let Some(big) = self.fibers.rent(true) else {
            tracing::debug!(worker = %slot.name, "no extended fiber free, requeueing job");
            self.shared.requeue_job(job, priority, affinity);
            return false;
        };

        slot.handoff.set(Some(job));
        slot.prev_fiber.set(current);
        slot.parking.set(false);
        slot.current_fiber.set(Some(big));

        let transfer = self.fibers.switch(big, self.addr());
        self.clean_up_after_switch(transfer);
        true
    }

    fn execute(&self, job: JobRef) {
        let result = catch_unwind(AssertUnwindSafe(|| job.run()));

        let metrics = &self.shared.metrics;
        Metrics::bump(&metrics.jobs_executed);
        if let Err(payload) = result {
            Metrics::bump(&metrics.jobs_panicked);
            // The job may have resumed on another worker.
            let worker = &self.current_slot().name;
            tracing::error!(%worker, message = panic_message(payload.as_ref()), "job panicked");
        }

        let wait_group = job.complete();
        drop(job);
        if let Some(wait_group) = wait_group {
            wait_group.signal();
        }
        self.shared.job_finished();
    }

    /// Parks `waiting`, which is already on a waiter list, and continues this
    /// worker on `next`. Returns once `waiting` has been resumed.
    pub(crate) fn switch_from_waiting_fiber(&self, waiting: FiberHandle, next: FiberHandle) {
        let slot = self.current_slot();
        debug_assert_eq!(slot.current_fiber.get(), Some(waiting));
        slot.prev_fiber.set(Some(waiting));
        slot.parking.set(true);
        slot.current_fiber.set(Some(next));

        let transfer = self.fibers.switch(next, self.addr());
        self.clean_up_after_switch(transfer);
    }
}

fn fiber_entry(transfer: TransferParams) {
    // SAFETY: fibers are always entered with the address of their pool, which
    // outlives every fiber run.
    let pool = unsafe { &*(transfer.user_data as *const WorkerPool) };
    pool.fiber_main(transfer);
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn start_pool(workers: usize) -> (Arc<Shared>, Arc<WorkerPool>, Vec<thread::JoinHandle<()>>) {
        let config = JobSystemConfig {
            worker_count: workers,
            fiber_count: 16,
            extended_fiber_count: 2,
            stack_byte_size: 256 * 1024,
            ..JobSystemConfig::default()
        };
        let shared = Arc::new(Shared::new(&config));
        let pool = Arc::new(WorkerPool::new(shared.clone(), &config).unwrap());
        let threads = (0..workers)
            .map(|index| {
                let pool = pool.clone();
                thread::spawn(move || pool.thread_main(index, None))
            })
            .collect();
        (shared, pool, threads)
    }

    #[test]
    fn test_worker_pool_execution() {
        let (shared, pool, threads) = start_pool(2);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = counter.clone();
            let job: JobRef = Job::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            job.mark_scheduled().unwrap();
            shared.push_job(job, JobPriority::Normal, Affinity::Any).unwrap();
        }

        shared.begin_stop();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert_eq!(pool.fibers().free_count(), pool.fibers().capacity());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7);
        assert_eq!(panic_message(payload.as_ref()), "<non-string panic payload>");
    }
}
