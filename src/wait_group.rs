//! Countdown latch that fibers can wait on without blocking their worker.
//!
//! A wait group counts outstanding units of work. [`WaitGroup::wait`] returns
//! once the count is zero. On a worker fiber the waiting fiber is parked on an
//! intrusive list and the worker switches to a fresh fiber; the signal that
//! brings the count to zero requeues every parked fiber at the priority and
//! affinity it waited with. Any other thread spins and then sleeps.
//!
//! The waiter list head and a lock bit share one atomic word. The lock is held
//! only for a few instructions and never across a fiber switch.

use crate::error::JobSystemError;
use crate::fiber_pool::FiberHandle;
use crate::job::{Affinity, JobPriority};
use crate::job_system::JobSystem;
use crate::shared::Shared;
use crate::worker::{CurrentWorker, WorkerPool};
use crossbeam::utils::Backoff;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering, fence};
use std::time::Duration;

const LOCKED: u64 = 1;

/// Longest sleep of a thread blocked outside the fiber pool.
const MAX_BLOCKING_SLEEP: Duration = Duration::from_millis(1);

/// State of one wait group, stored in the small-block pool.
pub(crate) struct WaitGroupState {
    counter: AtomicI32,
    refs: AtomicU32,
    /// Encoded head of the waiter list, shifted left past the lock bit.
    waiters: AtomicU64,
}

impl WaitGroupState {
    fn new() -> Self {
        WaitGroupState {
            counter: AtomicI32::new(0),
            refs: AtomicU32::new(1),
            waiters: AtomicU64::new(0),
        }
    }

    /// Spins until the lock bit is ours. Returns the list head.
    fn lock(&self) -> u32 {
        let backoff = Backoff::new();
        loop {
            let current = self.waiters.load(Ordering::Relaxed);
            if current & LOCKED == 0
                && self
                    .waiters
                    .compare_exchange_weak(current, current | LOCKED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return (current >> 1) as u32;
            }
            backoff.spin();
        }
    }

    fn unlock(&self, head: u32) {
        self.waiters.store((head as u64) << 1, Ordering::Release);
    }
}

/// Link of a fiber parked on some wait group. Encoded fiber indices are
/// offset by one so zero ends the list.
#[derive(Default)]
pub(crate) struct WaiterLink {
    next: AtomicU32,
    priority: AtomicU8,
    /// Encoded [`Affinity`] the fiber resumes under.
    affinity: AtomicUsize,
}

fn encode(fiber: FiberHandle) -> u32 {
    fiber.index() as u32 + 1
}

fn decode(encoded: u32) -> Option<FiberHandle> {
    encoded.checked_sub(1).map(FiberHandle::from_index)
}

/// Reference-counted handle to a wait group.
///
/// Clones refer to the same counter. The state returns to the job system's
/// block pool when the last handle is dropped, which may happen after the job
/// system itself has stopped.
pub struct WaitGroup {
    shared: Arc<Shared>,
    index: u32,
}

impl WaitGroup {
    /// Allocates a wait group with a count of zero.
    pub fn new(job_system: &JobSystem) -> Result<Self, JobSystemError> {
        Self::with_shared(job_system.shared().clone())
    }

    pub(crate) fn with_shared(shared: Arc<Shared>) -> Result<Self, JobSystemError> {
        match shared.wait_groups.allocate(WaitGroupState::new()) {
            Ok(index) => Ok(WaitGroup { shared, index }),
            Err(_) => {
                let capacity = shared.wait_groups.capacity();
                tracing::warn!(capacity, "wait group pool exhausted");
                Err(JobSystemError::SmallBlockPoolExhausted { capacity })
            }
        }
    }

    fn state(&self) -> &WaitGroupState {
        // SAFETY: this handle holds a reference, so the block is allocated.
        unsafe { self.shared.wait_groups.get(self.index) }
    }

    /// Adds `n` to the count. A negative `n` performs the matching number of
    /// signals.
    pub fn add(&self, n: i32) {
        match n {
            n if n > 0 => {
                self.state().counter.fetch_add(n, Ordering::AcqRel);
            }
            n if n < 0 => self.release(n.saturating_neg()),
            _ => {}
        }
    }

    /// Marks one unit as done. Waking happens when the count reaches zero.
    pub fn signal(&self) {
        self.release(1);
    }

    fn release(&self, n: i32) {
        let counter = &self.state().counter;
        let mut current = counter.load(Ordering::Relaxed);
        loop {
            if current < n {
                tracing::error!(count = current, release = n, "wait group signaled more times than it was added");
                if cfg!(debug_assertions) {
                    panic!("wait group signaled more times than it was added (count {current}, release {n})");
                }
                return;
            }

            match counter.compare_exchange_weak(current, current - n, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if current == n {
            self.wake_waiters();
        }
    }

    fn wake_waiters(&self) {
        let state = self.state();
        let mut cursor = state.lock();
        state.unlock(0);

        while let Some(fiber) = decode(cursor) {
            let link = &self.shared.waiter_links[fiber.index()];
            // Read the link before requeueing: the fiber may park again right away.
            cursor = link.next.load(Ordering::Acquire);
            let priority = JobPriority::from_index(link.priority.load(Ordering::Relaxed) as usize);
            let affinity = Affinity::decode(link.affinity.load(Ordering::Relaxed));
            self.shared.add_ready_fiber(fiber, priority, affinity);
        }
    }

    /// Returns once the count is zero.
    pub fn wait(&self) {
        while !self.is_signaled() {
            match WorkerPool::current_for(&self.shared) {
                Some(worker) => self.park_fiber(&worker),
                None => self.block_thread(),
            }
        }
    }

    /// Parks the calling fiber until the count reaches zero and runs other
    /// work on this worker meanwhile.
    fn park_fiber(&self, worker: &CurrentWorker<'_>) {
        let waiting = worker.fiber();
        // Rent before publishing so an exhausted pool never strands a waiter.
        let next = worker.pool().rent_fiber(false);

        let state = self.state();
        let head = state.lock();
        if state.counter.load(Ordering::Acquire) == 0 {
            state.unlock(head);
            worker.pool().release_fiber(next);
            return;
        }

        let link = &self.shared.waiter_links[waiting.index()];
        link.next.store(head, Ordering::Relaxed);
        link.priority.store(worker.priority().index() as u8, Ordering::Relaxed);
        link.affinity.store(worker.affinity().encode(), Ordering::Relaxed);
        worker.pool().begin_suspend(waiting);
        state.unlock(encode(waiting));

        tracing::trace!(fiber = waiting.index(), "fiber parked on wait group");
        worker.pool().switch_from_waiting_fiber(waiting, next);
    }

    fn block_thread(&self) {
        let backoff = Backoff::new();
        while !backoff.is_completed() {
            if self.is_signaled() {
                return;
            }
            backoff.snooze();
        }

        let mut sleep = Duration::from_micros(1);
        while !self.is_signaled() {
            std::thread::sleep(sleep);
            sleep = (sleep * 2).min(MAX_BLOCKING_SLEEP);
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.count() == 0
    }

    pub fn count(&self) -> i32 {
        self.state().counter.load(Ordering::Acquire)
    }
}

impl Clone for WaitGroup {
    fn clone(&self) -> Self {
        self.state().refs.fetch_add(1, Ordering::Relaxed);
        WaitGroup {
            shared: self.shared.clone(),
            index: self.index,
        }
    }
}

impl Drop for WaitGroup {
    fn drop(&mut self) {
        if self.state().refs.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }

        fence(Ordering::Acquire);
        // SAFETY: this was the last handle.
        unsafe { self.shared.wait_groups.free(self.index) };
    }
}

impl std::fmt::Debug for WaitGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitGroup")
            .field("index", &self.index)
            .field("count", &self.count())
            .finish()
    }
}
