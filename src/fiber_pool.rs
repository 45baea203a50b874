//! Fixed pool of fibers carved out of one contiguous stack arena.
//!
//! The arena is split into two tiers: `fiber_count` normal stacks followed by
//! `extended_fiber_count` larger stacks for jobs with deep call chains. Every
//! stack sits directly above an inaccessible guard page, so overflowing a
//! fiber faults instead of running into its neighbour. Every fiber shares the
//! same entry callback (the scheduler's fiber body).

use crate::context::{Callback, Context, ContextHandle, TransferParams};
use crate::error::JobSystemError;
use crate::job_system::JobSystemConfig;
use crossbeam::utils::{Backoff, CachePadded};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

/// Full scans of a tier before [`FiberPool::rent`] gives up.
const RENT_ATTEMPTS: usize = 16;

/// Index of a fiber slot. Valid between [`FiberPool::rent`] and
/// [`FiberPool::release`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FiberHandle(u32);

impl FiberHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_index(index: u32) -> Self {
        FiberHandle(index)
    }
}

struct FiberInfo {
    is_free: AtomicBool,
    /// Set once a parked fiber has fully switched out and may be resumed.
    suspended: AtomicBool,
    context: AtomicUsize,
    name: String,
}

#[cfg(unix)]
fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).ok().filter(|size| size.is_power_of_two()).unwrap_or(4096)
}

#[cfg(not(unix))]
fn page_size() -> usize {
    4096
}

fn round_to_page(size: usize) -> usize {
    size.div_ceil(page_size()) * page_size()
}

/// Address space for every fiber stack. Reserved inaccessible; stacks are
/// opened up one by one with [`StackArena::commit`], and whatever is never
/// committed stays a guard.
struct StackArena {
    ptr: NonNull<u8>,
    len: usize,
}

#[cfg(unix)]
impl StackArena {
    fn new(len: usize) -> Result<Self, JobSystemError> {
        // SAFETY: a fresh anonymous private mapping aliases nothing.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            tracing::error!(len, error = %std::io::Error::last_os_error(), "failed to map fiber stacks");
            return Err(JobSystemError::StackAllocation { size: len });
        }

        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or(JobSystemError::StackAllocation { size: len })?;
        Ok(StackArena { ptr, len })
    }

    /// Makes `len` bytes at `offset` readable and writable.
    fn commit(&self, offset: usize, len: usize) -> Result<(), JobSystemError> {
        debug_assert!(offset + len <= self.len);
        // SAFETY: the range lies inside the mapping and is page aligned.
        let result = unsafe {
            libc::mprotect(
                self.ptr.as_ptr().add(offset).cast(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if result != 0 {
            tracing::error!(offset, len, error = %std::io::Error::last_os_error(), "failed to commit fiber stack");
            return Err(JobSystemError::StackAllocation { size: len });
        }
        Ok(())
    }
}

#[cfg(unix)]
impl Drop for StackArena {
    fn drop(&mut self) {
        // SAFETY: mapped in `new` with the same length.
        unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
    }
}

// Without `mmap` the arena is plain heap memory and guard pages stay writable.
#[cfg(not(unix))]
impl StackArena {
    fn new(len: usize) -> Result<Self, JobSystemError> {
        let layout = std::alloc::Layout::from_size_align(len, page_size())
            .map_err(|_| JobSystemError::StackAllocation { size: len })?;
        // SAFETY: the layout has a non-zero size (checked by the caller).
        let ptr = unsafe { std::alloc::alloc(layout) };
        let ptr = NonNull::new(ptr).ok_or(JobSystemError::StackAllocation { size: len })?;
        tracing::debug!("fiber stacks have no guard pages on this platform");
        Ok(StackArena { ptr, len })
    }

    fn commit(&self, _offset: usize, _len: usize) -> Result<(), JobSystemError> {
        Ok(())
    }
}

#[cfg(not(unix))]
impl Drop for StackArena {
    fn drop(&mut self) {
        if let Ok(layout) = std::alloc::Layout::from_size_align(self.len, page_size()) {
            // SAFETY: allocated in `new` with the same layout.
            unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

/// Pool of fibers. Renting and returning are lock-free.
pub struct FiberPool {
    fibers: Box<[CachePadded<FiberInfo>]>,
    normal_count: u32,
    extended_count: u32,
    index_seed: AtomicU32,
    // Dropped after `fibers` so contexts are destroyed while their stacks exist.
    arena: StackArena,
}

// SAFETY: the arena is only reached through contexts whose access is
// serialized by the `is_free` and running flags.
unsafe impl Send for FiberPool {}
unsafe impl Sync for FiberPool {}

impl FiberPool {
    /// Reserves the stack arena and formats one context per fiber, all
    /// entering `callback`.
    pub fn new(callback: Callback, config: &JobSystemConfig) -> Result<Self, JobSystemError> {
        let guard = page_size();
        let normal_size = round_to_page(config.stack_byte_size);
        let extended_size = round_to_page(config.extended_stack_byte_size);
        let normal_count = config.fiber_count;
        let extended_count = config.extended_fiber_count;

        // Each slot is a guard page followed by the stack proper.
        let total = (normal_count as usize)
            .checked_mul(guard + normal_size)
            .zip((extended_count as usize).checked_mul(guard + extended_size))
            .and_then(|(normal, extended)| normal.checked_add(extended))
            .filter(|&total| total > 0)
            .ok_or_else(|| JobSystemError::InvalidConfig("fiber stack arena size overflows".into()))?;

        let arena = StackArena::new(total)?;

        let mut fibers = Vec::with_capacity((normal_count + extended_count) as usize);
        let mut offset = 0;
        for index in 0..normal_count + extended_count {
            let (size, name) = if index < normal_count {
                (normal_size, format!("Fiber {index}"))
            } else {
                (extended_size, format!("Fiber Big {}", index - normal_count))
            };

            let stack_offset = offset + guard;
            arena.commit(stack_offset, size)?;

            // SAFETY: `stack_offset + size <= total`, the range was just made
            // writable, and the arena outlives every context.
            let context = unsafe { Context::create(arena.ptr.as_ptr().add(stack_offset), size, callback) };
            if !context.is_valid() {
                return Err(JobSystemError::InvalidConfig(format!(
                    "stack size {size} is too small for a fiber"
                )));
            }

            fibers.push(CachePadded::new(FiberInfo {
                is_free: AtomicBool::new(true),
                suspended: AtomicBool::new(false),
                context: AtomicUsize::new(context.into_raw()),
                name,
            }));
            offset = stack_offset + size;
        }

        tracing::debug!(
            normal_count,
            extended_count,
            arena_bytes = total,
            "fiber pool created"
        );

        Ok(FiberPool {
            fibers: fibers.into_boxed_slice(),
            normal_count,
            extended_count,
            index_seed: AtomicU32::new(0),
            arena,
        })
    }

    fn info(&self, fiber: FiberHandle) -> &FiberInfo {
        &self.fibers[fiber.index()]
    }

    /// Claims a free fiber from the normal or extended tier.
    ///
    /// Returns `None` once the tier stayed full for a bounded number of
    /// retries. Callers treat that as a capacity bug.
    pub fn rent(&self, extended: bool) -> Option<FiberHandle> {
        let (base, count) = if extended {
            (self.normal_count, self.extended_count)
        } else {
            (0, self.normal_count)
        };
        if count == 0 {
            return None;
        }

        // Spread concurrent renters over the tier.
        let seed = self.index_seed.fetch_add(1, Ordering::Relaxed);
        let offset = seed.wrapping_mul(0x9E37_79B9) % count;

        let backoff = Backoff::new();
        for _ in 0..RENT_ATTEMPTS {
            for step in 0..count {
                let index = base + (offset + step) % count;
                let info = &self.fibers[index as usize];
                if !info.is_free.load(Ordering::Relaxed) {
                    continue;
                }

                if info
                    .is_free
                    .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    tracing::trace!(fiber = %info.name, "fiber rented");
                    return Some(FiberHandle(index));
                }
            }
            backoff.snooze();
        }

        tracing::debug!(extended, capacity = count, "no free fiber in tier");
        None
    }

    /// Marks a fiber free again. The fiber must not be the one executing.
    pub fn release(&self, fiber: FiberHandle) {
        let info = self.info(fiber);

        if Context::current() == self.context(fiber) {
            tracing::error!(fiber = %info.name, "returning the running fiber");
            if cfg!(debug_assertions) {
                panic!("fiber {} returned while it is running", info.name);
            }
            return;
        }

        if info.is_free.swap(true, Ordering::Release) {
            tracing::error!(fiber = %info.name, "fiber returned twice");
            if cfg!(debug_assertions) {
                panic!("fiber {} returned twice", info.name);
            }
        }
    }

    /// Records where a suspended fiber must be resumed.
    pub fn update(&self, fiber: FiberHandle, context: ContextHandle) {
        self.info(fiber).context.store(context.into_raw(), Ordering::Release);
    }

    /// Resumes `to`, passing `user_data`, and returns when some fiber or root
    /// context switches back.
    pub fn switch(&self, to: FiberHandle, user_data: usize) -> TransferParams {
        let info = self.info(to);
        debug_assert!(!info.is_free.load(Ordering::Relaxed), "switch into a fiber that is not rented");
        tracing::trace!(fiber = %info.name, "switching to fiber");

        // SAFETY: the context was created over this pool's arena, which lives as
        // long as `self`. Resuming a running fiber panics inside `Context`.
        unsafe { Context::switch(self.context(to), user_data) }
    }

    pub fn context(&self, fiber: FiberHandle) -> ContextHandle {
        ContextHandle::from_raw(self.info(fiber).context.load(Ordering::Acquire))
    }

    /// Called by a parking fiber before it publishes itself as a waiter.
    pub(crate) fn begin_suspend(&self, fiber: FiberHandle) {
        self.info(fiber).suspended.store(false, Ordering::Relaxed);
    }

    /// Called once the parked fiber has fully switched out.
    pub(crate) fn finish_suspend(&self, fiber: FiberHandle) {
        self.info(fiber).suspended.store(true, Ordering::Release);
    }

    /// Claims the right to resume a parked fiber. Fails while the fiber is
    /// still switching out.
    pub(crate) fn try_take_suspended(&self, fiber: FiberHandle) -> bool {
        self.info(fiber)
            .suspended
            .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn name(&self, fiber: FiberHandle) -> &str {
        &self.info(fiber).name
    }

    pub fn is_extended(&self, fiber: FiberHandle) -> bool {
        fiber.0 >= self.normal_count
    }

    pub fn is_free(&self, fiber: FiberHandle) -> bool {
        self.info(fiber).is_free.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.fibers.len()
    }

    pub fn extended_capacity(&self) -> usize {
        self.extended_count as usize
    }

    pub fn free_count(&self) -> usize {
        self.fibers
            .iter()
            .filter(|info| info.is_free.load(Ordering::Acquire))
            .count()
    }
}

impl Drop for FiberPool {
    fn drop(&mut self) {
        for info in self.fibers.iter() {
            let context = ContextHandle::from_raw(info.context.load(Ordering::Acquire));
            if info.is_free.load(Ordering::Acquire) {
                // SAFETY: free fibers are not running and the arena is still allocated.
                unsafe { Context::destroy(context) };
            } else {
                tracing::error!(fiber = %info.name, "fiber still rented when the pool was destroyed");
            }
        }
        tracing::debug!(arena_bytes = self.arena.len, "fiber pool destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(fibers: u32, extended: u32) -> JobSystemConfig {
        JobSystemConfig {
            fiber_count: fibers,
            extended_fiber_count: extended,
            stack_byte_size: 64 * 1024,
            extended_stack_byte_size: 128 * 1024,
            ..JobSystemConfig::default()
        }
    }

    fn doubler(mut tp: TransferParams) {
        loop {
            tp = unsafe { Context::switch(tp.context, tp.user_data * 2) };
        }
    }

    #[test]
    fn test_rent_and_release() {
        let pool = FiberPool::new(doubler, &test_config(4, 2)).unwrap();
        assert_eq!(pool.capacity(), 6);
        assert_eq!(pool.free_count(), 6);

        let fiber = pool.rent(false).unwrap();
        assert!(!pool.is_extended(fiber));
        assert!(!pool.is_free(fiber));
        assert_eq!(pool.free_count(), 5);

        pool.release(fiber);
        assert_eq!(pool.free_count(), 6);
    }

    #[test]
    fn test_tiers() {
        let pool = FiberPool::new(doubler, &test_config(2, 1)).unwrap();

        let big = pool.rent(true).unwrap();
        assert!(pool.is_extended(big));
        assert!(pool.name(big).starts_with("Fiber Big"));
        assert!(pool.rent(true).is_none());

        let a = pool.rent(false).unwrap();
        let b = pool.rent(false).unwrap();
        assert_ne!(a, b);
        assert!(pool.rent(false).is_none());

        for fiber in [a, b, big] {
            pool.release(fiber);
        }
    }

    #[test]
    fn test_switch_runs_callback() {
        let pool = FiberPool::new(doubler, &test_config(2, 0)).unwrap();
        let fiber = pool.rent(false).unwrap();

        let tp = pool.switch(fiber, 21);
        assert_eq!(tp.user_data, 42);
        pool.update(fiber, tp.context);

        let tp = pool.switch(fiber, 5);
        assert_eq!(tp.user_data, 10);
        assert_eq!(tp.context, pool.context(fiber));

        pool.release(fiber);
    }

    #[test]
    #[should_panic(expected = "returned twice")]
    #[cfg(debug_assertions)]
    fn test_double_release_asserts() {
        let pool = FiberPool::new(doubler, &test_config(2, 0)).unwrap();
        let fiber = pool.rent(false).unwrap();
        pool.release(fiber);
        pool.release(fiber);
    }
}
