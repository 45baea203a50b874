//! Raw stack-switch primitive that fibers are built on.
//!
//! A context is a suspended stack. [`Context::create`] formats a caller-owned
//! memory region into a context that runs a callback on first resumption, and
//! [`Context::switch`] transfers control between contexts, carrying one machine
//! word of payload in each direction.
//!
//! Switching is built on `corosensei` coroutines. Coroutines are asymmetric
//! (resume/suspend), so every OS thread runs a small trampoline on its native
//! stack: a context that switches away suspends back into the trampoline, which
//! then resumes the requested target. From the caller's point of view any
//! context can switch directly to any other, and a suspended context may be
//! resumed from a different thread than the one it suspended on.
//!
//! This layer does not allocate and does not synchronize beyond refusing to
//! resume a context that is already running.

use corosensei::stack::Stack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::cell::{Cell, UnsafeCell};
use std::mem::{align_of, size_of};
use std::num::NonZeroUsize;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

/// Alignment of the top of every context stack.
pub const STACK_ALIGNMENT: usize = 16;

/// Smallest usable stack (after the context record is carved out) accepted by
/// [`Context::create`].
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Opaque token identifying a suspended context.
///
/// The handle never owns the stack memory it refers to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ContextHandle(usize);

impl ContextHandle {
    /// The unset handle.
    pub const INVALID: Self = ContextHandle(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Converts the handle into a word that can travel as switch payload.
    pub fn into_raw(self) -> usize {
        self.0
    }

    /// Rebuilds a handle from [`ContextHandle::into_raw`].
    pub fn from_raw(raw: usize) -> Self {
        ContextHandle(raw)
    }

    fn record(self) -> *const ContextRecord {
        self.0 as *const ContextRecord
    }
}

/// Delivered to a context every time control transfers into it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferParams {
    /// The context that just switched away.
    pub context: ContextHandle,
    /// Payload passed by that context.
    pub user_data: usize,
}

/// Entry point of a context. It must never return: the last thing it does is
/// switch away for good.
pub type Callback = fn(TransferParams);

struct SwitchRequest {
    to: ContextHandle,
    user_data: usize,
}

type ContextYielder = Yielder<TransferParams, SwitchRequest>;
type ContextCoroutine = Coroutine<TransferParams, SwitchRequest, (), SliceStack>;

/// Lives at the top of the caller's stack buffer. Roots live in thread-local
/// storage and carry no coroutine.
struct ContextRecord {
    coroutine: UnsafeCell<Option<ContextCoroutine>>,
    yielder: Cell<*const ContextYielder>,
    running: AtomicBool,
}

impl ContextRecord {
    const fn root() -> Self {
        ContextRecord {
            coroutine: UnsafeCell::new(None),
            yielder: Cell::new(ptr::null()),
            running: AtomicBool::new(true),
        }
    }
}

/// A stack carved out of memory owned by someone else.
#[derive(Debug)]
struct SliceStack {
    base: NonZeroUsize,
    limit: NonZeroUsize,
}

// SAFETY: `base` and `limit` bound a writable region that the creator of the
// context keeps alive and unmoved for the lifetime of the coroutine.
unsafe impl Stack for SliceStack {
    fn base(&self) -> NonZeroUsize {
        self.base
    }

    fn limit(&self) -> NonZeroUsize {
        self.limit
    }

    #[cfg(windows)]
    fn teb_fields(&self) -> corosensei::stack::StackTebFields {
        corosensei::stack::StackTebFields {
            StackBase: self.base.get(),
            StackLimit: self.limit.get(),
            DeallocationStack: self.limit.get(),
            GuaranteedStackBytes: 0,
        }
    }

    #[cfg(windows)]
    fn update_teb_fields(&mut self, _stack_limit: usize, _guaranteed_stack_bytes: usize) {}
}

thread_local! {
    static ROOT: ContextRecord = const { ContextRecord::root() };
    static RUNNING: Cell<usize> = const { Cell::new(0) };
}

// Thread-local accessors stay out of line: a context may resume on another
// thread, so a TLS address must never be cached across a switch.
#[inline(never)]
fn root_handle() -> ContextHandle {
    ROOT.with(|root| ContextHandle(root as *const ContextRecord as usize))
}

#[inline(never)]
fn running_context() -> usize {
    RUNNING.get()
}

#[inline(never)]
fn set_running_context(raw: usize) {
    RUNNING.set(raw);
}

/// Marks a context as running on this thread for the duration of a resume.
struct RunningGuard<'a> {
    record: &'a ContextRecord,
}

impl<'a> RunningGuard<'a> {
    fn enter(handle: ContextHandle, record: &'a ContextRecord) -> Self {
        if record.running.swap(true, Ordering::Acquire) {
            panic!("context {handle:?} is already running");
        }
        set_running_context(handle.0);
        RunningGuard { record }
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        set_running_context(0);
        self.record.running.store(false, Ordering::Release);
    }
}

/// Namespace for the context operations.
#[derive(Debug)]
pub struct Context;

impl Context {
    /// Formats `stack_byte_size` bytes at `stack` into a resumable context whose
    /// first resumption calls `callback`.
    ///
    /// Returns [`ContextHandle::INVALID`] if the region is too small.
    ///
    /// # Safety
    ///
    /// The region must be writable, must not be used for anything else, and
    /// must stay valid and unmoved until the context is passed to
    /// [`Context::destroy`] (or abandoned without ever being resumed again).
    pub unsafe fn create(stack: *mut u8, stack_byte_size: usize, callback: Callback) -> ContextHandle {
        let start = stack as usize;
        let Some(end) = start.checked_add(stack_byte_size) else {
            return ContextHandle::INVALID;
        };

        let record_align = align_of::<ContextRecord>().max(STACK_ALIGNMENT);
        let Some(record_addr) = end.checked_sub(size_of::<ContextRecord>()).map(|addr| addr & !(record_align - 1))
        else {
            return ContextHandle::INVALID;
        };

        let base = record_addr & !(STACK_ALIGNMENT - 1);
        let limit = (start + STACK_ALIGNMENT - 1) & !(STACK_ALIGNMENT - 1);
        if record_addr < start || base <= limit || base - limit < MIN_STACK_SIZE {
            tracing::warn!(stack_byte_size, "stack too small for a context");
            return ContextHandle::INVALID;
        }

        let (Some(base), Some(limit)) = (NonZeroUsize::new(base), NonZeroUsize::new(limit)) else {
            return ContextHandle::INVALID;
        };

        let record = record_addr as *mut ContextRecord;
        // SAFETY: `record_addr` is aligned and lies inside the caller's region,
        // above the stack limit handed to the coroutine.
        unsafe {
            record.write(ContextRecord {
                coroutine: UnsafeCell::new(None),
                yielder: Cell::new(ptr::null()),
                running: AtomicBool::new(false),
            });
        }

        let coroutine = Coroutine::with_stack(SliceStack { base, limit }, move |yielder: &ContextYielder, input| {
            // SAFETY: the record outlives the coroutine stored inside it.
            let record = unsafe { &*(record_addr as *const ContextRecord) };
            record.yielder.set(yielder as *const ContextYielder);
            callback(input);
        });

        // SAFETY: nobody can observe the record before the handle is returned.
        unsafe {
            *(*record).coroutine.get() = Some(coroutine);
        }

        ContextHandle(record_addr)
    }

    /// Suspends the calling context and resumes `to`, passing `user_data`.
    ///
    /// Returns once some context switches back to the caller, describing who
    /// did so and what they passed.
    ///
    /// # Panics
    ///
    /// Panics if `to` is already running, or if it is the root context of a
    /// different thread.
    ///
    /// # Safety
    ///
    /// `to` must come from [`Context::create`] or [`Context::current`] and must
    /// not have been destroyed.
    pub unsafe fn switch(to: ContextHandle, user_data: usize) -> TransferParams {
        match running_context() {
            0 => {
                // SAFETY: forwarded from the caller.
                unsafe { trampoline(root_handle(), to, user_data) }
            }
            current => {
                // SAFETY: a running context's record is alive, and its yielder
                // was installed before its callback started.
                let yielder = unsafe { &*(*(current as *const ContextRecord)).yielder.get() };
                yielder.suspend(SwitchRequest { to, user_data })
            }
        }
    }

    /// Handle of the context running on this thread. Outside of any created
    /// context this is the thread's root context.
    pub fn current() -> ContextHandle {
        match running_context() {
            0 => root_handle(),
            current => ContextHandle(current),
        }
    }

    /// Whether the caller runs on a created context rather than a thread's
    /// native stack.
    pub fn in_context() -> bool {
        running_context() != 0
    }

    /// Releases a context without unwinding it. Whatever frames are suspended
    /// on its stack are abandoned; their destructors do not run.
    ///
    /// # Safety
    ///
    /// `handle` must come from [`Context::create`], must not be running, and
    /// must not be used again. The stack memory must still be valid.
    pub unsafe fn destroy(handle: ContextHandle) {
        let record = handle.record() as *mut ContextRecord;
        // SAFETY: forwarded from the caller.
        unsafe {
            assert!(!(*record).running.load(Ordering::Acquire), "destroying a running context");
            if let Some(coroutine) = (*(*record).coroutine.get()).as_mut() {
                if coroutine.started() && !coroutine.done() {
                    coroutine.force_reset();
                }
            }
            ptr::drop_in_place(record);
        }
    }
}

/// Runs on a thread's native stack and bounces between contexts until one of
/// them switches back to `root`.
unsafe fn trampoline(root: ContextHandle, to: ContextHandle, user_data: usize) -> TransferParams {
    let mut transfer = TransferParams { context: root, user_data };
    let mut target = to;

    while target != root {
        assert!(target.is_valid(), "switch to an invalid context");

        // SAFETY: the caller guarantees `target` refers to a live record.
        let record = unsafe { &*target.record() };
        let guard = RunningGuard::enter(target, record);

        // SAFETY: the running flag grants exclusive access to the coroutine.
        let Some(coroutine) = (unsafe { (*record.coroutine.get()).as_mut() }) else {
            panic!("context {target:?} belongs to another thread");
        };

        let result = coroutine.resume(transfer);
        drop(guard);

        match result {
            CoroutineResult::Yield(request) => {
                transfer = TransferParams {
                    context: target,
                    user_data: request.user_data,
                };
                target = request.to;
            }
            CoroutineResult::Return(()) => panic!("context {target:?} returned from its entry callback"),
        }
    }

    transfer
}
