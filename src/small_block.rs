//! Fixed-capacity block pool used for wait group state.
//!
//! Blocks are addressed by index. Allocation pops a free index from a
//! lock-free queue, so creating a wait group on the hot submission path never
//! touches the general-purpose allocator.

use crossbeam::queue::ArrayQueue;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, Ordering};

pub(crate) struct SmallBlockPool<T> {
    blocks: Box<[UnsafeCell<MaybeUninit<T>>]>,
    live: Box<[AtomicBool]>,
    free: ArrayQueue<u32>,
}

// SAFETY: a block is only written by the thread that popped its index and only
// dropped by the thread that frees it; shared access goes through `&T`.
unsafe impl<T: Send + Sync> Sync for SmallBlockPool<T> {}
unsafe impl<T: Send> Send for SmallBlockPool<T> {}

impl<T> SmallBlockPool<T> {
    /// Creates a pool with `capacity` blocks. `capacity` must be non-zero.
    pub(crate) fn new(capacity: u32) -> Self {
        let free = ArrayQueue::new(capacity as usize);
        for index in 0..capacity {
            let _ = free.push(index);
        }

        SmallBlockPool {
            blocks: (0..capacity).map(|_| UnsafeCell::new(MaybeUninit::uninit())).collect(),
            live: (0..capacity).map(|_| AtomicBool::new(false)).collect(),
            free,
        }
    }

    /// Moves `value` into a free block. Hands the value back if the pool is
    /// exhausted.
    pub(crate) fn allocate(&self, value: T) -> Result<u32, T> {
        let Some(index) = self.free.pop() else {
            return Err(value);
        };

        // SAFETY: the index came off the free list, so no one else holds it.
        unsafe { (*self.blocks[index as usize].get()).write(value) };
        self.live[index as usize].store(true, Ordering::Release);
        Ok(index)
    }

    /// # Safety
    ///
    /// `index` must have been returned by [`allocate`](Self::allocate) and not
    /// freed since.
    pub(crate) unsafe fn get(&self, index: u32) -> &T {
        debug_assert!(self.live[index as usize].load(Ordering::Relaxed), "block {index} is not allocated");
        // SAFETY: forwarded from the caller.
        unsafe { (*self.blocks[index as usize].get()).assume_init_ref() }
    }

    /// Drops the value in the block and puts the block back on the free list.
    ///
    /// # Safety
    ///
    /// `index` must be allocated and no references into the block may remain.
    pub(crate) unsafe fn free(&self, index: u32) {
        if !self.live[index as usize].swap(false, Ordering::AcqRel) {
            tracing::error!(index, "small block freed twice");
            if cfg!(debug_assertions) {
                panic!("small block {index} freed twice");
            }
            return;
        }

        // SAFETY: forwarded from the caller.
        unsafe { (*self.blocks[index as usize].get()).assume_init_drop() };
        let _ = self.free.push(index);
    }

    pub(crate) fn capacity(&self) -> usize {
        self.blocks.len()
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        self.free.len()
    }
}

impl<T> Drop for SmallBlockPool<T> {
    fn drop(&mut self) {
        for (block, live) in self.blocks.iter_mut().zip(self.live.iter()) {
            if live.load(Ordering::Acquire) {
                // SAFETY: live blocks hold an initialized value and we have `&mut self`.
                unsafe { block.get_mut().assume_init_drop() };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_allocate_until_exhausted() {
        let pool = SmallBlockPool::new(2);
        let a = pool.allocate(10u64).unwrap();
        let b = pool.allocate(20u64).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.allocate(30u64), Err(30));

        unsafe {
            assert_eq!(*pool.get(a), 10);
            assert_eq!(*pool.get(b), 20);
            pool.free(a);
        }
        assert_eq!(pool.available(), 1);

        let c = pool.allocate(40u64).unwrap();
        assert_eq!(c, a);
        assert_eq!(unsafe { *pool.get(c) }, 40);
    }

    #[test]
    fn test_free_drops_value() {
        let marker = Arc::new(());
        let pool = SmallBlockPool::new(4);
        let index = pool.allocate(marker.clone()).unwrap();
        assert_eq!(Arc::strong_count(&marker), 2);

        unsafe { pool.free(index) };
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn test_drop_releases_live_blocks() {
        let marker = Arc::new(());
        {
            let pool = SmallBlockPool::new(4);
            pool.allocate(marker.clone()).unwrap();
            pool.allocate(marker.clone()).unwrap();
            assert_eq!(Arc::strong_count(&marker), 3);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn test_concurrent_allocate_free() {
        let pool = Arc::new(SmallBlockPool::new(64));
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for i in 0..1000u64 {
                        let index = pool.allocate(t * 10_000 + i).unwrap();
                        assert_eq!(unsafe { *pool.get(index) }, t * 10_000 + i);
                        unsafe { pool.free(index) };
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(pool.available(), pool.capacity());
    }
}
