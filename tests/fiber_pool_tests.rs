use fiber_jobs::{Context, FiberPool, JobSystemConfig, TransferParams};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

fn idle(mut transfer: TransferParams) {
    loop {
        transfer = unsafe { Context::switch(transfer.context, transfer.user_data) };
    }
}

fn pool_config(fibers: u32, extended: u32) -> JobSystemConfig {
    JobSystemConfig {
        fiber_count: fibers,
        extended_fiber_count: extended,
        stack_byte_size: 64 * 1024,
        extended_stack_byte_size: 256 * 1024,
        ..JobSystemConfig::default()
    }
}

#[test]
fn test_fiber_names() {
    let pool = FiberPool::new(idle, &pool_config(3, 2)).unwrap();
    assert_eq!(pool.capacity(), 5);
    assert_eq!(pool.extended_capacity(), 2);

    let mut names = HashSet::new();
    let mut rented = Vec::new();
    for extended in [false, false, false, true, true] {
        let fiber = pool.rent(extended).unwrap();
        names.insert(pool.name(fiber).to_string());
        rented.push(fiber);
    }

    let expected: HashSet<String> = ["Fiber 0", "Fiber 1", "Fiber 2", "Fiber Big 0", "Fiber Big 1"]
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(names, expected);

    for fiber in rented {
        pool.release(fiber);
    }
}

#[test]
fn test_pool_conservation_under_contention() {
    let pool = Arc::new(FiberPool::new(idle, &pool_config(16, 0)).unwrap());
    let rents = Arc::new(AtomicUsize::new(0));
    // One flag per slot, set by whoever currently holds the fiber.
    let owned: Arc<Vec<AtomicBool>> = Arc::new((0..pool.capacity()).map(|_| AtomicBool::new(false)).collect());

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let pool = pool.clone();
            let rents = rents.clone();
            let owned = owned.clone();
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    // Four threads holding at most two fibers each never exhaust 16.
                    let a = pool.rent(false).expect("pool exhausted");
                    let b = pool.rent(false).expect("pool exhausted");
                    for fiber in [a, b] {
                        let held = owned[fiber.index()].swap(true, Ordering::AcqRel);
                        assert!(!held, "fiber {} rented by two threads", fiber.index());
                    }
                    std::thread::yield_now();
                    for fiber in [a, b] {
                        owned[fiber.index()].store(false, Ordering::Release);
                        pool.release(fiber);
                    }
                    rents.fetch_add(2, Ordering::Relaxed);
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().unwrap();
    }

    assert_eq!(rents.load(Ordering::Relaxed), 8000);
    assert_eq!(pool.free_count(), pool.capacity());
    assert!(owned.iter().all(|flag| !flag.load(Ordering::Acquire)));
}

#[test]
fn test_switch_through_pool() {
    let pool = FiberPool::new(idle, &pool_config(2, 0)).unwrap();
    let fiber = pool.rent(false).unwrap();

    for value in 1..=5 {
        let transfer = pool.switch(fiber, value);
        assert_eq!(transfer.user_data, value);
        assert_eq!(transfer.context, pool.context(fiber));
        pool.update(fiber, transfer.context);
    }

    pool.release(fiber);
    assert!(pool.is_free(fiber));
}

#[test]
fn test_too_small_stack_rejected() {
    let config = JobSystemConfig {
        stack_byte_size: 4096,
        ..pool_config(2, 0)
    };
    assert!(FiberPool::new(idle, &config).is_err());
}
