use crossbeam::atomic::AtomicCell;
use fiber_jobs::{JobPriority, JobSystem, JobSystemConfig, JobSystemError, JobSystemHandle};
use std::sync::Arc;
use std::time::Instant;

/// Arrays at most this long are sorted in place by a single job.
const MIN_JOB_ARRAY_LENGTH: usize = 128 * 1024;

const ARRAY_LENGTH: usize = 4 * 1024 * 1024;

fn merge(left: &[i32], right: &[i32]) -> Vec<i32> {
    let mut merged = Vec::with_capacity(left.len() + right.len());
    let (mut l, mut r) = (0, 0);
    while l < left.len() && r < right.len() {
        if left[l] < right[r] {
            merged.push(left[l]);
            l += 1;
        } else {
            merged.push(right[r]);
            r += 1;
        }
    }
    merged.extend_from_slice(&left[l..]);
    merged.extend_from_slice(&right[r..]);
    merged
}

/// Sorts both halves in child jobs, waits for them on the current fiber, and
/// merges the results.
fn merge_sort(jobs: &JobSystemHandle, mut values: Vec<i32>) -> SortResult {
    if values.len() <= MIN_JOB_ARRAY_LENGTH {
        values.sort_unstable();
        return Ok(values);
    }

    let right = values.split_off(values.len().div_ceil(2));
    let wait_group = jobs.wait_group()?;
    let [left, right] = [values, right].map(|half| {
        let sorted = Arc::new(AtomicCell::new(None));
        let slot = sorted.clone();
        let handle = jobs.clone();
        jobs.run_in(&wait_group, JobPriority::Normal, move || {
            slot.store(Some(merge_sort(&handle, half)));
        })
        .map(|()| sorted)
    });
    wait_group.wait();

    let left = take_sorted(&*left?)?;
    let right = take_sorted(&*right?)?;
    Ok(merge(&left, &right))
}

type SortResult = Result<Vec<i32>, JobSystemError>;

fn take_sorted(slot: &AtomicCell<Option<SortResult>>) -> SortResult {
    slot.take().unwrap_or(Err(JobSystemError::Stopped))
}

/// xorshift, good enough for test data.
fn random_values(len: usize, mut state: u32) -> Vec<i32> {
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as i32
        })
        .collect()
}

fn main() -> Result<(), JobSystemError> {
    println!("fiber-jobs - Fiber-Based Cooperative Job Scheduler\n");

    let job_system = JobSystem::start(JobSystemConfig::default())?;
    println!("Initialized job system with {} worker threads\n", job_system.num_workers());

    // Example 1: Simple job execution
    println!("Example 1: Simple job execution");
    let done = job_system.run(JobPriority::Normal, || {
        println!("  Hello from a fiber job!");
    })?;
    job_system.wait_for(&done);
    println!("  Job completed\n");

    // Example 2: Parallel merge sort with nested waits
    println!("Example 2: Parallel merge sort of {ARRAY_LENGTH} integers");
    let values = random_values(ARRAY_LENGTH, 0x2545_F491);
    let result = Arc::new(AtomicCell::new(None));

    let start = Instant::now();
    let handle = job_system.handle();
    let slot = result.clone();
    let done = job_system.run(JobPriority::High, move || {
        slot.store(Some(merge_sort(&handle, values)));
    })?;
    job_system.wait_for(&done);
    let duration = start.elapsed();

    let sorted = take_sorted(&result)?;
    let unsorted_pairs = sorted.windows(2).filter(|pair| pair[0] > pair[1]).count();
    println!("  Sorted {} values in {:?}", sorted.len(), duration);
    println!("  Unsorted pairs: {unsorted_pairs}\n");

    let metrics = job_system.metrics();
    println!(
        "Executed {} jobs, {} fiber switches, {} suspensions\n",
        metrics.jobs_executed, metrics.fiber_switches, metrics.suspensions
    );

    println!("Shutting down job system...");
    job_system.stop()?;
    println!("Done!");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_sort_nested_jobs() {
        let config = JobSystemConfig {
            worker_count: 2,
            fiber_count: 32,
            ..JobSystemConfig::default()
        };
        let job_system = JobSystem::start(config).unwrap();

        // Two levels of splitting before the halves are sorted in place.
        let values = random_values(MIN_JOB_ARRAY_LENGTH * 4 + 7, 0x1234_5678);
        let mut expected = values.clone();
        expected.sort_unstable();

        let result = Arc::new(AtomicCell::new(None));
        let handle = job_system.handle();
        let slot = result.clone();
        let done = job_system
            .run(JobPriority::Normal, move || {
                slot.store(Some(merge_sort(&handle, values)));
            })
            .unwrap();
        job_system.wait_for(&done);

        assert_eq!(take_sorted(&result).unwrap(), expected);
        job_system.stop().unwrap();
    }
}
