use fiber_jobs::{Job, JobPriority, JobScheduler, JobSystem, JobSystemConfig, JobSystemError};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn test_config(workers: usize) -> JobSystemConfig {
    JobSystemConfig {
        worker_count: workers,
        fiber_count: 32,
        extended_fiber_count: 0,
        ..JobSystemConfig::default()
    }
}

#[test]
fn test_shutdown_during_job_execution() {
    let job_system = JobSystem::start(test_config(2)).unwrap();
    let completed = Arc::new(AtomicUsize::new(0));

    for _ in 0..10 {
        let completed = completed.clone();
        job_system
            .run(JobPriority::Normal, move || {
                std::thread::sleep(Duration::from_millis(10));
                completed.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    // Stop without waiting: queued jobs are drained first.
    let result = job_system.stop();
    assert!(result.is_ok(), "Shutdown should succeed after jobs complete");
    assert_eq!(completed.load(Ordering::SeqCst), 10);
}

#[test]
fn test_jobs_spawned_while_draining_still_run() {
    let job_system = JobSystem::start(test_config(2)).unwrap();
    let handle = job_system.handle();
    let completed = Arc::new(AtomicUsize::new(0));

    let counter = completed.clone();
    job_system
        .run(JobPriority::Normal, move || {
            std::thread::sleep(Duration::from_millis(20));
            let children = handle.wait_group().unwrap();
            for _ in 0..5 {
                let counter = counter.clone();
                handle
                    .run_in(&children, JobPriority::Low, move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
            }
            children.wait();
        })
        .unwrap();

    job_system.stop().unwrap();
    assert_eq!(completed.load(Ordering::SeqCst), 5);
}

#[test]
fn test_drop_stops_job_system() {
    let completed = Arc::new(AtomicUsize::new(0));
    {
        let job_system = JobSystem::start(test_config(1)).unwrap();
        let counter = completed.clone();
        job_system
            .run(JobPriority::Normal, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    assert_eq!(completed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_handle_rejects_work_after_stop() {
    let job_system = JobSystem::start(test_config(1)).unwrap();
    let handle = job_system.handle();
    job_system.stop().unwrap();

    let job = Job::new(|| {});
    assert!(matches!(handle.add_job(job.clone(), JobPriority::Normal), Err(JobSystemError::Stopped)));
    assert!(matches!(handle.run(JobPriority::Normal, || {}), Err(JobSystemError::Stopped)));
}

#[test]
fn test_wait_group_outlives_job_system() {
    let job_system = JobSystem::start(test_config(1)).unwrap();
    let done = job_system.run(JobPriority::Normal, || {}).unwrap();
    job_system.stop().unwrap();

    // The block pool lives as long as any wait group handle.
    assert!(done.is_signaled());
    done.wait();
    let clone = done.clone();
    drop(done);
    assert_eq!(clone.count(), 0);
}

#[test]
fn test_start_stop_repeatedly() {
    for workers in 1..=4 {
        let job_system = JobSystem::start(test_config(workers)).unwrap();
        assert_eq!(job_system.num_workers(), workers);
        job_system.stop().unwrap();
    }
}
