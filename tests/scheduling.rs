use fiber_jobs::{
    Affinity, Job, JobPriority, JobRef, JobScheduler, JobSystem, JobSystemConfig, JobSystemError, ScheduledJob,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};

fn test_config(workers: usize) -> JobSystemConfig {
    JobSystemConfig {
        worker_count: workers,
        fiber_count: 32,
        extended_fiber_count: 2,
        ..JobSystemConfig::default()
    }
}

#[test]
fn test_higher_priority_runs_first() {
    let job_system = JobSystem::start(test_config(1)).unwrap();

    // Hold the only worker until everything else is queued.
    let started = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    let (s, r) = (started.clone(), release.clone());
    let gate = job_system
        .run(JobPriority::Normal, move || {
            s.wait();
            r.wait();
        })
        .unwrap();
    started.wait();

    let order = Arc::new(Mutex::new(Vec::new()));
    let group = job_system.wait_group().unwrap();
    let handle = job_system.handle();
    for priority in [JobPriority::Low, JobPriority::Normal, JobPriority::High] {
        let order = order.clone();
        handle
            .run_in(&group, priority, move || order.lock().unwrap().push(priority))
            .unwrap();
    }

    release.wait();
    job_system.wait_for(&gate);
    job_system.wait_for(&group);

    assert_eq!(
        *order.lock().unwrap(),
        vec![JobPriority::High, JobPriority::Normal, JobPriority::Low]
    );
    job_system.stop().unwrap();
}

#[test]
fn test_every_job_runs_exactly_once() {
    const JOBS: usize = 1000;
    let job_system = JobSystem::start(test_config(4)).unwrap();
    let runs: Arc<Vec<AtomicUsize>> = Arc::new((0..JOBS).map(|_| AtomicUsize::new(0)).collect());

    let jobs = (0..JOBS).map(|index| {
        let runs = runs.clone();
        move || {
            runs[index].fetch_add(1, Ordering::Relaxed);
        }
    });
    let done = job_system.run_multiple(JobPriority::Normal, jobs).unwrap();
    job_system.wait_for(&done);

    assert!(runs.iter().all(|count| count.load(Ordering::Relaxed) == 1));

    let metrics = job_system.metrics();
    assert_eq!(metrics.jobs_submitted, JOBS as u64);
    assert_eq!(metrics.jobs_executed, JOBS as u64);
    assert_eq!(metrics.pending_jobs(), 0);
    job_system.stop().unwrap();
}

#[test]
fn test_mixed_priorities_all_complete() {
    let job_system = JobSystem::start(test_config(3)).unwrap();
    let handle = job_system.handle();
    let total = Arc::new(AtomicUsize::new(0));
    let group = job_system.wait_group().unwrap();

    for i in 0..300 {
        let priority = match i % 3 {
            0 => JobPriority::Low,
            1 => JobPriority::Normal,
            _ => JobPriority::High,
        };
        let total = total.clone();
        handle
            .run_in(&group, priority, move || {
                total.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
    }

    group.wait();
    assert_eq!(total.load(Ordering::Relaxed), 300);
    job_system.stop().unwrap();
}

#[test]
fn test_wait_group_from_plain_thread() {
    let job_system = JobSystem::start(test_config(2)).unwrap();
    let group = job_system.wait_group().unwrap();
    group.add(3);

    let waiter = {
        let group = group.clone();
        std::thread::spawn(move || group.wait())
    };

    let handle = job_system.handle();
    for _ in 0..3 {
        let group = group.clone();
        handle.run(JobPriority::Normal, move || group.signal()).unwrap();
    }

    waiter.join().unwrap();
    assert!(group.is_signaled());
    job_system.stop().unwrap();
}

#[test]
fn test_wait_group_negative_add() {
    let job_system = JobSystem::start(test_config(1)).unwrap();
    let group = job_system.wait_group().unwrap();
    group.add(4);
    group.add(-3);
    assert_eq!(group.count(), 1);
    group.signal();
    group.wait();
    job_system.stop().unwrap();
}

#[test]
fn test_wait_group_pool_exhaustion() {
    let config = JobSystemConfig {
        small_block_count: 2,
        ..test_config(1)
    };
    let job_system = JobSystem::start(config).unwrap();

    let first = job_system.wait_group().unwrap();
    let second = job_system.wait_group().unwrap();
    assert!(matches!(
        job_system.wait_group(),
        Err(JobSystemError::SmallBlockPoolExhausted { capacity: 2 })
    ));

    drop(first);
    let third = job_system.wait_group().unwrap();
    drop((second, third));
    job_system.stop().unwrap();
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "signaled more times than it was added")]
fn test_over_signal_asserts() {
    let job_system = JobSystem::start(test_config(1)).unwrap();
    let group = job_system.wait_group().unwrap();
    group.add(1);
    group.signal();
    group.signal();
}

/// Accepts jobs without ever running them.
#[derive(Default)]
struct Inbox {
    jobs: Mutex<Vec<JobRef>>,
}

impl JobScheduler for Inbox {
    fn enqueue(&self, job: ScheduledJob, _priority: JobPriority, _affinity: Affinity) -> Result<(), JobSystemError> {
        self.jobs.lock().unwrap().push(job.into_job());
        Ok(())
    }
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "job is already scheduled")]
fn test_double_schedule_asserts() {
    let inbox = Inbox::default();
    let job = Job::new(|| {});
    job.schedule(&inbox, None, JobPriority::Normal).unwrap();
    let _ = job.schedule(&inbox, None, JobPriority::Normal);
}

#[test]
fn test_custom_scheduler_receives_job() {
    let inbox = Inbox::default();
    let job = Job::new(|| {});
    job.schedule(&inbox, None, JobPriority::High).unwrap();

    assert!(job.is_scheduled());
    assert_eq!(inbox.jobs.lock().unwrap().len(), 1);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "job is already scheduled")]
fn test_add_job_twice_asserts() {
    let inbox = Inbox::default();
    let job = Job::new(|| {});
    inbox.add_job(job.clone(), JobPriority::Normal).unwrap();
    let _ = inbox.add_job(job, JobPriority::Normal);
}

#[test]
#[cfg(not(debug_assertions))]
fn test_add_job_twice_is_rejected() {
    let inbox = Inbox::default();
    let job = Job::new(|| {});
    inbox.add_job(job.clone(), JobPriority::Normal).unwrap();
    assert!(matches!(
        inbox.add_job(job.clone(), JobPriority::Normal),
        Err(JobSystemError::AlreadyScheduled)
    ));
    assert_eq!(inbox.jobs.lock().unwrap().len(), 1);
}

#[test]
fn test_add_job_marks_job_scheduled() {
    let inbox = Inbox::default();
    let job = Job::new(|| {});
    inbox.add_job(job.clone(), JobPriority::Low).unwrap();
    assert!(job.is_scheduled());
}
