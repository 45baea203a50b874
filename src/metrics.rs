use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Performance counters for the job system.
///
/// All counters are updated with relaxed ordering, so a snapshot taken while
/// workers are busy is approximate.
#[derive(Debug)]
pub struct Metrics {
    /// Jobs accepted by `add_job`.
    pub jobs_submitted: AtomicU64,
    /// Jobs whose work has run (including panicked ones).
    pub jobs_executed: AtomicU64,
    /// Jobs whose work panicked.
    pub jobs_panicked: AtomicU64,
    /// Switches from one fiber to another.
    pub fiber_switches: AtomicU64,
    /// Fibers parked on a wait group.
    pub suspensions: AtomicU64,
    /// Time when metrics collection started.
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            jobs_submitted: AtomicU64::new(0),
            jobs_executed: AtomicU64::new(0),
            jobs_panicked: AtomicU64::new(0),
            fiber_switches: AtomicU64::new(0),
            suspensions: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of current metrics values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_executed: self.jobs_executed.load(Ordering::Relaxed),
            jobs_panicked: self.jobs_panicked.load(Ordering::Relaxed),
            fiber_switches: self.fiber_switches.load(Ordering::Relaxed),
            suspensions: self.suspensions.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_executed: u64,
    pub jobs_panicked: u64,
    pub fiber_switches: u64,
    pub suspensions: u64,
    pub elapsed_seconds: f64,
}

impl MetricsSnapshot {
    /// Calculates jobs per second throughput.
    pub fn jobs_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.jobs_executed as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    /// Approximates the number of queued or running jobs.
    pub fn pending_jobs(&self) -> i64 {
        self.jobs_submitted as i64 - self.jobs_executed as i64
    }
}
