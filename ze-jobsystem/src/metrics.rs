//! Scheduler metrics: live atomic counters plus a point-in-time snapshot.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

const MAX_TRACKED_WORKERS: usize = 64;

/// Live, atomically-updated counters. Gated by
/// [`crate::scheduler::SchedulerConfig::enable_profiling`].
#[derive(Debug)]
pub struct JobMetrics {
    pub(crate) total_scheduled: AtomicU64,
    pub(crate) total_completed: AtomicU64,
    pub(crate) total_stolen: AtomicU64,
    pub(crate) active_workers: AtomicU32,
    pub(crate) idle_workers: AtomicU32,
    // Latency is tracked as a running (count, total-nanos) pair rather than
    // a float so updates stay lock-free; the snapshot divides them.
    pub(crate) latency_count: AtomicU64,
    pub(crate) latency_total_nanos: AtomicU64,
    pub(crate) worker_queue_sizes: Mutex<Vec<usize>>,
    // Tracks in-flight asset loads for introspection. Balanced 1:1 by the
    // asset pipeline regardless of which phase an individual load stops at.
    pub(crate) pending_asset_loads: AtomicU64,
    // Wall-clock anchor for the throughput figure in the snapshot; reset
    // alongside the counters by `reset()`.
    started_at: Mutex<Instant>,
}

impl JobMetrics {
    pub fn new(num_workers: usize) -> Self {
        Self {
            total_scheduled: AtomicU64::new(0),
            total_completed: AtomicU64::new(0),
            total_stolen: AtomicU64::new(0),
            active_workers: AtomicU32::new(0),
            idle_workers: AtomicU32::new(num_workers as u32),
            latency_count: AtomicU64::new(0),
            latency_total_nanos: AtomicU64::new(0),
            worker_queue_sizes: Mutex::new(vec![0; num_workers.min(MAX_TRACKED_WORKERS)]),
            pending_asset_loads: AtomicU64::new(0),
            started_at: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn record_asset_load_started(&self) {
        self.pending_asset_loads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_asset_load_finished(&self) {
        self.pending_asset_loads.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn pending_asset_loads(&self) -> u64 {
        self.pending_asset_loads.load(Ordering::Relaxed)
    }

    pub(crate) fn record_scheduled(&self) {
        self.total_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self, latency: Duration) {
        self.total_completed.fetch_add(1, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
        self.latency_total_nanos
            .fetch_add(latency.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_stolen(&self) {
        self.total_stolen.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_worker_active(&self, active: bool) {
        if active {
            self.active_workers.fetch_add(1, Ordering::Relaxed);
            self.idle_workers.fetch_sub(1, Ordering::Relaxed);
        } else {
            self.active_workers.fetch_sub(1, Ordering::Relaxed);
            self.idle_workers.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn set_worker_queue_size(&self, worker: usize, size: usize) {
        if let Some(slot) = self.worker_queue_sizes.lock().get_mut(worker) {
            *slot = size;
        }
    }

    pub fn reset(&self) {
        self.total_scheduled.store(0, Ordering::Relaxed);
        self.total_completed.store(0, Ordering::Relaxed);
        self.total_stolen.store(0, Ordering::Relaxed);
        self.latency_count.store(0, Ordering::Relaxed);
        self.latency_total_nanos.store(0, Ordering::Relaxed);
        *self.started_at.lock() = Instant::now();
    }

    pub fn snapshot(
        &self,
        global_queue_size: usize,
        global_queue_capacity: usize,
        command_buffer_size: usize,
    ) -> JobMetricsSnapshot {
        let latency_count = self.latency_count.load(Ordering::Relaxed);
        let avg_latency_ms = if latency_count > 0 {
            let total_nanos = self.latency_total_nanos.load(Ordering::Relaxed);
            (total_nanos as f64 / latency_count as f64) / 1_000_000.0
        } else {
            0.0
        };
        let total_completed = self.total_completed.load(Ordering::Relaxed);
        let elapsed = self.started_at.lock().elapsed().as_secs_f64();
        let throughput = if elapsed > 0.0 {
            total_completed as f64 / elapsed
        } else {
            0.0
        };

        JobMetricsSnapshot {
            total_jobs_scheduled: self.total_scheduled.load(Ordering::Relaxed),
            total_jobs_completed: total_completed,
            total_jobs_stolen: self.total_stolen.load(Ordering::Relaxed),
            global_queue_size,
            global_queue_capacity,
            command_buffer_size,
            worker_queue_sizes: self.worker_queue_sizes.lock().clone(),
            avg_job_latency_ms: avg_latency_ms,
            throughput,
            active_workers: self.active_workers.load(Ordering::Relaxed),
            idle_workers: self.idle_workers.load(Ordering::Relaxed),
            pending_asset_loads: self.pending_asset_loads.load(Ordering::Relaxed),
        }
    }
}

/// Non-atomic snapshot of [`JobMetrics`], safe to copy around.
#[derive(Debug, Clone, Default)]
pub struct JobMetricsSnapshot {
    pub total_jobs_scheduled: u64,
    pub total_jobs_completed: u64,
    pub total_jobs_stolen: u64,
    pub global_queue_size: usize,
    /// The configured soft bound (`SchedulerConfig::global_queue_capacity`).
    /// Informational only: the global queue is backed by a `VecDeque` and
    /// always grows past it rather than rejecting work.
    pub global_queue_capacity: usize,
    pub command_buffer_size: usize,
    pub worker_queue_sizes: Vec<usize>,
    pub avg_job_latency_ms: f64,
    /// Completed jobs per second since the last `reset()`.
    pub throughput: f64,
    pub active_workers: u32,
    pub idle_workers: u32,
    pub pending_asset_loads: u64,
}
