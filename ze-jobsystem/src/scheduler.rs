//! The work-stealing job scheduler: a worker pool, a global queue, dedicated
//! I/O workers, and cancellation by scene version. The worker loop tries its
//! own local deque, then the global queue, then stealing from a peer, then
//! parks; job execution is wrapped in `catch_unwind` so a panicking job
//! never takes a worker thread down with it.
//!
//! There is no global singleton accessor: `JobScheduler` is an ordinary
//! value the caller owns and shares via `Arc`. The main-thread-facing API
//! exposes only [`JobCounter::poll`] through [`JobScheduler::schedule`] plus
//! [`JobScheduler::flush_main_thread_commands`]; blocking on a counter from
//! the main thread is a programming error, asserted against in
//! [`JobScheduler::wait`] rather than left as a silent deadlock risk.

use crate::command_buffer::{Command, MainThreadCommandBuffer, MainThreadContext, WorkerAccumulator};
use crate::counter::JobCounter;
use crate::deque::{Deque, Steal};
use crate::job::{Job, JobHandle, JobPriority, SceneVersion};
use crate::metrics::{JobMetrics, JobMetricsSnapshot};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use ze_core::thread::set_thread_name;
use ze_core::{ze_error, ze_info, ze_warn};

/// How long an idle worker naps before re-checking its local deque and the
/// global queue. Short enough that a newly-pushed job is picked up quickly
/// even if a wakeup notification is missed, long enough not to spin.
const IDLE_PARK: Duration = Duration::from_millis(2);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub num_workers: usize,
    pub num_io_workers: usize,
    pub enable_work_stealing: bool,
    pub enable_profiling: bool,
    /// Soft bound reported back through [`JobMetricsSnapshot::global_queue_capacity`].
    /// Never enforced: the global queue is a plain `VecDeque` and always grows.
    pub global_queue_capacity: usize,
    pub worker_deque_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get().saturating_sub(1).max(1),
            num_io_workers: 1,
            enable_work_stealing: true,
            enable_profiling: true,
            global_queue_capacity: 1024,
            worker_deque_capacity: 256,
        }
    }
}

thread_local! {
    /// Set once, at the top of a worker's own loop. Used only to route
    /// `Normal`/`Low` priority jobs scheduled from inside a job body to the
    /// scheduling worker's own deque; never used to key any shared state
    /// (command accumulators are keyed by worker id, too, not OS thread
    /// identity).
    static CURRENT_WORKER: std::cell::Cell<Option<usize>> = std::cell::Cell::new(None);
}

struct WorkerSlot<S> {
    deque: Mutex<Option<Arc<Deque<Job>>>>,
    /// Commands a job running on this worker has pushed via
    /// [`JobScheduler::accumulate_main_thread_command`], merged into the
    /// global command buffer in one lock acquisition at that job's
    /// completion rather than one acquisition per command.
    accumulator: Mutex<WorkerAccumulator<S>>,
}

impl<S> Default for WorkerSlot<S> {
    fn default() -> Self {
        Self {
            deque: Mutex::new(None),
            accumulator: Mutex::new(WorkerAccumulator::default()),
        }
    }
}

/// The concurrent job scheduler: a pool of worker threads with per-worker
/// work-stealing deques, a mutex-protected global queue for high-priority
/// work and overflow, a pool of dedicated I/O worker threads, soft
/// cancellation by scene version, and a main-thread command buffer.
pub struct JobScheduler<S> {
    config: SchedulerConfig,
    slots: Vec<WorkerSlot<S>>,
    global: Mutex<VecDeque<Job>>,
    global_condvar: Condvar,
    io_queue: Mutex<VecDeque<Job>>,
    io_condvar: Condvar,
    cancelled: Mutex<HashSet<SceneVersion>>,
    command_buffer: Arc<MainThreadCommandBuffer<S>>,
    metrics: Arc<JobMetrics>,
    next_handle: AtomicU64,
    running: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    io_workers: Mutex<Vec<JoinHandle<()>>>,
    /// The thread that called [`JobScheduler::new`]. Flushing the command
    /// buffer from any other thread, or calling [`JobScheduler::wait`] from
    /// this thread, is a programming error, not a recoverable condition —
    /// this is the identity both assert against.
    main_thread: ThreadId,
}

impl<S: Send + 'static> JobScheduler<S> {
    /// Builds and starts the scheduler: spawns `config.num_workers` worker
    /// threads and `config.num_io_workers` I/O threads, then returns once
    /// every thread has registered its own deque.
    pub fn new(config: SchedulerConfig) -> Arc<Self> {
        let num_workers = if config.num_workers == 0 {
            num_cpus::get().saturating_sub(1).max(1)
        } else {
            config.num_workers
        };
        let mut config = config;
        config.num_workers = num_workers;
        let slots = (0..num_workers).map(|_| WorkerSlot::default()).collect();

        let scheduler = Arc::new(Self {
            config: config.clone(),
            slots,
            global: Mutex::new(VecDeque::new()),
            global_condvar: Condvar::new(),
            io_queue: Mutex::new(VecDeque::new()),
            io_condvar: Condvar::new(),
            cancelled: Mutex::new(HashSet::new()),
            command_buffer: Arc::new(MainThreadCommandBuffer::new()),
            metrics: Arc::new(JobMetrics::new(num_workers)),
            next_handle: AtomicU64::new(1),
            running: AtomicBool::new(true),
            workers: Mutex::new(Vec::new()),
            io_workers: Mutex::new(Vec::new()),
            main_thread: thread::current().id(),
        });

        let mut workers = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let scheduler = scheduler.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("ze-job-worker-{worker_id}"))
                    .spawn(move || scheduler.worker_main(worker_id))
                    .expect("failed to spawn job worker thread"),
            );
        }
        *scheduler.workers.lock() = workers;

        let mut io_workers = Vec::with_capacity(config.num_io_workers);
        for io_id in 0..config.num_io_workers {
            let scheduler = scheduler.clone();
            io_workers.push(
                thread::Builder::new()
                    .name(format!("ze-job-io-{io_id}"))
                    .spawn(move || scheduler.io_worker_main(io_id))
                    .expect("failed to spawn job I/O worker thread"),
            );
        }
        *scheduler.io_workers.lock() = io_workers;

        ze_info!(
            "job scheduler started: {} workers, {} I/O workers",
            num_workers,
            config.num_io_workers
        );
        scheduler
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &JobMetrics {
        &self.metrics
    }

    pub fn command_buffer(&self) -> &Arc<MainThreadCommandBuffer<S>> {
        &self.command_buffer
    }

    fn next_handle(&self) -> JobHandle {
        JobHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// Creates a counter pre-loaded with `initial` (typically the number of
    /// jobs about to be scheduled against it).
    pub fn create_counter(&self, initial: i32) -> Arc<JobCounter> {
        Arc::new(JobCounter::new(initial))
    }

    /// Schedules `body` for execution on a worker thread.
    ///
    /// `High`/`Critical` jobs always go to the global queue, so every idle
    /// worker is eligible to pick them up immediately. `Normal`/`Low` jobs
    /// prefer the calling thread's own local deque when the caller is
    /// itself a worker (cheap LIFO push/pop, no contention); otherwise they
    /// fall back to the global queue.
    pub fn schedule(
        &self,
        priority: JobPriority,
        scene_version: SceneVersion,
        counter: Option<Arc<JobCounter>>,
        body: impl FnOnce() + Send + 'static,
    ) -> JobHandle {
        let handle = self.next_handle();
        let job = Job::new(Box::new(body), counter, priority, scene_version, handle);

        if self.config.enable_profiling {
            self.metrics.record_scheduled();
        }

        if matches!(priority, JobPriority::Low | JobPriority::Normal) {
            if let Some(worker_id) = CURRENT_WORKER.with(|id| id.get()) {
                let slot = self.slots[worker_id].deque.lock();
                if let Some(local) = slot.as_ref() {
                    local.push(job);
                    drop(slot);
                    self.wake_one_idle_worker();
                    return handle;
                }
                // No deque registered yet for this worker id: fall through
                // and push to the global queue instead.
            }
        }

        self.push_global(job);
        handle
    }

    /// Marks every in-flight and future job tagged with `scene_version` as
    /// cancelled. Cancellation is soft: a job already executing runs to
    /// completion; one not yet dequeued has its body skipped but its
    /// counter is still decremented, preserving the conservation invariant.
    pub fn cancel_scene(&self, scene_version: SceneVersion) {
        if scene_version == 0 {
            return;
        }
        self.cancelled.lock().insert(scene_version);
    }

    /// Un-cancels `scene_version`, e.g. when a scene version number is
    /// reused after a full reload.
    pub fn clear_cancellation(&self, scene_version: SceneVersion) {
        self.cancelled.lock().remove(&scene_version);
    }

    pub fn is_cancelled(&self, scene_version: SceneVersion) -> bool {
        scene_version != 0 && self.cancelled.lock().contains(&scene_version)
    }

    /// Schedules work onto the dedicated I/O queue, drained only by I/O
    /// worker threads so a stalled disk/network read never starves CPU
    /// work.
    pub fn schedule_io(
        &self,
        scene_version: SceneVersion,
        counter: Option<Arc<JobCounter>>,
        body: impl FnOnce() + Send + 'static,
    ) -> JobHandle {
        let handle = self.next_handle();
        let job = Job::new(Box::new(body), counter, JobPriority::Normal, scene_version, handle);
        if self.config.enable_profiling {
            self.metrics.record_scheduled();
        }
        self.io_queue.lock().push_back(job);
        self.io_condvar.notify_one();
        handle
    }

    /// Main-thread only, non-blocking. Runs every pending command whose
    /// scene version matches `current_scene_version` (or is `0`).
    ///
    /// # Panics
    /// Panics if called from any thread other than the one that
    /// constructed this scheduler. This is a programming error, not a
    /// recoverable condition — unlike job or asset-pipeline failures, it is
    /// never caught and continued past.
    pub fn flush_main_thread_commands(
        &self,
        current_scene_version: SceneVersion,
        ctx: &mut MainThreadContext<S>,
    ) {
        self.assert_main_thread("flush_main_thread_commands");
        self.command_buffer.flush(current_scene_version, ctx);
    }

    fn assert_main_thread(&self, caller: &str) {
        let current = thread::current().id();
        assert!(
            current == self.main_thread,
            "{caller} called from {:?}, but the job scheduler was constructed on {:?} \
             (MainThreadMisuse: main-thread-only operations must run on that same thread)",
            current,
            self.main_thread,
        );
    }

    /// Blocks the calling thread on `counter` — see [`JobCounter::wait`] —
    /// after asserting the caller isn't the thread that constructed this
    /// scheduler. Blocking the main thread on a counter risks a deadlock
    /// whenever one of the jobs feeding that counter needs the main thread
    /// to flush a command before it can finish; `poll()` in a loop
    /// alongside [`Self::flush_main_thread_commands`] is the main-thread-safe
    /// alternative.
    ///
    /// # Panics
    /// Panics if called from the thread that constructed this scheduler.
    pub fn wait(&self, counter: &JobCounter) {
        let current = thread::current().id();
        assert!(
            current != self.main_thread,
            "JobScheduler::wait called from {:?}, the same thread that constructed the job \
             scheduler (MainThreadMisuse: use `poll()` in a loop alongside \
             flush_main_thread_commands instead of blocking the main thread)",
            current,
        );
        counter.wait();
    }

    /// Convenience for pushing a bare closure onto the command buffer
    /// without routing it through a job.
    pub fn push_main_thread_command(&self, command: Command<S>) {
        self.command_buffer.push(command);
    }

    /// Pushes a command through the calling worker's local accumulator
    /// instead of taking the global command buffer's lock directly. Only
    /// batches when called from inside a worker's own job body (i.e.
    /// [`CURRENT_WORKER`] is set for the calling thread) — that's the only
    /// place with a natural completion boundary to merge at. Called from
    /// any other thread, it falls back to pushing straight onto the
    /// global buffer, same as [`Self::push_main_thread_command`].
    pub fn accumulate_main_thread_command(&self, command: Command<S>) {
        match CURRENT_WORKER.with(|id| id.get()) {
            Some(worker_id) => self.slots[worker_id].accumulator.lock().push(command),
            None => self.command_buffer.push(command),
        }
    }

    pub fn get_metrics(&self) -> JobMetricsSnapshot {
        let global_len = self.global.lock().len();
        let command_buffer_len = self.command_buffer.len();
        self.metrics
            .snapshot(global_len, self.config.global_queue_capacity, command_buffer_len)
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// Blocks the *calling* thread (never the main thread, by convention —
    /// this is meant for test/shutdown code, not frame-loop code) until
    /// every queue is empty. Approximate: a worker could requeue a
    /// cancelled job's continuation between the check and the return, but
    /// no test in this crate relies on tighter guarantees than that.
    pub fn wait_for_all_jobs(&self) {
        loop {
            let all_local_empty = self
                .slots
                .iter()
                .all(|slot| slot.deque.lock().as_ref().map_or(true, |d| d.is_empty()));
            let global_empty = self.global.lock().is_empty();
            let io_empty = self.io_queue.lock().is_empty();
            if all_local_empty && global_empty && io_empty {
                return;
            }
            thread::sleep(IDLE_PARK);
        }
    }

    /// Stops every worker and I/O thread, joining them. No attempt is made
    /// to drain pending jobs first; callers that need graceful drain should
    /// call [`Self::wait_for_all_jobs`] beforehand.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.global_condvar.notify_all();
        self.io_condvar.notify_all();

        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
        for handle in self.io_workers.lock().drain(..) {
            let _ = handle.join();
        }
        ze_info!("job scheduler shut down");
    }

    /// Like [`Self::shutdown`], but additionally drains and executes every
    /// command still sitting in the main-thread command buffer afterward,
    /// regardless of scene version, via
    /// [`MainThreadCommandBuffer::flush_all`] — for callers that want a
    /// clean teardown instead of silently losing commands still pending
    /// when the last worker stops.
    pub fn shutdown_and_flush(&self, ctx: &mut MainThreadContext<S>) {
        self.shutdown();
        self.command_buffer.flush_all(ctx);
    }

    fn wake_one_idle_worker(&self) {
        self.global_condvar.notify_one();
    }

    fn push_global(&self, job: Job) {
        self.global.lock().push_back(job);
        self.global_condvar.notify_one();
    }

    fn try_pop_global(&self) -> Option<Job> {
        self.global.lock().pop_front()
    }

    fn try_steal_from_peers(&self, worker_id: usize) -> Option<Job> {
        let n = self.slots.len();
        if n <= 1 {
            return None;
        }
        for offset in 1..n {
            let victim = (worker_id + offset) % n;
            let victim_deque = self.slots[victim].deque.lock().clone();
            let Some(victim_deque) = victim_deque else { continue };
            loop {
                match victim_deque.steal() {
                    Steal::Success(job) => {
                        if self.config.enable_profiling {
                            self.metrics.record_stolen();
                        }
                        return Some(job);
                    }
                    Steal::Retry => continue,
                    Steal::Empty => break,
                }
            }
        }
        None
    }

    /// `worker_id` is `Some` for jobs run on a CPU worker (so that worker's
    /// command accumulator, if anything was pushed into it during the job
    /// body, gets merged into the global buffer right here) and `None` for
    /// I/O-thread jobs, which have no accumulator slot of their own.
    fn execute_job(&self, job: Job, worker_id: Option<usize>) {
        let Job {
            body,
            counter,
            scene_version,
            handle,
            created_at,
            ..
        } = job;

        if !self.is_cancelled(scene_version) {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
                let message = payload
                    .downcast_ref::<&str>()
                    .copied()
                    .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                    .unwrap_or("<non-string panic payload>");
                ze_error!("job {:?} panicked and was recovered: {}", handle, message);
            }
        } else {
            ze_warn!("job {:?} skipped: scene {} cancelled", handle, scene_version);
        }

        if let Some(counter) = counter {
            counter.decrement();
        }
        if self.config.enable_profiling {
            self.metrics.record_completed(created_at.elapsed());
        }
        if let Some(worker_id) = worker_id {
            let batch = self.slots[worker_id].accumulator.lock().take();
            self.command_buffer.merge(batch);
        }
    }

    fn worker_main(self: Arc<Self>, worker_id: usize) {
        CURRENT_WORKER.with(|id| id.set(Some(worker_id)));
        set_thread_name(thread::current().id(), format!("ze-job-worker-{worker_id}"));
        let local = Arc::new(Deque::new(self.config.worker_deque_capacity));
        *self.slots[worker_id].deque.lock() = Some(local.clone());
        ze_info!("job worker {} started", worker_id);

        if self.config.enable_profiling {
            self.metrics.set_worker_active(false);
        }

        while self.running.load(Ordering::Relaxed) {
            let job = local.pop().or_else(|| self.try_pop_global()).or_else(|| {
                if self.config.enable_work_stealing {
                    self.try_steal_from_peers(worker_id)
                } else {
                    None
                }
            });

            if self.config.enable_profiling {
                self.metrics
                    .set_worker_queue_size(worker_id, local.len());
            }

            match job {
                Some(job) => {
                    if self.config.enable_profiling {
                        self.metrics.set_worker_active(true);
                    }
                    self.execute_job(job, Some(worker_id));
                    if self.config.enable_profiling {
                        self.metrics.set_worker_active(false);
                    }
                }
                None => {
                    let mut guard = self.global.lock();
                    if guard.is_empty() {
                        self.global_condvar.wait_for(&mut guard, IDLE_PARK);
                    }
                }
            }
        }

        ze_info!("job worker {} stopped", worker_id);
    }

    fn io_worker_main(self: Arc<Self>, io_id: usize) {
        set_thread_name(thread::current().id(), format!("ze-job-io-{io_id}"));
        while self.running.load(Ordering::Relaxed) {
            let job = self.io_queue.lock().pop_front();
            match job {
                Some(job) => self.execute_job(job, None),
                None => {
                    let mut guard = self.io_queue.lock();
                    if guard.is_empty() {
                        self.io_condvar.wait_for(&mut guard, IDLE_PARK);
                    }
                }
            }
        }
    }
}

impl<S> Drop for JobScheduler<S> {
    fn drop(&mut self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.global_condvar.notify_all();
            self.io_condvar.notify_all();
            for handle in self.workers.get_mut().drain(..) {
                let _ = handle.join();
            }
            for handle in self.io_workers.get_mut().drain(..) {
                let _ = handle.join();
            }
        }
    }
}
