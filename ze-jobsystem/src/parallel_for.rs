//! Grain-size-split parallel range iteration: split into fixed-size chunks,
//! one job per chunk, fan-in on a single counter. Deliberately thin —
//! there's no `ParallelIterator` trait hierarchy here, because scene/engine
//! work never needs more than "run this range, possibly in chunks, wait for
//! it".

use crate::counter::JobCounter;
use crate::job::{JobPriority, SceneVersion};
use crate::scheduler::JobScheduler;
use std::sync::Arc;

/// Tunables for a single [`parallel_for`] call.
#[derive(Debug, Clone, Copy)]
pub struct ParallelForConfig {
    /// Items per job. `0` asks for an automatic grain chosen so that each
    /// worker gets roughly 4 chunks (enough to absorb uneven steal timing
    /// without the per-job overhead of a grain of 1).
    pub grain_size: usize,
    pub priority: JobPriority,
    pub scene_version: SceneVersion,
}

impl Default for ParallelForConfig {
    fn default() -> Self {
        Self {
            grain_size: 0,
            priority: JobPriority::Normal,
            scene_version: 0,
        }
    }
}

fn resolve_grain(len: usize, grain_size: usize, num_workers: usize) -> usize {
    if grain_size > 0 {
        return grain_size;
    }
    let target_chunks = (num_workers.max(1)) * 4;
    (len / target_chunks.max(1)).max(1)
}

/// Splits `0..len` into `ceil(len / grain)` chunks and runs `body(start,
/// end)` for each chunk on the scheduler, one job per chunk. Chunks run in
/// no particular order relative to each other; within a chunk, indices run
/// sequentially in increasing order. Blocks the calling thread until every
/// chunk has completed.
///
/// Must not be called from the main thread if any chunk might enqueue a
/// main-thread command: see the warning on [`JobCounter::wait`].
pub fn parallel_for<S, F>(scheduler: &JobScheduler<S>, len: usize, config: ParallelForConfig, body: F)
where
    S: Send + 'static,
    F: Fn(usize, usize) + Send + Sync + 'static,
{
    if len == 0 {
        return;
    }

    let grain = resolve_grain(len, config.grain_size, scheduler.config().num_workers);
    let num_chunks = (len + grain - 1) / grain;
    let counter = scheduler.create_counter(num_chunks as i32);
    let body = Arc::new(body);

    for chunk in 0..num_chunks {
        let start = chunk * grain;
        let end = (start + grain).min(len);
        let body = body.clone();
        let counter_for_job = counter.clone();
        scheduler.schedule(config.priority, config.scene_version, Some(counter_for_job), move || {
            body(start, end);
        });
    }

    counter.wait();
}

/// Like [`parallel_for`] but returns the [`JobCounter`] immediately instead
/// of blocking, so the caller can `poll()` it from the main thread while
/// still draining main-thread commands in between polls.
pub fn parallel_for_async<S, F>(
    scheduler: &JobScheduler<S>,
    len: usize,
    config: ParallelForConfig,
    body: F,
) -> Arc<JobCounter>
where
    S: Send + 'static,
    F: Fn(usize, usize) + Send + Sync + 'static,
{
    if len == 0 {
        return scheduler.create_counter(0);
    }

    let grain = resolve_grain(len, config.grain_size, scheduler.config().num_workers);
    let num_chunks = (len + grain - 1) / grain;
    let counter = scheduler.create_counter(num_chunks as i32);
    let body = Arc::new(body);

    for chunk in 0..num_chunks {
        let start = chunk * grain;
        let end = (start + grain).min(len);
        let body = body.clone();
        let counter_for_job = counter.clone();
        scheduler.schedule(config.priority, config.scene_version, Some(counter_for_job), move || {
            body(start, end);
        });
    }

    counter
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn visits_every_index_exactly_once() {
        let scheduler = JobScheduler::<()>::new(SchedulerConfig {
            num_workers: 4,
            ..Default::default()
        });

        const LEN: usize = 10_000;
        let seen = Arc::new((0..LEN).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>());
        let seen_for_body = seen.clone();

        parallel_for(
            &scheduler,
            LEN,
            ParallelForConfig {
                grain_size: 37,
                ..Default::default()
            },
            move |start, end| {
                for i in start..end {
                    seen_for_body[i].fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        assert!(seen.iter().all(|count| count.load(Ordering::SeqCst) == 1));
        scheduler.shutdown();
    }

    #[test]
    fn zero_length_is_a_no_op() {
        let scheduler = JobScheduler::<()>::new(SchedulerConfig {
            num_workers: 2,
            ..Default::default()
        });
        parallel_for(&scheduler, 0, ParallelForConfig::default(), |_, _| {
            panic!("body must not run for an empty range");
        });
        scheduler.shutdown();
    }
}
