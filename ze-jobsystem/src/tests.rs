//! End-to-end scenarios exercising the scheduler, command buffer, and asset
//! pipeline together: plain `Arc<Atomic*>` assertions, no mocking
//! framework.

use crate::asset_pipeline::{load_asset_async, AssetKind, AssetLoadRequest, Error as AssetError, ParsedAsset};
use crate::command_buffer::MainThreadContext;
use crate::job::JobPriority;
use crate::parallel_for::{parallel_for, ParallelForConfig};
use crate::scheduler::{JobScheduler, SchedulerConfig};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct Systems {
    result: i32,
}

/// S1 — ping-pong through the command buffer.
#[test]
fn s1_ping_pong_through_command_buffer() {
    let scheduler = JobScheduler::<Systems>::new(SchedulerConfig {
        num_workers: 2,
        ..Default::default()
    });

    let counter = scheduler.create_counter(1);
    let command_buffer = scheduler.command_buffer().clone();
    scheduler.schedule(JobPriority::Normal, 7, Some(counter.clone()), move || {
        command_buffer.push(crate::command_buffer::Command::bare(7, |ctx: &mut MainThreadContext<Systems>| {
            ctx.systems.result = 42;
        }));
    });

    scheduler.wait_for_all_jobs();
    assert!(counter.poll());

    let mut systems = Systems { result: 0 };
    {
        let mut ctx = MainThreadContext { systems: &mut systems };
        scheduler.flush_main_thread_commands(7, &mut ctx);
    }

    assert_eq!(systems.result, 42);
    scheduler.shutdown();
}

/// S2 — cancellation dropping. A single worker is parked executing a gate
/// job so the 100 target jobs are guaranteed to still be sitting in the
/// global queue, unexamined, when `cancel_scene` runs.
#[test]
fn s2_cancellation_drops_callables_but_still_decrements() {
    let scheduler = JobScheduler::<()>::new(SchedulerConfig {
        num_workers: 1,
        ..Default::default()
    });

    let release_gate = Arc::new(AtomicBool::new(false));
    let release_gate_for_job = release_gate.clone();
    scheduler.schedule(JobPriority::Critical, 0, None, move || {
        while !release_gate_for_job.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
    });

    let counter = scheduler.create_counter(100);
    let executed = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let executed = executed.clone();
        scheduler.schedule(JobPriority::Normal, 9, Some(counter.clone()), move || {
            executed.fetch_add(1, Ordering::SeqCst);
        });
    }

    scheduler.cancel_scene(9);
    release_gate.store(true, Ordering::Release);

    scheduler.wait_for_all_jobs();
    counter.wait();

    assert_eq!(executed.load(Ordering::SeqCst), 0);
    assert!(counter.get_value() <= 0);
    scheduler.shutdown();
}

/// S3 — parallel-for sum.
#[test]
fn s3_parallel_for_sum() {
    let scheduler = JobScheduler::<()>::new(SchedulerConfig {
        num_workers: 4,
        ..Default::default()
    });

    let sum = Arc::new(AtomicI64::new(0));
    let sum_for_body = sum.clone();

    parallel_for(&scheduler, 10_000, ParallelForConfig::default(), move |start, end| {
        let mut partial = 0i64;
        for i in start..end {
            partial += i as i64;
        }
        sum_for_body.fetch_add(partial, Ordering::SeqCst);
    });

    assert_eq!(sum.load(Ordering::SeqCst), 49_995_000);
    scheduler.shutdown();
}

/// S4 — stealing under starvation. A seed job runs on whichever worker
/// picks it up first, then schedules 10,000 Normal jobs from inside that
/// worker's own execution context — so, per the routing rule, every one of
/// them lands on that single worker's local deque, exactly as if a
/// producer had "impersonated" it.
#[test]
fn s4_stealing_under_starvation() {
    let scheduler = JobScheduler::<()>::new(SchedulerConfig {
        num_workers: 4,
        ..Default::default()
    });

    let hits = Arc::new(AtomicU64::new(0));
    let counter = scheduler.create_counter(10_000);

    let scheduler_for_seed = scheduler.clone();
    let hits_for_seed = hits.clone();
    let counter_for_seed = counter.clone();
    scheduler.schedule(JobPriority::Normal, 0, None, move || {
        for _ in 0..10_000 {
            let hits = hits_for_seed.clone();
            scheduler_for_seed.schedule(JobPriority::Normal, 0, Some(counter_for_seed.clone()), move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
    });

    counter.wait();

    assert_eq!(hits.load(Ordering::SeqCst), 10_000);
    assert!(counter.poll());
    assert!(scheduler.get_metrics().total_jobs_stolen > 0);
    scheduler.shutdown();
}

/// S5 — asset pipeline happy path.
#[test]
fn s5_asset_pipeline_happy_path() {
    let scheduler = JobScheduler::<Systems>::new(SchedulerConfig {
        num_workers: 2,
        ..Default::default()
    });

    let mut path = std::env::temp_dir();
    path.push(format!("ze-jobsystem-test-s5-{}.bin", std::process::id()));
    std::fs::write(&path, b"12345678").unwrap();

    let completed = Arc::new(Mutex::new(None));
    let completed_for_cb = completed.clone();

    let counter = load_asset_async(
        &scheduler,
        AssetLoadRequest::with_kind(path.clone(), AssetKind::Texture),
        3,
        move |_ctx: &mut MainThreadContext<Systems>, result| {
            *completed_for_cb.lock().unwrap() = Some(result);
        },
    );

    scheduler.wait_for_all_jobs();

    let mut systems = Systems { result: 0 };
    {
        let mut ctx = MainThreadContext { systems: &mut systems };
        scheduler.flush_main_thread_commands(3, &mut ctx);
    }

    assert!(counter.poll());
    let result = completed.lock().unwrap().take().expect("completion must run exactly once");
    match result {
        Ok(ParsedAsset::Texture(data)) => assert_eq!(data.pixels, b"12345678"),
        other => panic!("expected a parsed texture, got {:?}", other),
    }

    std::fs::remove_file(&path).ok();
    scheduler.shutdown();
}

/// S6 — asset pipeline I/O failure.
#[test]
fn s6_asset_pipeline_io_failure() {
    let scheduler = JobScheduler::<Systems>::new(SchedulerConfig {
        num_workers: 2,
        ..Default::default()
    });

    let completed = Arc::new(Mutex::new(None));
    let completed_for_cb = completed.clone();

    let counter = load_asset_async(
        &scheduler,
        AssetLoadRequest::new("/nonexistent/path/ze-jobsystem-test-nope.bin"),
        0,
        move |_ctx: &mut MainThreadContext<Systems>, result| {
            *completed_for_cb.lock().unwrap() = Some(result);
        },
    );

    scheduler.wait_for_all_jobs();

    let mut systems = Systems { result: 0 };
    {
        let mut ctx = MainThreadContext { systems: &mut systems };
        scheduler.flush_main_thread_commands(0, &mut ctx);
    }

    assert_eq!(counter.get_value(), 0);
    let result = completed.lock().unwrap().take().expect("completion must run exactly once");
    assert!(result.is_err());
    scheduler.shutdown();
}

/// A scene cancelled before the I/O phase starts must still deliver exactly
/// one completion call (property 9), carrying `Error::Cancelled` rather
/// than hanging — see the cancellation note on `load_asset_async`.
#[test]
fn asset_pipeline_cancellation_before_io_still_completes_once() {
    let scheduler = JobScheduler::<Systems>::new(SchedulerConfig {
        num_workers: 2,
        ..Default::default()
    });

    let mut path = std::env::temp_dir();
    path.push(format!("ze-jobsystem-test-cancel-{}.bin", std::process::id()));
    std::fs::write(&path, b"12345678").unwrap();

    scheduler.cancel_scene(11);

    let completed = Arc::new(Mutex::new(None));
    let completed_for_cb = completed.clone();
    let counter = load_asset_async(
        &scheduler,
        AssetLoadRequest::new(path.clone()),
        11,
        move |_ctx: &mut MainThreadContext<Systems>, result| {
            *completed_for_cb.lock().unwrap() = Some(result);
        },
    );

    scheduler.wait_for_all_jobs();

    let mut systems = Systems { result: 0 };
    {
        let mut ctx = MainThreadContext { systems: &mut systems };
        // Flushing at a *different* current scene version proves the
        // completion command isn't gated by it: it must still run.
        scheduler.flush_main_thread_commands(0, &mut ctx);
    }

    assert_eq!(counter.get_value(), 0);
    let result = completed.lock().unwrap().take().expect("completion must run exactly once");
    assert!(matches!(result, Err(AssetError::Cancelled)));
    assert_eq!(scheduler.get_metrics().pending_asset_loads, 0);

    std::fs::remove_file(&path).ok();
    scheduler.shutdown();
}
