//! Two-phase entity creation: CPU-side descriptor preparation (parallel)
//! followed by ECS commit (main-thread only).
//!
//! The ECS itself is out of scope for this crate, so commit happens through
//! the narrow [`EcsRegistry`] trait an embedding application implements,
//! rather than against any concrete ECS type.

use crate::command_buffer::{Command, MainThreadCommandBuffer, MainThreadContext};
use crate::counter::JobCounter;
use crate::job::{JobPriority, SceneVersion};
use crate::scheduler::JobScheduler;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The small set of primitive component kinds this crate needs to exercise
/// the batch-building contract end to end. Real component types (the
/// engine's actual `TransformComponent` and friends) live in the ECS crate
/// this one only ever reaches through [`EcsRegistry`].
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentKind {
    Transform {
        translation: [f32; 3],
        rotation: [f32; 4],
        scale: [f32; 3],
    },
    Tag(String),
}

#[derive(Debug, Clone)]
pub struct ComponentDescriptor {
    pub kind: ComponentKind,
}

#[derive(Debug, Clone, Default)]
pub struct EntityDescriptor {
    pub components: Vec<ComponentDescriptor>,
}

/// The minimal surface the entity-batch helpers need from an ECS. An
/// embedding application implements this over its own world/registry type.
pub trait EcsRegistry {
    type EntityId: Copy;

    fn spawn(&mut self) -> Self::EntityId;
    fn insert_component(&mut self, entity: Self::EntityId, component: &ComponentDescriptor);
}

fn commit_entities<R: EcsRegistry>(registry: &mut R, descriptors: Vec<EntityDescriptor>) -> Vec<R::EntityId> {
    descriptors
        .into_iter()
        .map(|descriptor| {
            let entity = registry.spawn();
            for component in &descriptor.components {
                registry.insert_component(entity, component);
            }
            entity
        })
        .collect()
}

/// Commits a batch of already-built descriptors. Main-thread only: there is
/// no preparation phase here since the descriptors are already in hand.
pub fn create_entities_batch<R: EcsRegistry>(
    registry: &mut R,
    descriptors: Vec<EntityDescriptor>,
) -> Vec<R::EntityId> {
    commit_entities(registry, descriptors)
}

/// Builds `count` entities from a generator function run in parallel across
/// worker threads (the "prepare" phase), then commits them on the main
/// thread via `on_committed` once every chunk has finished (the "commit"
/// phase). `grain_size` of `0` picks an automatic chunk size, same
/// convention as [`crate::parallel_for::parallel_for`].
///
/// Returns immediately with the fan-in counter for the prepare phase; the
/// commit itself is delivered asynchronously through the main-thread
/// command buffer, not through this counter reaching zero.
///
/// `on_committed` receives `None` instead of the descriptor list if
/// `scene_version` was cancelled before the batch finished preparing.
/// `on_committed` always runs exactly once, whether the batch completed or
/// was cancelled; chunk jobs are themselves scheduled at `Job`-level scene
/// version `0` (so the scheduler never skips a chunk's body outright,
/// which would strand `remaining`/`slots` for that chunk with no writer)
/// and instead check [`JobScheduler::is_cancelled`] against the real
/// `scene_version` at the top of each chunk's own body. A dedicated
/// cancellation flag — not chunk-slot occupancy — decides which outcome to
/// deliver, since a chunk that observed cancellation decrements its
/// attached counter same as any other chunk but never touches its slot.
pub fn create_entities_procedural_batch<S, F>(
    scheduler: &Arc<JobScheduler<S>>,
    count: usize,
    scene_version: SceneVersion,
    grain_size: usize,
    generator: F,
    on_committed: impl FnOnce(&mut MainThreadContext<S>, Option<Vec<EntityDescriptor>>) + Send + 'static,
) -> Arc<JobCounter>
where
    S: Send + 'static,
    F: Fn(usize) -> EntityDescriptor + Send + Sync + 'static,
{
    let command_buffer: Arc<MainThreadCommandBuffer<S>> = scheduler.command_buffer().clone();

    if count == 0 {
        command_buffer.push(Command::bare(0, move |ctx| {
            on_committed(ctx, Some(Vec::new()));
        }));
        return scheduler.create_counter(0);
    }

    let grain = if grain_size > 0 {
        grain_size
    } else {
        (count / (scheduler.config().num_workers.max(1) * 4)).max(1)
    };
    let num_chunks = (count + grain - 1) / grain;

    let counter = scheduler.create_counter(num_chunks as i32);
    // A chunk's own attached counter decrement (driven by the scheduler's
    // job-execution path) fires exactly once whether the chunk ran or was
    // skipped for cancellation — so the *counter* reaching zero,
    // not a side-channel atomic, is what must drive "last chunk" detection.
    // `remaining` mirrors that same guarantee for the purpose of picking a
    // single winner to perform the commit hand-off.
    let remaining = Arc::new(AtomicUsize::new(num_chunks));
    let slots: Arc<Mutex<Vec<Option<EntityDescriptor>>>> =
        Arc::new(Mutex::new((0..count).map(|_| None).collect()));
    let any_cancelled = Arc::new(AtomicUsize::new(0));
    let generator = Arc::new(generator);
    let on_committed: Arc<Mutex<Option<Box<dyn FnOnce(&mut MainThreadContext<S>, Option<Vec<EntityDescriptor>>) + Send>>>> =
        Arc::new(Mutex::new(Some(Box::new(on_committed))));

    for chunk in 0..num_chunks {
        let start = chunk * grain;
        let end = (start + grain).min(count);
        let slots = slots.clone();
        let generator = generator.clone();
        let remaining = remaining.clone();
        let any_cancelled = any_cancelled.clone();
        let command_buffer = command_buffer.clone();
        let on_committed = on_committed.clone();
        let counter_for_job = counter.clone();
        let scheduler_for_job = scheduler.clone();

        // Scheduled at scene version 0 so the scheduler never skips the
        // body outright (that would strand `remaining`/`slots` for this
        // chunk with no writer); cancellation is instead observed inside
        // the body itself and folded into `any_cancelled`.
        scheduler.schedule(JobPriority::Normal, 0, Some(counter_for_job), move || {
            if scheduler_for_job.is_cancelled(scene_version) {
                any_cancelled.fetch_add(1, Ordering::Relaxed);
            } else {
                let mut produced = Vec::with_capacity(end - start);
                for i in start..end {
                    produced.push((i, generator(i)));
                }
                let mut guard = slots.lock();
                for (i, descriptor) in produced {
                    guard[i] = Some(descriptor);
                }
            }

            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                let cancelled = any_cancelled.load(Ordering::Relaxed) > 0;
                let descriptors = if cancelled {
                    None
                } else {
                    Some(
                        std::mem::take(&mut *slots.lock())
                            .into_iter()
                            .map(|slot| slot.expect("every slot is filled when no chunk observed cancellation"))
                            .collect(),
                    )
                };
                let on_committed = on_committed.clone();
                command_buffer.push(Command::bare(0, move |ctx| {
                    if let Some(cb) = on_committed.lock().take() {
                        cb(ctx, descriptors);
                    }
                }));
            }
        });
    }

    counter
}
