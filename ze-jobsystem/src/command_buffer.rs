//! Main-thread command buffer.
//!
//! Ownership transfer across the thread boundary uses `Arc` (standard
//! shared ownership) rather than hand-written ref-counting. Type-erased
//! `std::any`-style downcasting is avoided entirely: `CommandBuffer` is
//! generic over the application's own context type `S`, so the callable a
//! command carries is checked by the compiler, never cast at runtime.

use crate::job::SceneVersion;
use parking_lot::Mutex;
use std::time::Instant;

/// The non-owning handles external systems (renderers, the active scene,
/// the asset manager, ...) make available to main-thread commands.
///
/// The job system never interprets `S`; it only routes it through. Callers
/// own the lifetime guarantee that `S`'s contents outlive any in-flight
/// command.
pub struct MainThreadContext<'a, S> {
    pub systems: &'a mut S,
}

type CommandFn<S> = Box<dyn FnOnce(&mut MainThreadContext<S>) + Send>;

/// A deferred closure whose execution is confined to the main thread.
pub struct Command<S> {
    scene_version: SceneVersion,
    body: CommandFn<S>,
    created_at: Instant,
}

impl<S> Command<S> {
    /// The canonical constructor: `data` is kept alive (via `Arc`) for as
    /// long as the command itself, so `fn` can safely dereference it on the
    /// main thread no matter how long the command sits in the buffer.
    pub fn with_ownership<T: Send + Sync + 'static>(
        scene_version: SceneVersion,
        data: std::sync::Arc<T>,
        f: impl FnOnce(&mut MainThreadContext<S>, &T) + Send + 'static,
    ) -> Self {
        Self {
            scene_version,
            body: Box::new(move |ctx| f(ctx, &data)),
            created_at: Instant::now(),
        }
    }

    /// A bare-closure form. Only safe when the closure captures nothing
    /// whose lifetime is shorter than the command's own lifetime (enforced
    /// here only by the `'static` bound, same contract as upstream).
    pub fn bare(
        scene_version: SceneVersion,
        f: impl FnOnce(&mut MainThreadContext<S>) + Send + 'static,
    ) -> Self {
        Self {
            scene_version,
            body: Box::new(f),
            created_at: Instant::now(),
        }
    }

    pub fn scene_version(&self) -> SceneVersion {
        self.scene_version
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

/// Thread-local-ish accumulator: a worker batches commands here and merges
/// them into the global buffer in one critical section at a natural
/// boundary (job completion), instead of locking per-push.
///
/// Keyed by worker id known to the scheduler (a plain index), not by OS
/// thread identity.
pub struct WorkerAccumulator<S> {
    pending: Vec<Command<S>>,
}

impl<S> Default for WorkerAccumulator<S> {
    fn default() -> Self {
        Self { pending: Vec::new() }
    }
}

impl<S> WorkerAccumulator<S> {
    pub fn push(&mut self, command: Command<S>) {
        self.pending.push(command);
    }

    pub fn take(&mut self) -> Vec<Command<S>> {
        std::mem::take(&mut self.pending)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// The global, mutex-protected, FIFO buffer of pending main-thread
/// commands.
pub struct MainThreadCommandBuffer<S> {
    commands: Mutex<Vec<Command<S>>>,
}

impl<S> Default for MainThreadCommandBuffer<S> {
    fn default() -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
        }
    }
}

impl<S> MainThreadCommandBuffer<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Thread-safe; callable from any thread.
    pub fn push(&self, command: Command<S>) {
        self.commands.lock().push(command);
    }

    /// Merges a worker's local accumulator into the global buffer in one
    /// critical section. Ordering within the merge follows the
    /// accumulator's own enqueue order; ordering across merges follows
    /// merge time.
    pub fn merge(&self, mut batch: Vec<Command<S>>) {
        if batch.is_empty() {
            return;
        }
        self.commands.lock().append(&mut batch);
    }

    pub fn len(&self) -> usize {
        self.commands.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Main-thread only. Atomically drains the buffer and executes, in
    /// enqueue order, every command whose scene version matches
    /// `current_scene_version` or is `0` (uncancellable); every other
    /// command is dropped silently.
    pub fn flush(&self, current_scene_version: SceneVersion, ctx: &mut MainThreadContext<S>) {
        let drained = std::mem::take(&mut *self.commands.lock());
        for command in drained {
            if command.scene_version == 0 || command.scene_version == current_scene_version {
                (command.body)(ctx);
            }
        }
    }

    /// Drains and executes every command regardless of scene version.
    /// Used by [`crate::scheduler::JobScheduler::wait_for_all_jobs`]-style
    /// shutdown paths where no single "current" scene version applies.
    pub fn flush_all(&self, ctx: &mut MainThreadContext<S>) {
        let drained = std::mem::take(&mut *self.commands.lock());
        for command in drained {
            (command.body)(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Systems {
        result: i32,
    }

    #[test]
    fn commands_run_in_enqueue_order() {
        let buffer: MainThreadCommandBuffer<Systems> = MainThreadCommandBuffer::new();
        let mut order = Vec::new();
        for i in 0..5 {
            buffer.push(Command::bare(7, move |ctx: &mut MainThreadContext<Systems>| {
                ctx.systems.result = i;
            }));
        }
        let mut systems = Systems { result: -1 };
        {
            let mut ctx = MainThreadContext { systems: &mut systems };
            buffer.flush(7, &mut ctx);
        }
        order.push(systems.result);
        assert_eq!(systems.result, 4);
        assert!(buffer.is_empty());
    }

    #[test]
    fn mismatched_scene_version_is_dropped() {
        let buffer: MainThreadCommandBuffer<Systems> = MainThreadCommandBuffer::new();
        buffer.push(Command::bare(9, |ctx: &mut MainThreadContext<Systems>| {
            ctx.systems.result = 42;
        }));
        let mut systems = Systems { result: 0 };
        {
            let mut ctx = MainThreadContext { systems: &mut systems };
            buffer.flush(1, &mut ctx);
        }
        assert_eq!(systems.result, 0);
    }

    #[test]
    fn zero_scene_version_always_runs() {
        let buffer: MainThreadCommandBuffer<Systems> = MainThreadCommandBuffer::new();
        buffer.push(Command::bare(0, |ctx: &mut MainThreadContext<Systems>| {
            ctx.systems.result = 1;
        }));
        let mut systems = Systems { result: 0 };
        {
            let mut ctx = MainThreadContext { systems: &mut systems };
            buffer.flush(999, &mut ctx);
        }
        assert_eq!(systems.result, 1);
    }

    #[test]
    fn ownership_form_keeps_data_alive() {
        use std::sync::Arc;
        let buffer: MainThreadCommandBuffer<Systems> = MainThreadCommandBuffer::new();
        let data = Arc::new(vec![1, 2, 3]);
        buffer.push(Command::with_ownership(0, data, |ctx: &mut MainThreadContext<Systems>, v| {
            ctx.systems.result = v.iter().sum();
        }));
        let mut systems = Systems { result: 0 };
        {
            let mut ctx = MainThreadContext { systems: &mut systems };
            buffer.flush(0, &mut ctx);
        }
        assert_eq!(systems.result, 6);
    }
}
