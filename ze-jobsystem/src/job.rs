//! The unit of work scheduled by [`crate::scheduler::JobScheduler`].
//! State a job needs is captured directly in its closure rather than
//! passed through a raw user-data pointer.

use crate::counter::JobCounter;
use std::sync::Arc;
use std::time::Instant;

/// Scheduling priority. High/Critical always go to the scheduler's global
/// queue; Normal/Low prefer the scheduling thread's own local deque.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum JobPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::Normal
    }
}

/// Unique, monotonically-assigned identifier for a scheduled job. Opaque:
/// the scheduler is the only thing that interprets it (currently used only
/// for bookkeeping/metrics; cancellation works by scene version, not by
/// handle).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct JobHandle(pub u64);

/// Scene version used for soft, non-preemptive cancellation. `0` means
/// "never cancel this job".
pub type SceneVersion = u64;

pub(crate) type JobBody = Box<dyn FnOnce() + Send + 'static>;

/// A unit of work submitted to the scheduler.
///
/// Jobs are moved into a deque or the global queue, executed at most once,
/// then dropped. If a job's `scene_version` has been cancelled by the time
/// a worker dequeues it, the body is skipped but the counter (if any) is
/// still decremented.
pub struct Job {
    pub(crate) body: JobBody,
    pub(crate) counter: Option<Arc<JobCounter>>,
    pub(crate) priority: JobPriority,
    pub(crate) scene_version: SceneVersion,
    pub(crate) handle: JobHandle,
    pub(crate) created_at: Instant,
}

impl Job {
    pub(crate) fn new(
        body: JobBody,
        counter: Option<Arc<JobCounter>>,
        priority: JobPriority,
        scene_version: SceneVersion,
        handle: JobHandle,
    ) -> Self {
        Self {
            body,
            counter,
            priority,
            scene_version,
            handle,
            created_at: Instant::now(),
        }
    }

    pub fn handle(&self) -> JobHandle {
        self.handle
    }

    pub fn priority(&self) -> JobPriority {
        self.priority
    }

    pub fn scene_version(&self) -> SceneVersion {
        self.scene_version
    }
}
