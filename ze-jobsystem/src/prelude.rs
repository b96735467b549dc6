//! Re-exports of the types most callers need, so `use ze_jobsystem::prelude::*;`
//! is usually enough.

pub use crate::asset_pipeline::{
    load_asset_async, load_mesh_async, load_texture_async, AssetKind, AssetLoadRequest,
    Error as AssetError, ParsedAsset,
};
pub use crate::command_buffer::{Command, MainThreadCommandBuffer, MainThreadContext};
pub use crate::counter::JobCounter;
pub use crate::deque::{Deque, Steal};
pub use crate::entity_batch::{
    create_entities_batch, create_entities_procedural_batch, ComponentDescriptor, ComponentKind,
    EcsRegistry, EntityDescriptor,
};
pub use crate::job::{Job, JobHandle, JobPriority, SceneVersion};
pub use crate::metrics::{JobMetrics, JobMetricsSnapshot};
pub use crate::parallel_for::{parallel_for, parallel_for_async, ParallelForConfig};
pub use crate::scheduler::{JobScheduler, SchedulerConfig};
