//! A work-stealing job system: per-worker Chase-Lev deques, a mutex-backed
//! global queue for high-priority work, a dedicated I/O worker pool, soft
//! scene-version cancellation, a main-thread command buffer, and a
//! three-phase async asset loading pipeline.
//!
//! There is no global singleton accessor here (contrast with the crate
//! this was grown from): build a [`scheduler::JobScheduler`] with
//! [`scheduler::JobScheduler::new`] and share it through an `Arc`, the same
//! way any other shared service in an application is shared.

pub mod asset_pipeline;
pub mod command_buffer;
pub mod counter;
pub mod deque;
pub mod entity_batch;
pub mod job;
pub mod metrics;
pub mod parallel_for;
pub mod prelude;
pub mod scheduler;

#[cfg(test)]
mod tests;
