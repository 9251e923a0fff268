//! Job orchestration for the FaceFusion media pipeline.
//!
//! The [`Orchestrator`] is the single front door: it persists submitted jobs,
//! queues them, executes them on a bounded worker pool and fans lifecycle
//! events out to subscribers. Execution is cooperative end to end: cancelling
//! a job sets a durable flag that the [`Runner`] observes between units of
//! work, never a preemption.

pub mod bus;
pub mod orchestrator;
pub mod resources;
pub mod runner;

pub use bus::{EventBus, EventStream, DEFAULT_QUEUE_DEPTH};
pub use orchestrator::{Orchestrator, OrchestratorError};
pub use resources::{
    ResourceError, ResourceGuard, ResourceKind, ResourceLimits, ResourceManager, ResourceStatus,
    SlotStatus,
};
pub use runner::{JobContext, Phase, Pipeline, Runner};
