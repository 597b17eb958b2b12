//! Shared model for the shelf generation-task tracker: wire and task types,
//! the task registry, configuration and platform paths.

pub mod config;
pub mod platform;
pub mod protocol;
pub mod registry;

pub use protocol::{
    GenerationOption, GenerationRequest, Progress, Submission, TaskKind, TaskMetadata, TaskPatch,
    TaskResult, TaskStatus, TaskStatusReport, TrackedTask,
};
pub use registry::{RegistryEvent, TaskRegistry};
