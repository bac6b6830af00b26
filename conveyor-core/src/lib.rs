//! Shared domain types for the Conveyor control plane.
//!
//! Everything here is pure data: the pipeline configuration document, the
//! executable build plan, build and resource records, container identity,
//! and the build event wire format. Persistence and execution live in the
//! store and engine crates.

pub mod domain;

pub use domain::build::{
    Build, BuildInput, BuildOutput, BuildPreparation, BuildStatus, PreparationStatus,
};
pub use domain::config::{
    job_inputs, job_outputs, parse_duration, Config, ConfigError, GroupConfig, JobConfig, JobInput,
    JobOutput, PlanConfig, ResourceConfig, ResourceTypeConfig,
};
pub use domain::container::{
    Container, ContainerIdentifier, ContainerMetadata, ContainerStage, ContainerType,
    IdentifierError,
};
pub use domain::event::{Event, Origin, OriginSource};
pub use domain::pipeline::{Pipe, SavedPipeline, Team, DEFAULT_TEAM_NAME};
pub use domain::plan::{
    DependentGetPlan, GetPlan, Location, Plan, PlanId, PutPlan, StepHook, TaskPlan,
};
pub use domain::resource::{MetadataField, Params, SavedVersion, Source, Version};
pub use domain::task::{TaskConfig, TaskInputConfig, TaskRunConfig};
pub use domain::volume::{resource_hash, Volume};
