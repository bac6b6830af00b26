//! Store traits.
//!
//! Each consumer depends on the narrow slice it needs; `Store` bundles
//! them for wiring. Both the in-memory and Postgres implementations
//! implement every trait.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;

use conveyor_core::{
    Build, BuildInput, BuildOutput, BuildPreparation, BuildStatus, Config, Container,
    ContainerIdentifier, ContainerMetadata, Event, MetadataField, Pipe, ResourceConfig,
    SavedPipeline, SavedVersion, Team, Version, Volume,
};

use crate::algorithm::VersionsDb;
use crate::error::Result;
use crate::page::{Page, Pagination};

/// A held cooperative lease. Holders refresh automatically until broken;
/// breaking is idempotent and never fails.
#[async_trait]
pub trait Lease: Send + Sync {
    async fn break_lease(&mut self);
}

pub type BoxLease = Box<dyn Lease>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EventStreamError {
    #[error("end of build event stream")]
    EndOfStream,
    #[error("build event stream closed")]
    Closed,
}

/// A reader over one build's event log. `next` blocks past the end of the
/// log until a new event arrives or the build reaches a terminal status.
#[async_trait]
pub trait EventCursor: Send {
    async fn next(&mut self) -> std::result::Result<Event, EventStreamError>;
    async fn close(&mut self);
}

/// Resolves when an abort has been requested for a build.
#[derive(Debug, Clone)]
pub struct AbortNotifier {
    rx: watch::Receiver<bool>,
}

impl AbortNotifier {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        AbortNotifier { rx }
    }

    pub async fn notified(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // store gone; the abort can never arrive
                std::future::pending::<()>().await;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PausedState {
    Paused,
    Unpaused,
    NoChange,
}

#[async_trait]
pub trait TeamStore: Send + Sync {
    async fn save_team(&self, name: &str) -> Result<Team>;
    async fn get_team_by_name(&self, name: &str) -> Result<Option<Team>>;
}

#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn get_all_pipelines(&self) -> Result<Vec<SavedPipeline>>;

    async fn get_pipeline_by_team_and_name(
        &self,
        team: &str,
        name: &str,
    ) -> Result<Option<SavedPipeline>>;

    /// Creates or updates a pipeline's config. Updates must present the
    /// currently saved config version or the save is refused. Returns the
    /// saved pipeline and whether it was newly created.
    async fn save_config(
        &self,
        team: &str,
        name: &str,
        config: &Config,
        from_version: i64,
        initially_paused: PausedState,
    ) -> Result<(SavedPipeline, bool)>;

    async fn get_config(&self, pipeline_id: i64) -> Result<Option<(Config, i64)>>;

    async fn set_pipeline_paused(&self, pipeline_id: i64, paused: bool) -> Result<()>;

    /// Clears the user-visible readiness flags of the pipeline's pending
    /// builds, marking the paused pipeline as what blocks them.
    async fn reset_build_preparations_with_pipeline_paused(&self, pipeline_id: i64) -> Result<()>;
}

#[async_trait]
pub trait BuildStore: Send + Sync {
    async fn create_job_build(&self, pipeline_id: i64, job: &str) -> Result<Build>;

    /// Returns the job's existing pending candidate build, or creates one.
    /// The boolean reports whether a build was created by this call.
    async fn create_job_build_for_candidate_inputs(
        &self,
        pipeline_id: i64,
        job: &str,
    ) -> Result<(Build, bool)>;

    async fn create_one_off_build(&self, team_id: i64) -> Result<Build>;

    async fn get_build(&self, build_id: i64) -> Result<Option<Build>>;
    async fn get_all_started_builds(&self) -> Result<Vec<Build>>;
    async fn get_next_pending_build(&self, pipeline_id: i64, job: &str) -> Result<Option<Build>>;

    /// Finds a build of the job whose recorded inputs match `inputs`
    /// exactly (same names mapped to the same versions).
    async fn get_job_build_for_inputs(
        &self,
        pipeline_id: i64,
        job: &str,
        inputs: &[BuildInput],
    ) -> Result<Option<Build>>;

    async fn get_running_builds_of_job(&self, pipeline_id: i64, job: &str) -> Result<Vec<Build>>;

    /// Transitions the build to started, recording which engine owns it
    /// and its serialized state, and emits a status event. Returns false
    /// when the build is already past that point (or aborted).
    async fn start_build(&self, build_id: i64, engine: &str, engine_metadata: &str)
        -> Result<bool>;

    /// Transitions the build to a terminal status and emits the final
    /// status event, closing the event stream. A no-op when the build is
    /// already terminal.
    async fn finish_build(&self, build_id: i64, status: BuildStatus) -> Result<()>;

    /// Records an error event, then finishes the build as errored.
    async fn error_build(&self, build_id: i64, message: &str) -> Result<()>;

    /// Requests an abort: unstarted builds finish aborted immediately;
    /// started builds are signalled through their abort notifier.
    async fn abort_build(&self, build_id: i64) -> Result<()>;

    async fn abort_notifier(&self, build_id: i64) -> Result<AbortNotifier>;

    /// The authoritative pending → scheduled transition; returns false
    /// when another controller won the race.
    async fn update_build_to_scheduled(&self, build_id: i64) -> Result<bool>;

    async fn save_build_input(&self, build_id: i64, input: &BuildInput) -> Result<SavedVersion>;
    async fn save_build_output(
        &self,
        build_id: i64,
        resource: &str,
        version: &Version,
    ) -> Result<SavedVersion>;
    async fn get_build_inputs(&self, build_id: i64) -> Result<Vec<BuildInput>>;
    async fn get_build_outputs(&self, build_id: i64) -> Result<Vec<BuildOutput>>;

    async fn get_build_preparation(&self, build_id: i64) -> Result<Option<BuildPreparation>>;
    async fn update_build_preparation(&self, prep: &BuildPreparation) -> Result<()>;

    async fn job_builds_page(
        &self,
        pipeline_id: i64,
        job: &str,
        page: &Page,
    ) -> Result<(Vec<Build>, Pagination)>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn save_build_event(&self, build_id: i64, event: &Event) -> Result<()>;
    async fn get_build_events(&self, build_id: i64, from: usize) -> Result<Box<dyn EventCursor>>;
}

#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Persists newly discovered versions in arrival order. Idempotent on
    /// the version map; re-discovered versions move to the head of the
    /// check order.
    async fn save_resource_versions(
        &self,
        pipeline_id: i64,
        resource: &ResourceConfig,
        versions: &[(Version, Vec<MetadataField>)],
    ) -> Result<()>;

    async fn get_latest_versioned_resource(
        &self,
        pipeline_id: i64,
        resource: &str,
    ) -> Result<Option<SavedVersion>>;

    async fn get_resource_versions(
        &self,
        pipeline_id: i64,
        resource: &str,
        page: &Page,
    ) -> Result<(Vec<SavedVersion>, Pagination)>;

    async fn get_version_by_id(&self, version_id: i64) -> Result<Option<SavedVersion>>;

    async fn enable_versioned_resource(&self, version_id: i64) -> Result<()>;
    async fn disable_versioned_resource(&self, version_id: i64) -> Result<()>;

    /// Loads a consistent snapshot for one scheduler tick.
    async fn load_versions_db(&self, pipeline_id: i64) -> Result<VersionsDb>;
}

#[async_trait]
pub trait ContainerStore: Send + Sync {
    async fn create_container(&self, container: &Container, ttl: Duration) -> Result<Container>;
    async fn get_container(&self, handle: &str) -> Result<Option<Container>>;

    /// Errors with `InvalidIdentifier` on a non-minimal identifier and
    /// `MultipleContainersFound` when more than one live container
    /// matches.
    async fn find_container_by_identifier(
        &self,
        identifier: &ContainerIdentifier,
    ) -> Result<Option<Container>>;

    async fn find_containers_by_descriptors(
        &self,
        metadata: &ContainerMetadata,
    ) -> Result<Vec<Container>>;

    async fn update_expires_at_on_container(&self, handle: &str, ttl: Duration) -> Result<()>;
    async fn reap_container(&self, handle: &str) -> Result<()>;
    async fn get_expired_containers(&self) -> Result<Vec<Container>>;
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn lease_scheduling(&self, pipeline_id: i64, interval: Duration)
        -> Result<Option<BoxLease>>;

    /// `immediate` refuses only while another check of the resource is in
    /// flight; interval mode also refuses within `interval` of the last
    /// completed check.
    async fn lease_resource_checking(
        &self,
        pipeline_id: i64,
        resource: &str,
        interval: Duration,
        immediate: bool,
    ) -> Result<Option<BoxLease>>;

    async fn lease_build_scheduling(
        &self,
        build_id: i64,
        interval: Duration,
    ) -> Result<Option<BoxLease>>;

    async fn lease_build_tracking(
        &self,
        build_id: i64,
        interval: Duration,
    ) -> Result<Option<BoxLease>>;

    async fn lease_cache_invalidation(&self, interval: Duration) -> Result<Option<BoxLease>>;
}

#[async_trait]
pub trait VolumeStore: Send + Sync {
    async fn insert_volume(&self, volume: &Volume) -> Result<()>;
    async fn get_volumes(&self) -> Result<Vec<Volume>>;
    async fn set_volume_ttl(&self, worker_name: &str, handle: &str, ttl: Duration) -> Result<()>;
}

#[async_trait]
pub trait PipeStore: Send + Sync {
    async fn create_pipe(&self, id: &str, url: &str) -> Result<()>;
    async fn get_pipe(&self, id: &str) -> Result<Option<Pipe>>;
}

/// The whole store, for components that get wired with everything.
pub trait Store:
    TeamStore
    + PipelineStore
    + BuildStore
    + EventStore
    + VersionStore
    + ContainerStore
    + LeaseStore
    + VolumeStore
    + PipeStore
{
}

impl<T> Store for T where
    T: TeamStore
        + PipelineStore
        + BuildStore
        + EventStore
        + VersionStore
        + ContainerStore
        + LeaseStore
        + VolumeStore
        + PipeStore
{
}
