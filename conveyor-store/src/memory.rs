//! In-memory store.
//!
//! Complete implementation of every store trait over mutexed maps. Backs
//! tests and single-node deployments, and is the authority on store
//! semantics; the Postgres implementation mirrors it.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};

use conveyor_core::{
    Build, BuildInput, BuildOutput, BuildPreparation, BuildStatus, Config, Container,
    ContainerIdentifier, ContainerMetadata, Event, IdentifierError, MetadataField, Pipe,
    PreparationStatus, ResourceConfig, SavedPipeline, SavedVersion, Team, Version, Volume,
};

use crate::algorithm::{BuildVersion, ResourceVersion, VersionsDb};
use crate::error::{Result, StoreError};
use crate::page::{paginate, Page, Pagination};
use crate::store::{
    AbortNotifier, BoxLease, BuildStore, ContainerStore, EventCursor, EventStore,
    EventStreamError, Lease, LeaseStore, PausedState, PipeStore, PipelineStore, TeamStore,
    VersionStore, VolumeStore,
};

#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    leases: Arc<std::sync::Mutex<HashMap<String, LeaseEntry>>>,
}

struct State {
    next_id: i64,
    teams: Vec<Team>,
    pipelines: Vec<PipelineRow>,
    builds: BTreeMap<i64, BuildRow>,
    build_inputs: HashMap<i64, Vec<BuildInput>>,
    build_outputs: HashMap<i64, Vec<BuildOutput>>,
    versions: Vec<VersionRow>,
    resource_ids: HashMap<(i64, String), i64>,
    job_ids: HashMap<(i64, String), i64>,
    check_orders: HashMap<(i64, String), i64>,
    events: HashMap<i64, EventLog>,
    containers: HashMap<String, Container>,
    volumes: Vec<Volume>,
    pipes: HashMap<String, Pipe>,
}

struct PipelineRow {
    saved: SavedPipeline,
    config: Config,
}

struct BuildRow {
    build: Build,
    abort_tx: watch::Sender<bool>,
    preparation: BuildPreparation,
}

struct VersionRow {
    pipeline_id: i64,
    saved: SavedVersion,
}

struct EventLog {
    events: Vec<Event>,
    finished: bool,
    seq: watch::Sender<u64>,
}

impl State {
    fn alloc_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn pipeline(&self, id: i64) -> Option<&PipelineRow> {
        self.pipelines.iter().find(|p| p.saved.id == id)
    }

    fn resource_id(&mut self, pipeline_id: i64, name: &str) -> i64 {
        if let Some(&id) = self.resource_ids.get(&(pipeline_id, name.to_string())) {
            return id;
        }
        self.next_id += 1;
        let id = self.next_id;
        self.resource_ids.insert((pipeline_id, name.to_string()), id);
        id
    }

    fn job_id(&mut self, pipeline_id: i64, name: &str) -> i64 {
        if let Some(&id) = self.job_ids.get(&(pipeline_id, name.to_string())) {
            return id;
        }
        self.next_id += 1;
        let id = self.next_id;
        self.job_ids.insert((pipeline_id, name.to_string()), id);
        id
    }

    fn next_check_order(&mut self, pipeline_id: i64, resource: &str) -> i64 {
        let order = self
            .check_orders
            .entry((pipeline_id, resource.to_string()))
            .or_insert(0);
        *order += 1;
        *order
    }

    fn event_log(&mut self, build_id: i64) -> &mut EventLog {
        self.events.entry(build_id).or_insert_with(|| {
            let (seq, _) = watch::channel(0);
            EventLog {
                events: Vec::new(),
                finished: false,
                seq,
            }
        })
    }

    fn append_event(&mut self, build_id: i64, event: Event) {
        let log = self.event_log(build_id);
        log.events.push(event);
        log.seq.send_modify(|v| *v += 1);
    }

    fn close_event_stream(&mut self, build_id: i64) {
        let log = self.event_log(build_id);
        log.finished = true;
        log.seq.send_modify(|v| *v += 1);
    }

    /// Finds or creates the version row for `(pipeline, resource,
    /// version-map)`. Creation assigns the next check order.
    fn upsert_version(
        &mut self,
        pipeline_id: i64,
        resource: &str,
        version: &Version,
        metadata: &[MetadataField],
        bump_order: bool,
    ) -> SavedVersion {
        self.resource_id(pipeline_id, resource);

        let existing = self.versions.iter().position(|row| {
            row.pipeline_id == pipeline_id
                && row.saved.resource_name == resource
                && row.saved.version == *version
        });

        match existing {
            Some(index) => {
                if bump_order {
                    let order = self.next_check_order(pipeline_id, resource);
                    self.versions[index].saved.check_order = order;
                }
                if !metadata.is_empty() {
                    self.versions[index].saved.metadata = metadata.to_vec();
                }
                self.versions[index].saved.clone()
            }
            None => {
                let id = self.alloc_id();
                let order = self.next_check_order(pipeline_id, resource);
                let saved = SavedVersion {
                    id,
                    resource_name: resource.to_string(),
                    version: version.clone(),
                    metadata: metadata.to_vec(),
                    enabled: true,
                    check_order: order,
                };
                self.versions.push(VersionRow {
                    pipeline_id,
                    saved: saved.clone(),
                });
                saved
            }
        }
    }

    fn builds_of_job(&self, pipeline_id: i64, job: &str) -> Vec<&BuildRow> {
        self.builds
            .values()
            .filter(|row| {
                row.build.pipeline_id == Some(pipeline_id)
                    && row.build.job_name.as_deref() == Some(job)
            })
            .collect()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            state: Arc::new(Mutex::new(State {
                next_id: 0,
                teams: Vec::new(),
                pipelines: Vec::new(),
                builds: BTreeMap::new(),
                build_inputs: HashMap::new(),
                build_outputs: HashMap::new(),
                versions: Vec::new(),
                resource_ids: HashMap::new(),
                job_ids: HashMap::new(),
                check_orders: HashMap::new(),
                events: HashMap::new(),
                containers: HashMap::new(),
                volumes: Vec::new(),
                pipes: HashMap::new(),
            })),
            leases: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    async fn create_build(
        &self,
        pipeline_id: Option<i64>,
        job: Option<&str>,
        team_id: Option<i64>,
    ) -> Result<Build> {
        let mut state = self.state.lock().await;

        let (pipeline_name, team_name) = match pipeline_id {
            Some(pid) => {
                let row = state.pipeline(pid).ok_or(StoreError::NotFound)?;
                (Some(row.saved.name.clone()), row.saved.team_name.clone())
            }
            None => {
                let team_id = team_id.ok_or(StoreError::NotFound)?;
                let team = state
                    .teams
                    .iter()
                    .find(|t| t.id == team_id)
                    .ok_or(StoreError::NotFound)?;
                (None, team.name.clone())
            }
        };

        let name = match (pipeline_id, job) {
            (Some(pid), Some(job)) => {
                let count = state.builds_of_job(pid, job).len();
                (count + 1).to_string()
            }
            _ => {
                let count = state
                    .builds
                    .values()
                    .filter(|row| row.build.is_one_off())
                    .count();
                (count + 1).to_string()
            }
        };

        let id = state.alloc_id();
        if let (Some(pid), Some(job)) = (pipeline_id, job) {
            state.job_id(pid, job);
        }

        let build = Build {
            id,
            name,
            job_name: job.map(str::to_string),
            pipeline_id,
            pipeline_name,
            team_name,
            status: BuildStatus::Pending,
            engine: String::new(),
            engine_metadata: String::new(),
            start_time: None,
            end_time: None,
        };

        let (abort_tx, _) = watch::channel(false);
        state.builds.insert(
            id,
            BuildRow {
                build: build.clone(),
                abort_tx,
                preparation: BuildPreparation::new(id),
            },
        );

        Ok(build)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TeamStore for MemoryStore {
    async fn save_team(&self, name: &str) -> Result<Team> {
        let mut state = self.state.lock().await;
        if let Some(team) = state.teams.iter().find(|t| t.name == name) {
            return Ok(team.clone());
        }
        let id = state.alloc_id();
        let team = Team {
            id,
            name: name.to_string(),
        };
        state.teams.push(team.clone());
        Ok(team)
    }

    async fn get_team_by_name(&self, name: &str) -> Result<Option<Team>> {
        let state = self.state.lock().await;
        Ok(state.teams.iter().find(|t| t.name == name).cloned())
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn get_all_pipelines(&self) -> Result<Vec<SavedPipeline>> {
        let state = self.state.lock().await;
        Ok(state.pipelines.iter().map(|p| p.saved.clone()).collect())
    }

    async fn get_pipeline_by_team_and_name(
        &self,
        team: &str,
        name: &str,
    ) -> Result<Option<SavedPipeline>> {
        let state = self.state.lock().await;
        Ok(state
            .pipelines
            .iter()
            .find(|p| p.saved.team_name == team && p.saved.name == name)
            .map(|p| p.saved.clone()))
    }

    async fn save_config(
        &self,
        team: &str,
        name: &str,
        config: &Config,
        from_version: i64,
        initially_paused: PausedState,
    ) -> Result<(SavedPipeline, bool)> {
        config.validate()?;

        let mut state = self.state.lock().await;
        let team = state
            .teams
            .iter()
            .find(|t| t.name == team)
            .cloned()
            .ok_or(StoreError::NotFound)?;

        let existing = state
            .pipelines
            .iter()
            .position(|p| p.saved.team_id == team.id && p.saved.name == name);

        match existing {
            Some(index) => {
                if state.pipelines[index].saved.config_version != from_version {
                    return Err(StoreError::ConfigComparisonFailed);
                }
                state.pipelines[index].config = config.clone();
                state.pipelines[index].saved.config_version += 1;
                match initially_paused {
                    PausedState::Paused => state.pipelines[index].saved.paused = true,
                    PausedState::Unpaused => state.pipelines[index].saved.paused = false,
                    PausedState::NoChange => {}
                }
                Ok((state.pipelines[index].saved.clone(), false))
            }
            None => {
                let id = state.alloc_id();
                let saved = SavedPipeline {
                    id,
                    name: name.to_string(),
                    team_id: team.id,
                    team_name: team.name.clone(),
                    paused: initially_paused == PausedState::Paused,
                    config_version: 1,
                };
                state.pipelines.push(PipelineRow {
                    saved: saved.clone(),
                    config: config.clone(),
                });
                Ok((saved, true))
            }
        }
    }

    async fn get_config(&self, pipeline_id: i64) -> Result<Option<(Config, i64)>> {
        let state = self.state.lock().await;
        Ok(state
            .pipeline(pipeline_id)
            .map(|row| (row.config.clone(), row.saved.config_version)))
    }

    async fn set_pipeline_paused(&self, pipeline_id: i64, paused: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        let row = state
            .pipelines
            .iter_mut()
            .find(|p| p.saved.id == pipeline_id)
            .ok_or(StoreError::NotFound)?;
        row.saved.paused = paused;
        Ok(())
    }

    async fn reset_build_preparations_with_pipeline_paused(&self, pipeline_id: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        let pending: Vec<i64> = state
            .builds
            .values()
            .filter(|row| {
                row.build.pipeline_id == Some(pipeline_id)
                    && row.build.status == BuildStatus::Pending
            })
            .map(|row| row.build.id)
            .collect();

        for build_id in pending {
            if let Some(row) = state.builds.get_mut(&build_id) {
                let mut prep = BuildPreparation::new(build_id);
                prep.paused_pipeline = PreparationStatus::Blocking;
                row.preparation = prep;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BuildStore for MemoryStore {
    async fn create_job_build(&self, pipeline_id: i64, job: &str) -> Result<Build> {
        self.create_build(Some(pipeline_id), Some(job), None).await
    }

    async fn create_job_build_for_candidate_inputs(
        &self,
        pipeline_id: i64,
        job: &str,
    ) -> Result<(Build, bool)> {
        {
            let state = self.state.lock().await;
            let pending = state
                .builds_of_job(pipeline_id, job)
                .into_iter()
                .find(|row| row.build.status == BuildStatus::Pending)
                .map(|row| row.build.clone());
            if let Some(existing) = pending {
                return Ok((existing, false));
            }
        }

        let build = self.create_build(Some(pipeline_id), Some(job), None).await?;
        Ok((build, true))
    }

    async fn create_one_off_build(&self, team_id: i64) -> Result<Build> {
        self.create_build(None, None, Some(team_id)).await
    }

    async fn get_build(&self, build_id: i64) -> Result<Option<Build>> {
        let state = self.state.lock().await;
        Ok(state.builds.get(&build_id).map(|row| row.build.clone()))
    }

    async fn get_all_started_builds(&self) -> Result<Vec<Build>> {
        let state = self.state.lock().await;
        Ok(state
            .builds
            .values()
            .filter(|row| row.build.status == BuildStatus::Started)
            .map(|row| row.build.clone())
            .collect())
    }

    async fn get_next_pending_build(&self, pipeline_id: i64, job: &str) -> Result<Option<Build>> {
        let state = self.state.lock().await;
        Ok(state
            .builds_of_job(pipeline_id, job)
            .into_iter()
            .filter(|row| row.build.status == BuildStatus::Pending)
            .min_by_key(|row| row.build.id)
            .map(|row| row.build.clone()))
    }

    async fn get_job_build_for_inputs(
        &self,
        pipeline_id: i64,
        job: &str,
        inputs: &[BuildInput],
    ) -> Result<Option<Build>> {
        let state = self.state.lock().await;
        for row in state.builds_of_job(pipeline_id, job).into_iter().rev() {
            let recorded = state
                .build_inputs
                .get(&row.build.id)
                .cloned()
                .unwrap_or_default();
            let all_match = inputs.iter().all(|input| {
                recorded.iter().any(|r| {
                    r.name == input.name
                        && r.resource == input.resource
                        && r.version == input.version
                })
            });
            if all_match && !inputs.is_empty() && recorded.len() >= inputs.len() {
                return Ok(Some(row.build.clone()));
            }
        }
        Ok(None)
    }

    async fn get_running_builds_of_job(&self, pipeline_id: i64, job: &str) -> Result<Vec<Build>> {
        let state = self.state.lock().await;
        Ok(state
            .builds_of_job(pipeline_id, job)
            .into_iter()
            .filter(|row| {
                matches!(
                    row.build.status,
                    BuildStatus::Scheduled | BuildStatus::Started
                )
            })
            .map(|row| row.build.clone())
            .collect())
    }

    async fn start_build(
        &self,
        build_id: i64,
        engine: &str,
        engine_metadata: &str,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let row = state.builds.get_mut(&build_id).ok_or(StoreError::NotFound)?;

        if !row.build.status.can_transition_to(BuildStatus::Started) {
            return Ok(false);
        }

        row.build.status = BuildStatus::Started;
        row.build.engine = engine.to_string();
        row.build.engine_metadata = engine_metadata.to_string();
        row.build.start_time = Some(Utc::now());

        state.append_event(
            build_id,
            Event::Status {
                status: BuildStatus::Started,
                time: Utc::now().timestamp(),
            },
        );
        Ok(true)
    }

    async fn finish_build(&self, build_id: i64, status: BuildStatus) -> Result<()> {
        let mut state = self.state.lock().await;
        let row = state.builds.get_mut(&build_id).ok_or(StoreError::NotFound)?;

        if row.build.status.is_terminal() {
            return Ok(());
        }
        if !status.is_terminal() {
            return Err(StoreError::IllegalTransition {
                from: row.build.status,
                to: status,
            });
        }

        row.build.status = status;
        row.build.end_time = Some(Utc::now());

        state.append_event(
            build_id,
            Event::Status {
                status,
                time: Utc::now().timestamp(),
            },
        );
        state.close_event_stream(build_id);
        Ok(())
    }

    async fn error_build(&self, build_id: i64, message: &str) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if !state.builds.contains_key(&build_id) {
                return Err(StoreError::NotFound);
            }
            state.append_event(
                build_id,
                Event::Error {
                    message: message.to_string(),
                    origin: None,
                },
            );
        }
        self.finish_build(build_id, BuildStatus::Errored).await
    }

    async fn abort_build(&self, build_id: i64) -> Result<()> {
        let status = {
            let state = self.state.lock().await;
            let row = state.builds.get(&build_id).ok_or(StoreError::NotFound)?;
            row.build.status
        };

        match status {
            status if status.is_terminal() => Ok(()),
            BuildStatus::Pending | BuildStatus::Scheduled => {
                self.finish_build(build_id, BuildStatus::Aborted).await
            }
            _ => {
                let state = self.state.lock().await;
                let row = state.builds.get(&build_id).ok_or(StoreError::NotFound)?;
                let _ = row.abort_tx.send(true);
                Ok(())
            }
        }
    }

    async fn abort_notifier(&self, build_id: i64) -> Result<AbortNotifier> {
        let state = self.state.lock().await;
        let row = state.builds.get(&build_id).ok_or(StoreError::NotFound)?;
        Ok(AbortNotifier::new(row.abort_tx.subscribe()))
    }

    async fn update_build_to_scheduled(&self, build_id: i64) -> Result<bool> {
        let mut state = self.state.lock().await;
        let row = state.builds.get_mut(&build_id).ok_or(StoreError::NotFound)?;
        if row.build.status != BuildStatus::Pending {
            return Ok(false);
        }
        row.build.status = BuildStatus::Scheduled;
        Ok(true)
    }

    async fn save_build_input(&self, build_id: i64, input: &BuildInput) -> Result<SavedVersion> {
        let mut state = self.state.lock().await;
        let (pipeline_id, job_name) = {
            let row = state.builds.get(&build_id).ok_or(StoreError::NotFound)?;
            (
                row.build.pipeline_id.unwrap_or(0),
                row.build.job_name.clone(),
            )
        };

        let saved = state.upsert_version(
            pipeline_id,
            &input.resource,
            &input.version,
            &input.metadata,
            false,
        );

        let first_occurrence = match &job_name {
            Some(job) => !state
                .builds_of_job(pipeline_id, job)
                .into_iter()
                .filter(|row| row.build.id != build_id)
                .any(|row| {
                    state
                        .build_inputs
                        .get(&row.build.id)
                        .is_some_and(|inputs| {
                            inputs
                                .iter()
                                .any(|i| i.resource == input.resource && i.version == input.version)
                        })
                }),
            None => true,
        };

        let inputs = state.build_inputs.entry(build_id).or_default();
        let recorded = BuildInput {
            first_occurrence,
            ..input.clone()
        };
        match inputs.iter_mut().find(|i| i.name == input.name) {
            Some(slot) => *slot = recorded,
            None => inputs.push(recorded),
        }

        Ok(saved)
    }

    async fn save_build_output(
        &self,
        build_id: i64,
        resource: &str,
        version: &Version,
    ) -> Result<SavedVersion> {
        let mut state = self.state.lock().await;
        let pipeline_id = {
            let row = state.builds.get(&build_id).ok_or(StoreError::NotFound)?;
            row.build.pipeline_id.unwrap_or(0)
        };

        let saved = state.upsert_version(pipeline_id, resource, version, &[], false);

        let outputs = state.build_outputs.entry(build_id).or_default();
        if !outputs
            .iter()
            .any(|o| o.resource == resource && o.version == *version)
        {
            outputs.push(BuildOutput {
                resource: resource.to_string(),
                version: version.clone(),
            });
        }

        Ok(saved)
    }

    async fn get_build_inputs(&self, build_id: i64) -> Result<Vec<BuildInput>> {
        let state = self.state.lock().await;
        Ok(state.build_inputs.get(&build_id).cloned().unwrap_or_default())
    }

    async fn get_build_outputs(&self, build_id: i64) -> Result<Vec<BuildOutput>> {
        let state = self.state.lock().await;
        Ok(state
            .build_outputs
            .get(&build_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_build_preparation(&self, build_id: i64) -> Result<Option<BuildPreparation>> {
        let state = self.state.lock().await;
        Ok(state.builds.get(&build_id).map(|row| row.preparation.clone()))
    }

    async fn update_build_preparation(&self, prep: &BuildPreparation) -> Result<()> {
        let mut state = self.state.lock().await;
        let row = state
            .builds
            .get_mut(&prep.build_id)
            .ok_or(StoreError::NotFound)?;
        row.preparation = prep.clone();
        Ok(())
    }

    async fn job_builds_page(
        &self,
        pipeline_id: i64,
        job: &str,
        page: &Page,
    ) -> Result<(Vec<Build>, Pagination)> {
        let state = self.state.lock().await;
        let mut builds: Vec<Build> = state
            .builds_of_job(pipeline_id, job)
            .into_iter()
            .map(|row| row.build.clone())
            .collect();
        builds.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(paginate(builds, page, |b| b.id))
    }
}

struct MemoryEventCursor {
    state: Arc<Mutex<State>>,
    build_id: i64,
    offset: usize,
    seq: watch::Receiver<u64>,
    closed: bool,
}

#[async_trait]
impl EventCursor for MemoryEventCursor {
    async fn next(&mut self) -> std::result::Result<Event, EventStreamError> {
        loop {
            if self.closed {
                return Err(EventStreamError::Closed);
            }

            {
                let state = self.state.lock().await;
                if let Some(log) = state.events.get(&self.build_id) {
                    if self.offset < log.events.len() {
                        let event = log.events[self.offset].clone();
                        self.offset += 1;
                        return Ok(event);
                    }
                    if log.finished {
                        return Err(EventStreamError::EndOfStream);
                    }
                }
            }

            if self.seq.changed().await.is_err() {
                return Err(EventStreamError::Closed);
            }
        }
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn save_build_event(&self, build_id: i64, event: &Event) -> Result<()> {
        let mut state = self.state.lock().await;
        state.append_event(build_id, event.clone());
        Ok(())
    }

    async fn get_build_events(&self, build_id: i64, from: usize) -> Result<Box<dyn EventCursor>> {
        let seq = {
            let mut state = self.state.lock().await;
            state.event_log(build_id).seq.subscribe()
        };
        Ok(Box::new(MemoryEventCursor {
            state: self.state.clone(),
            build_id,
            offset: from,
            seq,
            closed: false,
        }))
    }
}

#[async_trait]
impl VersionStore for MemoryStore {
    async fn save_resource_versions(
        &self,
        pipeline_id: i64,
        resource: &ResourceConfig,
        versions: &[(Version, Vec<MetadataField>)],
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        for (version, metadata) in versions {
            state.upsert_version(pipeline_id, &resource.name, version, metadata, true);
        }
        Ok(())
    }

    async fn get_latest_versioned_resource(
        &self,
        pipeline_id: i64,
        resource: &str,
    ) -> Result<Option<SavedVersion>> {
        let state = self.state.lock().await;
        Ok(state
            .versions
            .iter()
            .filter(|row| row.pipeline_id == pipeline_id && row.saved.resource_name == resource)
            .max_by_key(|row| row.saved.check_order)
            .map(|row| row.saved.clone()))
    }

    async fn get_resource_versions(
        &self,
        pipeline_id: i64,
        resource: &str,
        page: &Page,
    ) -> Result<(Vec<SavedVersion>, Pagination)> {
        let state = self.state.lock().await;
        let mut versions: Vec<SavedVersion> = state
            .versions
            .iter()
            .filter(|row| row.pipeline_id == pipeline_id && row.saved.resource_name == resource)
            .map(|row| row.saved.clone())
            .collect();
        versions.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(paginate(versions, page, |v| v.id))
    }

    async fn get_version_by_id(&self, version_id: i64) -> Result<Option<SavedVersion>> {
        let state = self.state.lock().await;
        Ok(state
            .versions
            .iter()
            .find(|row| row.saved.id == version_id)
            .map(|row| row.saved.clone()))
    }

    async fn enable_versioned_resource(&self, version_id: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        let row = state
            .versions
            .iter_mut()
            .find(|row| row.saved.id == version_id)
            .ok_or(StoreError::NotFound)?;
        row.saved.enabled = true;
        Ok(())
    }

    async fn disable_versioned_resource(&self, version_id: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        let row = state
            .versions
            .iter_mut()
            .find(|row| row.saved.id == version_id)
            .ok_or(StoreError::NotFound)?;
        row.saved.enabled = false;
        Ok(())
    }

    async fn load_versions_db(&self, pipeline_id: i64) -> Result<VersionsDb> {
        let state = self.state.lock().await;

        let resource_ids: HashMap<String, i64> = state
            .resource_ids
            .iter()
            .filter(|((pid, _), _)| *pid == pipeline_id)
            .map(|((_, name), &id)| (name.clone(), id))
            .collect();

        let job_ids: HashMap<String, i64> = state
            .job_ids
            .iter()
            .filter(|((pid, _), _)| *pid == pipeline_id)
            .map(|((_, name), &id)| (name.clone(), id))
            .collect();

        let resource_versions: Vec<ResourceVersion> = state
            .versions
            .iter()
            .filter(|row| row.pipeline_id == pipeline_id && row.saved.enabled)
            .filter_map(|row| {
                resource_ids
                    .get(&row.saved.resource_name)
                    .map(|&resource_id| ResourceVersion {
                        version_id: row.saved.id,
                        resource_id,
                        check_order: row.saved.check_order,
                    })
            })
            .collect();

        let version_id_of = |resource: &str, version: &Version| -> Option<i64> {
            state
                .versions
                .iter()
                .find(|row| {
                    row.pipeline_id == pipeline_id
                        && row.saved.resource_name == resource
                        && row.saved.version == *version
                })
                .map(|row| row.saved.id)
        };

        let mut build_outputs = Vec::new();
        let mut build_inputs = Vec::new();

        for row in state.builds.values() {
            if row.build.pipeline_id != Some(pipeline_id)
                || row.build.status != BuildStatus::Succeeded
            {
                continue;
            }
            let Some(job_name) = &row.build.job_name else {
                continue;
            };
            let Some(&job_id) = job_ids.get(job_name) else {
                continue;
            };

            if let Some(outputs) = state.build_outputs.get(&row.build.id) {
                for output in outputs {
                    if let (Some(version_id), Some(&resource_id)) = (
                        version_id_of(&output.resource, &output.version),
                        resource_ids.get(&output.resource),
                    ) {
                        build_outputs.push(BuildVersion {
                            version_id,
                            resource_id,
                            build_id: row.build.id,
                            job_id,
                        });
                    }
                }
            }

            if let Some(inputs) = state.build_inputs.get(&row.build.id) {
                for input in inputs {
                    if let (Some(version_id), Some(&resource_id)) = (
                        version_id_of(&input.resource, &input.version),
                        resource_ids.get(&input.resource),
                    ) {
                        build_inputs.push(BuildVersion {
                            version_id,
                            resource_id,
                            build_id: row.build.id,
                            job_id,
                        });
                    }
                }
            }
        }

        Ok(VersionsDb {
            resource_versions,
            build_outputs,
            build_inputs,
            job_ids,
            resource_ids,
        })
    }
}

#[async_trait]
impl ContainerStore for MemoryStore {
    async fn create_container(&self, container: &Container, ttl: Duration) -> Result<Container> {
        container.identifier.validate().map_err(StoreError::Identifier)?;

        let mut saved = container.clone();
        saved.expires_at = if ttl.is_zero() {
            None
        } else {
            Some(Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default())
        };

        let mut state = self.state.lock().await;
        state.containers.insert(saved.handle.clone(), saved.clone());
        Ok(saved)
    }

    async fn get_container(&self, handle: &str) -> Result<Option<Container>> {
        let state = self.state.lock().await;
        Ok(state.containers.get(handle).cloned())
    }

    async fn find_container_by_identifier(
        &self,
        identifier: &ContainerIdentifier,
    ) -> Result<Option<Container>> {
        identifier.validate().map_err(StoreError::Identifier)?;

        let state = self.state.lock().await;
        let now = Utc::now();
        let mut matches = state.containers.values().filter(|c| {
            c.expires_at.is_none_or(|at| at > now) && identifier.matches(&c.identifier)
        });

        let first = matches.next().cloned();
        if matches.next().is_some() {
            return Err(StoreError::Identifier(IdentifierError::Multiple));
        }
        Ok(first)
    }

    async fn find_containers_by_descriptors(
        &self,
        metadata: &ContainerMetadata,
    ) -> Result<Vec<Container>> {
        let state = self.state.lock().await;
        let now = Utc::now();
        Ok(state
            .containers
            .values()
            .filter(|c| c.expires_at.is_none_or(|at| at > now))
            .filter(|c| {
                (metadata.pipeline_name.is_empty()
                    || c.metadata.pipeline_name == metadata.pipeline_name)
                    && (metadata.job_name.is_empty() || c.metadata.job_name == metadata.job_name)
                    && (metadata.step_name.is_empty()
                        || c.metadata.step_name == metadata.step_name)
                    && (metadata.worker_name.is_empty()
                        || c.metadata.worker_name == metadata.worker_name)
                    && metadata
                        .container_type
                        .is_none_or(|t| c.metadata.container_type == Some(t))
            })
            .cloned()
            .collect())
    }

    async fn update_expires_at_on_container(&self, handle: &str, ttl: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        let container = state
            .containers
            .get_mut(handle)
            .ok_or(StoreError::NotFound)?;
        container.expires_at = if ttl.is_zero() {
            None
        } else {
            Some(Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default())
        };
        Ok(())
    }

    async fn reap_container(&self, handle: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.containers.remove(handle);
        Ok(())
    }

    async fn get_expired_containers(&self) -> Result<Vec<Container>> {
        let state = self.state.lock().await;
        let now = Utc::now();
        Ok(state
            .containers
            .values()
            .filter(|c| c.expires_at.is_some_and(|at| at <= now))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Leases
// ---------------------------------------------------------------------------

struct LeaseEntry {
    held: bool,
    last: Option<Instant>,
}

struct MemoryLease {
    subject: String,
    table: Arc<std::sync::Mutex<HashMap<String, LeaseEntry>>>,
    refresher: tokio::task::JoinHandle<()>,
    broken: bool,
}

impl MemoryLease {
    fn release(&self) {
        let mut table = self.table.lock().unwrap();
        if let Some(entry) = table.get_mut(&self.subject) {
            entry.held = false;
            entry.last = Some(Instant::now());
        }
    }
}

#[async_trait]
impl Lease for MemoryLease {
    async fn break_lease(&mut self) {
        if self.broken {
            return;
        }
        self.broken = true;
        self.refresher.abort();
        self.release();
    }
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        if !self.broken {
            self.refresher.abort();
            self.release();
        }
    }
}

impl MemoryStore {
    fn try_acquire(
        &self,
        subject: String,
        interval: Duration,
        immediate: bool,
    ) -> Option<BoxLease> {
        {
            let mut table = self.leases.lock().unwrap();
            let entry = table.entry(subject.clone()).or_insert(LeaseEntry {
                held: false,
                last: None,
            });

            if entry.held {
                return None;
            }
            if !immediate {
                if let Some(last) = entry.last {
                    if last.elapsed() < interval {
                        return None;
                    }
                }
            }

            entry.held = true;
            entry.last = Some(Instant::now());
        }

        let table = self.leases.clone();
        let refresh_subject = subject.clone();
        let refresh_every = (interval / 4).max(Duration::from_millis(10));
        let refresher = tokio::spawn({
            let table = table.clone();
            async move {
                loop {
                    tokio::time::sleep(refresh_every).await;
                    let mut table = table.lock().unwrap();
                    match table.get_mut(&refresh_subject) {
                        Some(entry) if entry.held => entry.last = Some(Instant::now()),
                        _ => return,
                    }
                }
            }
        });

        Some(Box::new(MemoryLease {
            subject,
            table,
            refresher,
            broken: false,
        }))
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn lease_scheduling(
        &self,
        pipeline_id: i64,
        interval: Duration,
    ) -> Result<Option<BoxLease>> {
        Ok(self.try_acquire(format!("pipeline:{pipeline_id}:schedule"), interval, false))
    }

    async fn lease_resource_checking(
        &self,
        pipeline_id: i64,
        resource: &str,
        interval: Duration,
        immediate: bool,
    ) -> Result<Option<BoxLease>> {
        Ok(self.try_acquire(
            format!("resource:{pipeline_id}/{resource}:check"),
            interval,
            immediate,
        ))
    }

    async fn lease_build_scheduling(
        &self,
        build_id: i64,
        interval: Duration,
    ) -> Result<Option<BoxLease>> {
        Ok(self.try_acquire(format!("build:{build_id}:schedule"), interval, false))
    }

    async fn lease_build_tracking(
        &self,
        build_id: i64,
        interval: Duration,
    ) -> Result<Option<BoxLease>> {
        Ok(self.try_acquire(format!("build:{build_id}:track"), interval, false))
    }

    async fn lease_cache_invalidation(&self, interval: Duration) -> Result<Option<BoxLease>> {
        Ok(self.try_acquire("cache:invalidate".to_string(), interval, false))
    }
}

#[async_trait]
impl VolumeStore for MemoryStore {
    async fn insert_volume(&self, volume: &Volume) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .volumes
            .retain(|v| !(v.worker_name == volume.worker_name && v.handle == volume.handle));
        state.volumes.push(volume.clone());
        Ok(())
    }

    async fn get_volumes(&self) -> Result<Vec<Volume>> {
        let state = self.state.lock().await;
        Ok(state.volumes.clone())
    }

    async fn set_volume_ttl(&self, worker_name: &str, handle: &str, ttl: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        let volume = state
            .volumes
            .iter_mut()
            .find(|v| v.worker_name == worker_name && v.handle == handle)
            .ok_or(StoreError::NotFound)?;
        volume.ttl = ttl;
        volume.expires_at = if ttl.is_zero() {
            None
        } else {
            Some(Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default())
        };
        Ok(())
    }
}

#[async_trait]
impl PipeStore for MemoryStore {
    async fn create_pipe(&self, id: &str, url: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.pipes.insert(
            id.to_string(),
            Pipe {
                id: id.to_string(),
                url: url.to_string(),
            },
        );
        Ok(())
    }

    async fn get_pipe(&self, id: &str) -> Result<Option<Pipe>> {
        let state = self.state.lock().await;
        Ok(state.pipes.get(id).cloned())
    }
}
