//! The exec engine: persisted plans driven to completion.
//!
//! `create_build` stamps the build as started with the serialized plan as
//! its engine metadata; `lookup_build` re-parses that metadata, which is
//! how a restarted process re-attaches to in-flight builds. Container
//! identity makes re-attachment idempotent: steps find their existing
//! containers instead of creating new ones.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use conveyor_core::{Build, BuildStatus, Plan};
use conveyor_store::prelude::*;

use crate::clock::Clock;
use crate::delegate::{BuildDelegate, ExecBuildDelegate};
use crate::signals::{signal_channel, Ready, Signal};
use crate::source_repository::SourceRepository;
use crate::step::{BoxStep, Step, Success};
use crate::steps::{
    AggregateStep, DependentGetStep, EnsureStep, GetStep, OnFailureStep, OnSuccessStep, PutStep,
    TaskStep, TimeoutStep, TryStep,
};
use crate::worker::Client;

pub const ENGINE_NAME: &str = "exec";

#[async_trait]
pub trait Engine: Send + Sync {
    /// Starts the build and returns a handle ready to be resumed.
    async fn create_build(&self, build: &Build, plan: &Plan) -> anyhow::Result<Box<dyn EngineBuild>>;

    /// Reconstructs a handle for an already-started build from its
    /// persisted engine metadata.
    fn lookup_build(&self, build: &Build) -> anyhow::Result<Box<dyn EngineBuild>>;
}

#[async_trait]
pub trait EngineBuild: Send + Sync {
    /// Runs the plan to completion and finishes the build.
    async fn resume(self: Box<Self>);

    /// Requests an abort; the running interpreter observes it through the
    /// store's abort notifier.
    async fn abort(&self) -> anyhow::Result<()>;
}

pub struct ExecEngine {
    store: Arc<dyn Store>,
    workers: Arc<dyn Client>,
    clock: Arc<dyn Clock>,
}

impl ExecEngine {
    pub fn new(store: Arc<dyn Store>, workers: Arc<dyn Client>, clock: Arc<dyn Clock>) -> Self {
        ExecEngine {
            store,
            workers,
            clock,
        }
    }

    fn build_handle(&self, build: Build, plan: Plan) -> Box<dyn EngineBuild> {
        Box::new(ExecBuild {
            store: self.store.clone(),
            workers: self.workers.clone(),
            clock: self.clock.clone(),
            build,
            plan,
        })
    }
}

#[async_trait]
impl Engine for ExecEngine {
    async fn create_build(
        &self,
        build: &Build,
        plan: &Plan,
    ) -> anyhow::Result<Box<dyn EngineBuild>> {
        let metadata = serde_json::to_string(plan).context("failed to serialize build plan")?;

        let started = self
            .store
            .start_build(build.id, ENGINE_NAME, &metadata)
            .await
            .context("failed to start build")?;
        if !started {
            return Err(anyhow!("build {} is not in a startable state", build.id));
        }

        Ok(self.build_handle(build.clone(), plan.clone()))
    }

    fn lookup_build(&self, build: &Build) -> anyhow::Result<Box<dyn EngineBuild>> {
        if build.engine != ENGINE_NAME {
            return Err(anyhow!(
                "build {} belongs to unknown engine '{}'",
                build.id,
                build.engine
            ));
        }

        let plan: Plan = serde_json::from_str(&build.engine_metadata)
            .context("failed to parse build engine metadata")?;

        Ok(self.build_handle(build.clone(), plan))
    }
}

pub struct ExecBuild {
    store: Arc<dyn Store>,
    workers: Arc<dyn Client>,
    clock: Arc<dyn Clock>,
    build: Build,
    plan: Plan,
}

#[async_trait]
impl EngineBuild for ExecBuild {
    async fn resume(self: Box<Self>) {
        let build_id = self.build.id;
        tracing::info!(build_id, "resuming build");

        let delegate: Arc<dyn BuildDelegate> =
            Arc::new(ExecBuildDelegate::new(self.store.clone(), build_id));
        let context = StepContext {
            build_id,
            workers: self.workers.clone(),
            delegate,
            repo: Arc::new(SourceRepository::new()),
            clock: self.clock.clone(),
        };
        let mut root = construct_step(&self.plan, &context);

        let (handle, mut signals) = signal_channel();
        let aborted = Arc::new(AtomicBool::new(false));

        let watcher = match self.store.abort_notifier(build_id).await {
            Ok(mut notifier) => {
                let aborted = aborted.clone();
                Some(tokio::spawn(async move {
                    notifier.notified().await;
                    aborted.store(true, Ordering::SeqCst);
                    handle.send(Signal::Interrupt);
                }))
            }
            Err(err) => {
                tracing::warn!(build_id, error = %err, "no abort notifier for build");
                None
            }
        };

        let (ready, _ready_rx) = Ready::new();
        let result = root.run(&mut signals, ready).await;
        root.release().await;

        if let Some(watcher) = &watcher {
            watcher.abort();
        }

        let finish = if aborted.load(Ordering::SeqCst) {
            self.store.finish_build(build_id, BuildStatus::Aborted).await
        } else {
            match result {
                Ok(()) => {
                    let status = if root.succeeded() == Some(Success(true)) {
                        BuildStatus::Succeeded
                    } else {
                        BuildStatus::Failed
                    };
                    self.store.finish_build(build_id, status).await
                }
                Err(err) => {
                    tracing::warn!(build_id, error = %err, "build errored");
                    self.store.error_build(build_id, &err.to_string()).await
                }
            }
        };

        if let Err(err) = finish {
            tracing::error!(build_id, error = %err, "failed to finish build");
        }
    }

    async fn abort(&self) -> anyhow::Result<()> {
        self.store.abort_build(self.build.id).await?;
        Ok(())
    }
}

struct StepContext {
    build_id: i64,
    workers: Arc<dyn Client>,
    delegate: Arc<dyn BuildDelegate>,
    repo: Arc<SourceRepository>,
    clock: Arc<dyn Clock>,
}

fn construct_step(plan: &Plan, context: &StepContext) -> BoxStep {
    match plan {
        Plan::Get(get) => Box::new(GetStep::new(
            get.clone(),
            context.build_id,
            context.workers.clone(),
            context.delegate.input_delegate(get),
            context.repo.clone(),
        )),

        Plan::Put(put) => Box::new(PutStep::new(
            put.clone(),
            context.build_id,
            context.workers.clone(),
            context.delegate.output_delegate(put),
            context.repo.clone(),
            Arc::new(Mutex::new(None)),
        )),

        Plan::DependentGet(get) => {
            let plan_id = get.location.as_ref().map(|l| l.id).unwrap_or_default();
            Box::new(DependentGetStep::new(
                get.clone(),
                context.build_id,
                context.workers.clone(),
                context
                    .delegate
                    .implicit_output_delegate(&get.name, &get.resource, plan_id),
                context.repo.clone(),
                Arc::new(Mutex::new(None)),
            ))
        }

        Plan::Task(task) => Box::new(TaskStep::new(
            task.clone(),
            context.build_id,
            context.workers.clone(),
            context.delegate.task_delegate(task),
            context.repo.clone(),
        )),

        // a put is always followed by its dependent get; the pair shares
        // the produced version through one slot
        Plan::OnSuccess { step, next } => {
            if let (Plan::Put(put), Plan::DependentGet(get)) = (step.as_ref(), next.as_ref()) {
                let slot = Arc::new(Mutex::new(None));
                let get_plan_id = get.location.as_ref().map(|l| l.id).unwrap_or_default();
                let put_step = Box::new(PutStep::new(
                    put.clone(),
                    context.build_id,
                    context.workers.clone(),
                    context.delegate.output_delegate(put),
                    context.repo.clone(),
                    slot.clone(),
                ));
                let get_step = Box::new(DependentGetStep::new(
                    get.clone(),
                    context.build_id,
                    context.workers.clone(),
                    context
                        .delegate
                        .implicit_output_delegate(&get.name, &get.resource, get_plan_id),
                    context.repo.clone(),
                    slot,
                ));
                Box::new(OnSuccessStep::new(put_step, get_step))
            } else {
                Box::new(OnSuccessStep::new(
                    construct_step(step, context),
                    construct_step(next, context),
                ))
            }
        }

        Plan::OnFailure { step, next } => Box::new(OnFailureStep::new(
            construct_step(step, context),
            construct_step(next, context),
        )),

        Plan::Ensure { step, next } => Box::new(EnsureStep::new(
            construct_step(step, context),
            construct_step(next, context),
        )),

        Plan::Try(step) => Box::new(TryStep::new(construct_step(step, context))),

        Plan::Aggregate(children) => Box::new(AggregateStep::new(
            children
                .iter()
                .map(|child| construct_step(child, context))
                .collect(),
        )),

        Plan::Timeout { duration, step } => Box::new(TimeoutStep::new(
            duration.clone(),
            construct_step(step, context),
            context.clock.clone(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::worker::test_support::{FakeContainer, FakeWorker};
    use conveyor_core::{
        Config, GetPlan, JobConfig, Location, ResourceConfig, TaskConfig, TaskPlan, TaskRunConfig,
        Version,
    };
    use conveyor_store::memory::MemoryStore;
    use conveyor_store::PausedState;

    async fn build_fixture(store: &MemoryStore) -> Build {
        store.save_team("some-team").await.unwrap();
        let config = Config {
            resources: vec![ResourceConfig {
                name: "some-input".to_string(),
                resource_type: "git".to_string(),
                ..Default::default()
            }],
            jobs: vec![JobConfig {
                name: "some-job".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let (pipeline, _) = store
            .save_config("some-team", "some-pipeline", &config, 0, PausedState::Unpaused)
            .await
            .unwrap();
        store.create_job_build(pipeline.id, "some-job").await.unwrap()
    }

    fn engine_with_worker(store: Arc<MemoryStore>, container: Arc<FakeContainer>) -> ExecEngine {
        let worker = Arc::new(FakeWorker::new(container));
        ExecEngine::new(store, worker, Arc::new(TestClock::new()))
    }

    fn task_plan(name: &str, id: u32) -> Plan {
        Plan::Task(TaskPlan {
            name: name.to_string(),
            pipeline: "some-pipeline".to_string(),
            config: Some(TaskConfig {
                platform: "linux".to_string(),
                run: Some(TaskRunConfig {
                    path: "make".to_string(),
                    args: vec![],
                }),
                ..Default::default()
            }),
            location: Some(Location {
                id,
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn a_resumed_build_runs_to_success() {
        let store = Arc::new(MemoryStore::new());
        let build = build_fixture(&store).await;
        let container = Arc::new(FakeContainer::new("c1").with_task_exit(0));
        let engine = engine_with_worker(store.clone(), container);

        let handle = engine
            .create_build(&build, &task_plan("unit", 1))
            .await
            .unwrap();
        handle.resume().await;

        let finished = store.get_build(build.id).await.unwrap().unwrap();
        assert_eq!(finished.status, BuildStatus::Succeeded);
        assert_eq!(finished.engine, ENGINE_NAME);
        assert!(!finished.engine_metadata.is_empty());
    }

    #[tokio::test]
    async fn a_failing_task_fails_the_build() {
        let store = Arc::new(MemoryStore::new());
        let build = build_fixture(&store).await;
        let container = Arc::new(FakeContainer::new("c1").with_task_exit(1));
        let engine = engine_with_worker(store.clone(), container);

        let handle = engine
            .create_build(&build, &task_plan("unit", 1))
            .await
            .unwrap();
        handle.resume().await;

        let finished = store.get_build(build.id).await.unwrap().unwrap();
        assert_eq!(finished.status, BuildStatus::Failed);
    }

    #[tokio::test]
    async fn a_failed_try_does_not_stop_the_next_step() {
        let store = Arc::new(MemoryStore::new());
        let build = build_fixture(&store).await;

        // the get inside the try blows up; the task after it still runs
        let container = Arc::new(FakeContainer::new("c1").with_task_exit(0));
        *container.get_result.lock().unwrap() = Some(Err(anyhow!("no such ref")));
        let engine = engine_with_worker(store.clone(), container);

        let plan = Plan::OnSuccess {
            step: Box::new(Plan::Try(Box::new(Plan::Get(GetPlan {
                name: "some-input".to_string(),
                resource: "some-input".to_string(),
                resource_type: "git".to_string(),
                pipeline: "some-pipeline".to_string(),
                version: Some(Version::from([("ref".to_string(), "abc".to_string())])),
                location: Some(Location {
                    id: 1,
                    ..Default::default()
                }),
                ..Default::default()
            })))),
            next: Box::new(task_plan("unit", 2)),
        };

        let handle = engine.create_build(&build, &plan).await.unwrap();
        handle.resume().await;

        let finished = store.get_build(build.id).await.unwrap().unwrap();
        assert_eq!(finished.status, BuildStatus::Succeeded);
    }

    #[tokio::test]
    async fn lookup_build_round_trips_through_engine_metadata() {
        let store = Arc::new(MemoryStore::new());
        let build = build_fixture(&store).await;
        let container = Arc::new(FakeContainer::new("c1").with_task_exit(0));
        let engine = engine_with_worker(store.clone(), container);

        engine
            .create_build(&build, &task_plan("unit", 1))
            .await
            .unwrap();

        let started = store.get_build(build.id).await.unwrap().unwrap();
        let handle = engine.lookup_build(&started).unwrap();
        handle.resume().await;

        let finished = store.get_build(build.id).await.unwrap().unwrap();
        assert_eq!(finished.status, BuildStatus::Succeeded);
    }

    #[tokio::test]
    async fn lookup_build_rejects_unparseable_metadata() {
        let store = Arc::new(MemoryStore::new());
        let container = Arc::new(FakeContainer::new("c1"));
        let engine = engine_with_worker(store, container);

        let build = Build {
            id: 7,
            name: "1".to_string(),
            job_name: Some("some-job".to_string()),
            pipeline_id: Some(1),
            pipeline_name: Some("some-pipeline".to_string()),
            team_name: "some-team".to_string(),
            status: BuildStatus::Started,
            engine: ENGINE_NAME.to_string(),
            engine_metadata: "not json".to_string(),
            start_time: None,
            end_time: None,
        };

        assert!(engine.lookup_build(&build).is_err());

        let foreign = Build {
            engine: "other".to_string(),
            ..build
        };
        assert!(engine.lookup_build(&foreign).is_err());
    }
}
