//! Run a user task in a container.

use anyhow::anyhow;
use async_trait::async_trait;
use std::sync::Arc;

use conveyor_core::{
    ContainerIdentifier, ContainerMetadata, ContainerStage, ContainerType, TaskPlan,
};

use crate::delegate::TaskDelegate;
use crate::signals::{signalled, Ready, Signals};
use crate::source_repository::SourceRepository;
use crate::step::{ExitStatus, Step, Success};
use crate::task_config::{
    DeprecationConfigSource, FileConfigSource, MergedConfigSource, StaticConfigSource,
    TaskConfigSource, ValidatingConfigSource,
};
use crate::worker::{Client, ContainerSpec, ProcessIo, WorkerContainer};

pub struct TaskStep {
    plan: TaskPlan,
    build_id: i64,
    workers: Arc<dyn Client>,
    delegate: Arc<dyn TaskDelegate>,
    repo: Arc<SourceRepository>,
    container: Option<Arc<dyn WorkerContainer>>,
    exit_status: Option<i32>,
}

impl TaskStep {
    pub fn new(
        plan: TaskPlan,
        build_id: i64,
        workers: Arc<dyn Client>,
        delegate: Arc<dyn TaskDelegate>,
        repo: Arc<SourceRepository>,
    ) -> Self {
        TaskStep {
            plan,
            build_id,
            workers,
            delegate,
            repo,
            container: None,
            exit_status: None,
        }
    }

    fn plan_id(&self) -> u32 {
        self.plan.location.as_ref().map(|l| l.id).unwrap_or_default()
    }

    fn config_source(&self) -> anyhow::Result<Box<dyn TaskConfigSource>> {
        let source: Box<dyn TaskConfigSource> =
            match (&self.plan.config, &self.plan.config_path) {
                (Some(config), None) => Box::new(StaticConfigSource {
                    config: config.clone(),
                }),
                (None, Some(path)) => Box::new(FileConfigSource { path: path.clone() }),
                (Some(config), Some(path)) => {
                    let merged = MergedConfigSource {
                        a: Box::new(FileConfigSource { path: path.clone() }),
                        b: Box::new(StaticConfigSource {
                            config: config.clone(),
                        }),
                    };
                    if config.params.is_empty() {
                        Box::new(merged)
                    } else {
                        Box::new(DeprecationConfigSource {
                            inner: Box::new(merged),
                            stderr: self.delegate.stderr(),
                        })
                    }
                }
                (None, None) => {
                    return Err(anyhow!(
                        "task '{}' has neither a config nor a config file",
                        self.plan.name
                    ))
                }
            };

        Ok(Box::new(ValidatingConfigSource { inner: source }))
    }
}

#[async_trait]
impl Step for TaskStep {
    async fn run(&mut self, signals: &mut Signals, mut ready: Ready) -> anyhow::Result<()> {
        let config = match self.config_source()?.fetch_config(&self.repo).await {
            Ok(config) => config,
            Err(err) => {
                self.delegate.failed(&err.to_string()).await;
                return Err(err.into());
            }
        };

        self.delegate.initializing(&config).await;

        let identifier =
            ContainerIdentifier::for_step(self.build_id, self.plan_id(), ContainerStage::Run);
        let metadata = ContainerMetadata {
            pipeline_name: self.plan.pipeline.clone(),
            step_name: self.plan.name.clone(),
            container_type: Some(ContainerType::Task),
            ..Default::default()
        };

        let mut spec = ContainerSpec {
            image: config.image.clone(),
            privileged: self.plan.privileged,
            env: config
                .params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            ..Default::default()
        };
        for input in &config.inputs {
            let source = self.repo.get(&input.name).ok_or_else(|| {
                anyhow!("missing task input '{}': no artifact with that name", input.name)
            })?;
            spec.inputs.push((input.name.clone(), source));
        }

        let container = match self
            .workers
            .find_or_create_container(&identifier, &metadata, spec)
            .await
        {
            Ok(container) => container,
            Err(err) => {
                self.delegate.failed(&err.to_string()).await;
                return Err(err);
            }
        };
        self.container = Some(container.clone());

        ready.notify();
        self.delegate.started().await;

        let io = ProcessIo {
            stdout: self.delegate.stdout(),
            stderr: self.delegate.stderr(),
        };
        let process = container.run_task(&config, &io);

        tokio::select! {
            result = process => match result {
                Ok(exit_status) => {
                    self.exit_status = Some(exit_status);
                    self.repo.register(&self.plan.name, container.artifact());
                    self.delegate.finished(exit_status).await;
                    Ok(())
                }
                Err(err) => {
                    self.delegate.failed(&err.to_string()).await;
                    Err(err)
                }
            },
            signal = signalled(signals) => Err(anyhow!("task interrupted by {signal:?}")),
        }
    }

    fn succeeded(&self) -> Option<Success> {
        self.exit_status.map(|status| Success(status == 0))
    }

    fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status.map(ExitStatus)
    }

    async fn release(&mut self) {
        if let Some(container) = self.container.take() {
            container.release().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::test_support::CapturingDelegate;
    use crate::signals::signal_channel;
    use crate::worker::test_support::{FakeContainer, FakeWorker};
    use conveyor_core::{Location, TaskConfig, TaskRunConfig};

    fn plan_with(config: TaskConfig) -> TaskPlan {
        TaskPlan {
            name: "unit".to_string(),
            pipeline: "some-pipeline".to_string(),
            config: Some(config),
            location: Some(Location {
                id: 2,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn runnable_config() -> TaskConfig {
        TaskConfig {
            platform: "linux".to_string(),
            run: Some(TaskRunConfig {
                path: "make".to_string(),
                args: vec!["test".to_string()],
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn exit_zero_is_success() {
        let container = Arc::new(FakeContainer::new("c1").with_task_exit(0));
        let worker = Arc::new(FakeWorker::new(container));
        let delegate = CapturingDelegate::new();

        let mut step = TaskStep::new(
            plan_with(runnable_config()),
            42,
            worker,
            delegate.clone(),
            Arc::new(SourceRepository::new()),
        );
        let (_handle, mut signals) = signal_channel();
        step.run(&mut signals, Ready::inert()).await.unwrap();

        assert_eq!(step.succeeded(), Some(Success(true)));
        assert_eq!(step.exit_status(), Some(ExitStatus(0)));

        let calls = delegate.calls.lock().unwrap();
        assert_eq!(calls.initializing, 1);
        assert_eq!(calls.started, 1);
        assert_eq!(calls.finished, vec![0]);
    }

    #[tokio::test]
    async fn nonzero_exit_is_failure_not_error() {
        let container = Arc::new(FakeContainer::new("c1").with_task_exit(2));
        let worker = Arc::new(FakeWorker::new(container));

        let mut step = TaskStep::new(
            plan_with(runnable_config()),
            42,
            worker,
            CapturingDelegate::new(),
            Arc::new(SourceRepository::new()),
        );
        let (_handle, mut signals) = signal_channel();
        step.run(&mut signals, Ready::inert()).await.unwrap();

        assert_eq!(step.succeeded(), Some(Success(false)));
        assert_eq!(step.exit_status(), Some(ExitStatus(2)));
    }

    #[tokio::test]
    async fn invalid_config_errors_before_any_container_work() {
        let container = Arc::new(FakeContainer::new("c1"));
        let worker = Arc::new(FakeWorker::new(container));
        let delegate = CapturingDelegate::new();

        let mut step = TaskStep::new(
            plan_with(TaskConfig::default()),
            42,
            worker.clone(),
            delegate.clone(),
            Arc::new(SourceRepository::new()),
        );
        let (_handle, mut signals) = signal_channel();
        assert!(step.run(&mut signals, Ready::inert()).await.is_err());

        assert!(worker.requested_identifiers.lock().unwrap().is_empty());
        assert_eq!(delegate.calls.lock().unwrap().failed.len(), 1);
    }
}
