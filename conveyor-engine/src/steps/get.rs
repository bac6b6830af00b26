//! Fetch a resource version into the build.

use anyhow::anyhow;
use async_trait::async_trait;
use std::sync::Arc;

use conveyor_core::{
    ContainerIdentifier, ContainerMetadata, ContainerStage, ContainerType, GetPlan,
};

use crate::delegate::GetDelegate;
use crate::signals::{signalled, Ready, Signals};
use crate::source_repository::SourceRepository;
use crate::step::{Step, Success, VersionInfo};
use crate::worker::{Client, ContainerSpec, ProcessIo, ResourceResult, WorkerContainer};

pub struct GetStep {
    plan: GetPlan,
    build_id: i64,
    workers: Arc<dyn Client>,
    delegate: Arc<dyn GetDelegate>,
    repo: Arc<SourceRepository>,
    container: Option<Arc<dyn WorkerContainer>>,
    result: Option<ResourceResult>,
    succeeded: Option<bool>,
}

impl GetStep {
    pub fn new(
        plan: GetPlan,
        build_id: i64,
        workers: Arc<dyn Client>,
        delegate: Arc<dyn GetDelegate>,
        repo: Arc<SourceRepository>,
    ) -> Self {
        GetStep {
            plan,
            build_id,
            workers,
            delegate,
            repo,
            container: None,
            result: None,
            succeeded: None,
        }
    }

    fn plan_id(&self) -> u32 {
        self.plan.location.as_ref().map(|l| l.id).unwrap_or_default()
    }
}

#[async_trait]
impl Step for GetStep {
    async fn run(&mut self, signals: &mut Signals, mut ready: Ready) -> anyhow::Result<()> {
        self.delegate.initializing().await;

        let identifier =
            ContainerIdentifier::for_step(self.build_id, self.plan_id(), ContainerStage::Get);
        let metadata = ContainerMetadata {
            pipeline_name: self.plan.pipeline.clone(),
            step_name: self.plan.name.clone(),
            container_type: Some(ContainerType::Get),
            ..Default::default()
        };
        let spec = ContainerSpec {
            resource_type: Some(self.plan.resource_type.clone()),
            ..Default::default()
        };

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

        let io = ProcessIo {
            stdout: self.delegate.stdout(),
            stderr: self.delegate.stderr(),
        };

        let fetch = container.run_get(
            &self.plan.source,
            self.plan.params.as_ref(),
            self.plan.version.as_ref(),
            &io,
        );

        tokio::select! {
            result = fetch => match result {
                Ok(fetched) => {
                    self.repo.register(&self.plan.name, container.artifact());

                    let info = VersionInfo {
                        version: fetched.version.clone(),
                        metadata: fetched.metadata.clone(),
                    };
                    self.delegate.completed(&info).await;

                    self.result = Some(fetched);
                    self.succeeded = Some(true);
                    Ok(())
                }
                Err(err) => {
                    self.delegate.failed(&err.to_string()).await;
                    Err(err)
                }
            },
            signal = signalled(signals) => Err(anyhow!("get interrupted by {signal:?}")),
        }
    }

    fn succeeded(&self) -> Option<Success> {
        self.succeeded.map(Success)
    }

    fn version_info(&self) -> Option<VersionInfo> {
        self.result.as_ref().map(|r| VersionInfo {
            version: r.version.clone(),
            metadata: r.metadata.clone(),
        })
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
    use conveyor_core::{Location, Version};

    fn plan() -> GetPlan {
        GetPlan {
            name: "some-input".to_string(),
            resource: "some-resource".to_string(),
            resource_type: "git".to_string(),
            pipeline: "some-pipeline".to_string(),
            version: Some(Version::from([("ref".to_string(), "abc".to_string())])),
            location: Some(Location {
                id: 3,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fetches_the_pinned_version_and_registers_the_artifact() {
        let container = Arc::new(FakeContainer::new("c1").with_get_result(ResourceResult {
            version: Version::from([("ref".to_string(), "abc".to_string())]),
            metadata: vec![],
        }));
        let worker = Arc::new(FakeWorker::new(container.clone()));
        let delegate = CapturingDelegate::new();
        let repo = Arc::new(SourceRepository::new());

        let mut step = GetStep::new(plan(), 42, worker.clone(), delegate.clone(), repo.clone());
        let (_handle, mut signals) = signal_channel();
        let (ready, ready_rx) = Ready::new();
        step.run(&mut signals, ready).await.unwrap();

        // container identity carries the build, plan id, and get stage
        let identifiers = worker.requested_identifiers.lock().unwrap();
        assert_eq!(identifiers.len(), 1);
        assert_eq!(identifiers[0].build_id, Some(42));
        assert_eq!(identifiers[0].plan_id, Some(3));
        assert_eq!(identifiers[0].stage, ContainerStage::Get);

        // the pinned version was requested
        let versions = container.ran_get_versions.lock().unwrap();
        assert_eq!(
            versions[0],
            Some(Version::from([("ref".to_string(), "abc".to_string())]))
        );

        assert_eq!(step.succeeded(), Some(Success(true)));
        assert!(repo.get("some-input").is_some());
        assert_eq!(delegate.calls.lock().unwrap().completed.len(), 1);
        ready_rx.await.unwrap();

        step.release().await;
        assert!(*container.released.lock().unwrap());
    }

    #[tokio::test]
    async fn fetch_errors_reach_the_delegate() {
        let container = Arc::new(FakeContainer::new("c1"));
        *container.get_result.lock().unwrap() = Some(Err(anyhow!("worker lost the volume")));
        let worker = Arc::new(FakeWorker::new(container));
        let delegate = CapturingDelegate::new();

        let mut step = GetStep::new(
            plan(),
            42,
            worker,
            delegate.clone(),
            Arc::new(SourceRepository::new()),
        );
        let (_handle, mut signals) = signal_channel();
        assert!(step.run(&mut signals, Ready::inert()).await.is_err());
        assert_eq!(step.succeeded(), None);
        assert_eq!(delegate.calls.lock().unwrap().failed.len(), 1);
    }
}
