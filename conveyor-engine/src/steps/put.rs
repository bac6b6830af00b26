//! Push the build's artifacts to a resource.

use anyhow::anyhow;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use conveyor_core::{
    ContainerIdentifier, ContainerMetadata, ContainerStage, ContainerType, PutPlan,
};

use crate::delegate::OutputDelegate;
use crate::signals::{signalled, Ready, Signals};
use crate::source_repository::SourceRepository;
use crate::step::{Step, Success, VersionInfo};
use crate::worker::{Client, ContainerSpec, ProcessIo, WorkerContainer};

/// The version a put produced, shared with its dependent get.
pub type VersionSlot = Arc<Mutex<Option<VersionInfo>>>;

pub struct PutStep {
    plan: PutPlan,
    build_id: i64,
    workers: Arc<dyn Client>,
    delegate: Arc<dyn OutputDelegate>,
    repo: Arc<SourceRepository>,
    slot: VersionSlot,
    container: Option<Arc<dyn WorkerContainer>>,
    succeeded: Option<bool>,
}

impl PutStep {
    pub fn new(
        plan: PutPlan,
        build_id: i64,
        workers: Arc<dyn Client>,
        delegate: Arc<dyn OutputDelegate>,
        repo: Arc<SourceRepository>,
        slot: VersionSlot,
    ) -> Self {
        PutStep {
            plan,
            build_id,
            workers,
            delegate,
            repo,
            slot,
            container: None,
            succeeded: None,
        }
    }

    fn plan_id(&self) -> u32 {
        self.plan.location.as_ref().map(|l| l.id).unwrap_or_default()
    }
}

#[async_trait]
impl Step for PutStep {
    async fn run(&mut self, signals: &mut Signals, mut ready: Ready) -> anyhow::Result<()> {
        self.delegate.initializing().await;

        let identifier =
            ContainerIdentifier::for_step(self.build_id, self.plan_id(), ContainerStage::Run);
        let metadata = ContainerMetadata {
            pipeline_name: self.plan.pipeline.clone(),
            step_name: self.plan.name.clone(),
            container_type: Some(ContainerType::Put),
            ..Default::default()
        };

        // a put consumes every artifact the build has produced so far
        let mut spec = ContainerSpec {
            resource_type: Some(self.plan.resource_type.clone()),
            ..Default::default()
        };
        for name in self.repo.names() {
            if let Some(source) = self.repo.get(&name) {
                spec.inputs.push((name, source));
            }
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

        let io = ProcessIo {
            stdout: self.delegate.stdout(),
            stderr: self.delegate.stderr(),
        };
        let push = container.run_put(&self.plan.source, self.plan.params.as_ref(), &io);

        tokio::select! {
            result = push => match result {
                Ok(pushed) => {
                    let info = VersionInfo {
                        version: pushed.version,
                        metadata: pushed.metadata,
                    };
                    *self.slot.lock().unwrap() = Some(info.clone());
                    self.delegate.completed(&info).await;
                    self.succeeded = Some(true);
                    Ok(())
                }
                Err(err) => {
                    self.delegate.failed(&err.to_string()).await;
                    Err(err)
                }
            },
            signal = signalled(signals) => Err(anyhow!("put interrupted by {signal:?}")),
        }
    }

    fn succeeded(&self) -> Option<Success> {
        self.succeeded.map(Success)
    }

    fn version_info(&self) -> Option<VersionInfo> {
        self.slot.lock().unwrap().clone()
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
    use crate::worker::ResourceResult;
    use conveyor_core::{Location, Version};

    #[tokio::test]
    async fn put_reports_the_created_version_and_fills_the_slot() {
        let created = Version::from([("thing".to_string(), "output-version".to_string())]);
        let container = Arc::new(FakeContainer::new("c1").with_put_result(ResourceResult {
            version: created.clone(),
            metadata: vec![],
        }));
        let worker = Arc::new(FakeWorker::new(container));
        let delegate = CapturingDelegate::new();
        let slot: VersionSlot = Arc::new(Mutex::new(None));

        let plan = PutPlan {
            name: "some-output".to_string(),
            resource: "some-output".to_string(),
            resource_type: "s3".to_string(),
            pipeline: "some-pipeline".to_string(),
            location: Some(Location {
                id: 5,
                ..Default::default()
            }),
            ..Default::default()
        };

        let mut step = PutStep::new(
            plan,
            42,
            worker.clone(),
            delegate.clone(),
            Arc::new(SourceRepository::new()),
            slot.clone(),
        );
        let (_handle, mut signals) = signal_channel();
        step.run(&mut signals, Ready::inert()).await.unwrap();

        assert_eq!(step.succeeded(), Some(Success(true)));
        assert_eq!(slot.lock().unwrap().as_ref().unwrap().version, created);
        assert_eq!(delegate.calls.lock().unwrap().completed.len(), 1);

        let identifiers = worker.requested_identifiers.lock().unwrap();
        assert_eq!(identifiers[0].stage, ContainerStage::Run);
        assert_eq!(identifiers[0].plan_id, Some(5));
    }
}
