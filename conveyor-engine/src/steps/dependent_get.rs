//! Re-fetch of a version just produced by a put.

use anyhow::anyhow;
use async_trait::async_trait;
use std::sync::Arc;

use conveyor_core::{
    ContainerIdentifier, ContainerMetadata, ContainerStage, ContainerType, DependentGetPlan,
};

use crate::delegate::OutputDelegate;
use crate::signals::{signalled, Ready, Signals};
use crate::source_repository::SourceRepository;
use crate::step::{Step, Success, VersionInfo};
use crate::steps::put::VersionSlot;
use crate::worker::{Client, ContainerSpec, ProcessIo, WorkerContainer};

/// Fetches exactly the version its sibling put pushed, so later steps
/// consume what was just produced.
pub struct DependentGetStep {
    plan: DependentGetPlan,
    build_id: i64,
    workers: Arc<dyn Client>,
    delegate: Arc<dyn OutputDelegate>,
    repo: Arc<SourceRepository>,
    slot: VersionSlot,
    container: Option<Arc<dyn WorkerContainer>>,
    result: Option<VersionInfo>,
    succeeded: Option<bool>,
}

impl DependentGetStep {
    pub fn new(
        plan: DependentGetPlan,
        build_id: i64,
        workers: Arc<dyn Client>,
        delegate: Arc<dyn OutputDelegate>,
        repo: Arc<SourceRepository>,
        slot: VersionSlot,
    ) -> Self {
        DependentGetStep {
            plan,
            build_id,
            workers,
            delegate,
            repo,
            slot,
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
impl Step for DependentGetStep {
    async fn run(&mut self, signals: &mut Signals, mut ready: Ready) -> anyhow::Result<()> {
        let version = self
            .slot
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("no version available from the preceding put"))?;

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
            Some(&version.version),
            &io,
        );

        tokio::select! {
            result = fetch => match result {
                Ok(fetched) => {
                    self.repo.register(&self.plan.name, container.artifact());

                    let info = VersionInfo {
                        version: fetched.version,
                        metadata: fetched.metadata,
                    };
                    self.delegate.completed(&info).await;
                    self.result = Some(info);
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
        self.result.clone()
    }

    async fn release(&mut self) {
        if let Some(container) = self.container.take() {
            container.release().await;
        }
    }
}
