//! Worker fleet client.
//!
//! The control plane's whole view of the worker runtime: check a resource
//! for versions, and find-or-create containers to run resource actions and
//! tasks in. Finding before creating is what makes resumed builds
//! idempotent: a step re-attaching after a restart gets its existing
//! container back by identifier.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use conveyor_core::{
    ContainerIdentifier, ContainerMetadata, MetadataField, Params, Source, TaskConfig, Version,
};

use crate::delegate::LogSink;
use crate::source_repository::ArtifactSource;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("no workers available")]
    NoWorkersAvailable,
}

/// Everything a container needs at creation time.
#[derive(Default)]
pub struct ContainerSpec {
    pub resource_type: Option<String>,
    pub image: Option<String>,
    pub privileged: bool,
    pub env: Vec<(String, String)>,
    /// Artifacts to mount into the container, by input name.
    pub inputs: Vec<(String, Arc<dyn ArtifactSource>)>,
}

/// Output streams for a process running in a container.
#[derive(Clone)]
pub struct ProcessIo {
    pub stdout: Arc<dyn LogSink>,
    pub stderr: Arc<dyn LogSink>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResourceResult {
    pub version: Version,
    pub metadata: Vec<MetadataField>,
}

#[async_trait]
pub trait WorkerContainer: Send + Sync {
    fn handle(&self) -> String;

    async fn run_get(
        &self,
        source: &Source,
        params: Option<&Params>,
        version: Option<&Version>,
        io: &ProcessIo,
    ) -> anyhow::Result<ResourceResult>;

    async fn run_put(
        &self,
        source: &Source,
        params: Option<&Params>,
        io: &ProcessIo,
    ) -> anyhow::Result<ResourceResult>;

    async fn run_task(&self, config: &TaskConfig, io: &ProcessIo) -> anyhow::Result<i32>;

    /// The container's working directory as a consumable artifact.
    fn artifact(&self) -> Arc<dyn ArtifactSource>;

    async fn release(&self);
}

#[async_trait]
pub trait Client: Send + Sync {
    fn name(&self) -> String;

    /// Ordered versions of the resource strictly after `from`.
    async fn check(
        &self,
        resource_type: &str,
        source: &Source,
        from: Option<Version>,
    ) -> anyhow::Result<Vec<Version>>;

    async fn find_or_create_container(
        &self,
        identifier: &ContainerIdentifier,
        metadata: &ContainerMetadata,
        spec: ContainerSpec,
    ) -> anyhow::Result<Arc<dyn WorkerContainer>>;
}

/// In-process registry of attached workers, itself usable as a client.
pub struct Pool {
    workers: RwLock<Vec<Arc<dyn Client>>>,
    next: AtomicUsize,
}

impl Pool {
    pub fn new() -> Self {
        Pool {
            workers: RwLock::new(Vec::new()),
            next: AtomicUsize::new(0),
        }
    }

    pub fn register(&self, worker: Arc<dyn Client>) {
        self.workers.write().unwrap().push(worker);
    }

    pub fn worker_count(&self) -> usize {
        self.workers.read().unwrap().len()
    }

    fn pick(&self) -> anyhow::Result<Arc<dyn Client>> {
        let workers = self.workers.read().unwrap();
        if workers.is_empty() {
            return Err(WorkerError::NoWorkersAvailable.into());
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % workers.len();
        Ok(workers[index].clone())
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Client for Pool {
    fn name(&self) -> String {
        "pool".to_string()
    }

    async fn check(
        &self,
        resource_type: &str,
        source: &Source,
        from: Option<Version>,
    ) -> anyhow::Result<Vec<Version>> {
        self.pick()?.check(resource_type, source, from).await
    }

    async fn find_or_create_container(
        &self,
        identifier: &ContainerIdentifier,
        metadata: &ContainerMetadata,
        spec: ContainerSpec,
    ) -> anyhow::Result<Arc<dyn WorkerContainer>> {
        self.pick()?
            .find_or_create_container(identifier, metadata, spec)
            .await
    }
}
