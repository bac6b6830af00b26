//! Pipeline syncer.
//!
//! Mirrors the set of unpaused pipelines onto a set of live runners: at
//! steady state they are equal, and no pipeline ever has two runners.
//! Stopped pipelines get their pending builds' preparation flags reset so
//! users see why nothing is happening.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use conveyor_core::SavedPipeline;
use conveyor_store::prelude::*;

pub struct PipelineRunner {
    pub shutdown: watch::Sender<bool>,
    pub handle: tokio::task::JoinHandle<()>,
}

pub trait PipelineRunnerFactory: Send + Sync {
    fn build(&self, pipeline: &SavedPipeline) -> PipelineRunner;
}

pub struct Syncer {
    store: Arc<dyn Store>,
    factory: Box<dyn PipelineRunnerFactory>,
    running: HashMap<i64, PipelineRunner>,
}

impl Syncer {
    pub fn new(store: Arc<dyn Store>, factory: Box<dyn PipelineRunnerFactory>) -> Self {
        Syncer {
            store,
            factory,
            running: HashMap::new(),
        }
    }

    pub fn running_pipelines(&self) -> Vec<i64> {
        self.running.keys().copied().collect()
    }

    pub async fn sync(&mut self) {
        let pipelines = match self.store.get_all_pipelines().await {
            Ok(pipelines) => pipelines,
            Err(err) => {
                tracing::error!(error = %err, "failed to get pipelines");
                return;
            }
        };

        // drop crashed runners so they restart below
        let crashed: Vec<i64> = self
            .running
            .iter()
            .filter(|(_, runner)| runner.handle.is_finished())
            .map(|(&id, _)| id)
            .collect();
        for id in crashed {
            tracing::debug!(pipeline_id = id, "pipeline runner exited");
            self.running.remove(&id);
        }

        // stop runners whose pipeline is gone or paused
        let stopped: Vec<i64> = self
            .running
            .keys()
            .filter(|id| {
                !pipelines
                    .iter()
                    .any(|pipeline| pipeline.id == **id && !pipeline.paused)
            })
            .copied()
            .collect();
        for id in stopped {
            tracing::debug!(pipeline_id = id, "stopping pipeline runner");
            if let Some(runner) = self.running.remove(&id) {
                let _ = runner.shutdown.send(true);
                if let Err(err) = runner.handle.await {
                    tracing::warn!(pipeline_id = id, error = %err, "pipeline runner task failed");
                }
            }

            if let Err(err) = self
                .store
                .reset_build_preparations_with_pipeline_paused(id)
                .await
            {
                tracing::error!(pipeline_id = id, error = %err, "failed to reset build preparations");
            }
        }

        // start runners for active pipelines that have none
        for pipeline in &pipelines {
            if pipeline.paused || self.running.contains_key(&pipeline.id) {
                continue;
            }
            tracing::debug!(pipeline = %pipeline.name, "starting pipeline runner");
            self.running
                .insert(pipeline.id, self.factory.build(pipeline));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::{BuildStatus, Config, PreparationStatus};
    use conveyor_store::memory::MemoryStore;
    use conveyor_store::PausedState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingFactory {
        built: AtomicUsize,
        built_for: Mutex<Vec<i64>>,
    }

    impl CountingFactory {
        fn new() -> Arc<Self> {
            Arc::new(CountingFactory {
                built: AtomicUsize::new(0),
                built_for: Mutex::new(Vec::new()),
            })
        }
    }

    struct SharedFactory(Arc<CountingFactory>);

    impl PipelineRunnerFactory for SharedFactory {
        fn build(&self, pipeline: &SavedPipeline) -> PipelineRunner {
            self.0.built.fetch_add(1, Ordering::SeqCst);
            self.0.built_for.lock().unwrap().push(pipeline.id);

            let (shutdown, mut shutdown_rx) = watch::channel(false);
            let handle = tokio::spawn(async move {
                let _ = shutdown_rx.changed().await;
            });
            PipelineRunner { shutdown, handle }
        }
    }

    async fn save_pipeline(store: &MemoryStore, name: &str, paused: PausedState) -> SavedPipeline {
        let (pipeline, _) = store
            .save_config("some-team", name, &Config::default(), 0, paused)
            .await
            .unwrap();
        pipeline
    }

    #[tokio::test]
    async fn sync_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        store.save_team("some-team").await.unwrap();
        save_pipeline(&store, "pipeline-a", PausedState::Unpaused).await;
        save_pipeline(&store, "pipeline-b", PausedState::Unpaused).await;

        let factory = CountingFactory::new();
        let mut syncer = Syncer::new(store.clone(), Box::new(SharedFactory(factory.clone())));

        syncer.sync().await;
        syncer.sync().await;

        assert_eq!(factory.built.load(Ordering::SeqCst), 2);
        assert_eq!(syncer.running_pipelines().len(), 2);
    }

    #[tokio::test]
    async fn paused_pipelines_never_get_runners() {
        let store = Arc::new(MemoryStore::new());
        store.save_team("some-team").await.unwrap();
        save_pipeline(&store, "active", PausedState::Unpaused).await;
        save_pipeline(&store, "dormant", PausedState::Paused).await;

        let factory = CountingFactory::new();
        let mut syncer = Syncer::new(store.clone(), Box::new(SharedFactory(factory.clone())));

        syncer.sync().await;

        assert_eq!(factory.built.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pausing_stops_the_runner_and_resets_preparations() {
        let store = Arc::new(MemoryStore::new());
        store.save_team("some-team").await.unwrap();
        let pipeline = save_pipeline(&store, "some-pipeline", PausedState::Unpaused).await;

        // a pending build whose preparation should be reset on pause
        let config = Config {
            jobs: vec![conveyor_core::JobConfig {
                name: "some-job".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        store
            .save_config("some-team", "some-pipeline", &config, 1, PausedState::NoChange)
            .await
            .unwrap();
        let build = store
            .create_job_build(pipeline.id, "some-job")
            .await
            .unwrap();
        assert_eq!(build.status, BuildStatus::Pending);

        let factory = CountingFactory::new();
        let mut syncer = Syncer::new(store.clone(), Box::new(SharedFactory(factory.clone())));

        syncer.sync().await;
        assert_eq!(syncer.running_pipelines(), vec![pipeline.id]);

        store.set_pipeline_paused(pipeline.id, true).await.unwrap();
        syncer.sync().await;

        assert!(syncer.running_pipelines().is_empty());
        let prep = store
            .get_build_preparation(build.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(prep.paused_pipeline, PreparationStatus::Blocking);
    }

    #[tokio::test]
    async fn crashed_runners_are_restarted() {
        let store = Arc::new(MemoryStore::new());
        store.save_team("some-team").await.unwrap();
        save_pipeline(&store, "some-pipeline", PausedState::Unpaused).await;

        let factory = CountingFactory::new();
        let mut syncer = Syncer::new(store.clone(), Box::new(SharedFactory(factory.clone())));

        syncer.sync().await;
        assert_eq!(factory.built.load(Ordering::SeqCst), 1);

        // crash the runner
        for id in syncer.running_pipelines() {
            let runner = syncer.running.get(&id).unwrap();
            let _ = runner.shutdown.send(true);
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        syncer.sync().await;
        assert_eq!(factory.built.load(Ordering::SeqCst), 2);
    }
}
