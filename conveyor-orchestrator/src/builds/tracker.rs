//! Build tracker.
//!
//! At startup and on a timer, re-attaches the engine to every started
//! build so nothing is orphaned by a process restart. Safe to run
//! repeatedly: the tracking lease spaces out re-attachment, and engine
//! steps find their existing containers rather than starting over.

use std::sync::Arc;
use std::time::Duration;

use conveyor_engine::Engine;
use conveyor_store::prelude::*;

const TRACKING_LEASE_TTL: Duration = Duration::from_secs(10);

pub struct Tracker {
    store: Arc<dyn Store>,
    engine: Arc<dyn Engine>,
}

impl Tracker {
    pub fn new(store: Arc<dyn Store>, engine: Arc<dyn Engine>) -> Self {
        Tracker { store, engine }
    }

    pub async fn track(&self) {
        let builds = match self.store.get_all_started_builds().await {
            Ok(builds) => builds,
            Err(err) => {
                tracing::error!(error = %err, "failed to list started builds");
                return;
            }
        };

        for build in builds {
            let lease = match self
                .store
                .lease_build_tracking(build.id, TRACKING_LEASE_TTL)
                .await
            {
                Ok(Some(lease)) => lease,
                Ok(None) => continue,
                Err(err) => {
                    tracing::error!(build_id = build.id, error = %err, "failed to acquire tracking lease");
                    continue;
                }
            };

            match self.engine.lookup_build(&build) {
                Ok(handle) => {
                    tracing::debug!(build_id = build.id, "resuming in-flight build");
                    tokio::spawn(async move {
                        handle.resume().await;
                        drop(lease);
                    });
                }
                Err(err) => {
                    tracing::warn!(build_id = build.id, error = %err, "could not re-attach to build");
                    if let Err(err) = self.store.error_build(build.id, &err.to_string()).await {
                        tracing::error!(build_id = build.id, error = %err, "failed to mark build as errored");
                    }
                    drop(lease);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use conveyor_core::{Build, BuildStatus, Config, JobConfig, Plan};
    use conveyor_engine::EngineBuild;
    use conveyor_store::memory::MemoryStore;
    use conveyor_store::PausedState;
    use std::sync::Mutex;

    struct FakeEngine {
        resumed: Arc<Mutex<Vec<i64>>>,
        fail_lookup: bool,
    }

    #[async_trait]
    impl Engine for FakeEngine {
        async fn create_build(
            &self,
            _build: &Build,
            _plan: &Plan,
        ) -> anyhow::Result<Box<dyn EngineBuild>> {
            unreachable!("the tracker never creates builds")
        }

        fn lookup_build(&self, build: &Build) -> anyhow::Result<Box<dyn EngineBuild>> {
            if self.fail_lookup {
                return Err(anyhow!("nope"));
            }
            Ok(Box::new(FakeEngineBuild {
                build_id: build.id,
                resumed: self.resumed.clone(),
            }))
        }
    }

    struct FakeEngineBuild {
        build_id: i64,
        resumed: Arc<Mutex<Vec<i64>>>,
    }

    #[async_trait]
    impl EngineBuild for FakeEngineBuild {
        async fn resume(self: Box<Self>) {
            self.resumed.lock().unwrap().push(self.build_id);
        }

        async fn abort(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    async fn started_builds(store: &Arc<MemoryStore>, count: usize) -> Vec<i64> {
        store.save_team("some-team").await.unwrap();
        let config = Config {
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

        let mut ids = Vec::new();
        for _ in 0..count {
            let build = store
                .create_job_build(pipeline.id, "some-job")
                .await
                .unwrap();
            store.start_build(build.id, "exec", "{}").await.unwrap();
            ids.push(build.id);
        }
        ids
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn resumes_every_started_build_once() {
        let store = Arc::new(MemoryStore::new());
        let ids = started_builds(&store, 3).await;

        let resumed = Arc::new(Mutex::new(Vec::new()));
        let engine = Arc::new(FakeEngine {
            resumed: resumed.clone(),
            fail_lookup: false,
        });
        let tracker = Tracker::new(store, engine);

        tracker.track().await;

        let expect = ids.clone();
        let check = resumed.clone();
        wait_for(move || {
            let resumed = check.lock().unwrap();
            expect.iter().all(|id| resumed.contains(id))
        })
        .await;

        // the tracking lease makes an immediate re-track a no-op
        tracker.track().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(resumed.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unresumable_builds_are_errored_in_order() {
        let store = Arc::new(MemoryStore::new());
        let ids = started_builds(&store, 3).await;

        let engine = Arc::new(FakeEngine {
            resumed: Arc::new(Mutex::new(Vec::new())),
            fail_lookup: true,
        });
        let tracker = Tracker::new(store.clone(), engine);

        tracker.track().await;

        for id in ids {
            let build = store.get_build(id).await.unwrap().unwrap();
            assert_eq!(build.status, BuildStatus::Errored);

            // the lookup error is on the event stream
            let mut cursor = store.get_build_events(id, 0).await.unwrap();
            let mut saw_error = false;
            while let Ok(event) = cursor.next().await {
                if matches!(event, conveyor_core::Event::Error { ref message, .. } if message.contains("nope"))
                {
                    saw_error = true;
                }
            }
            assert!(saw_error);
        }
    }
}
