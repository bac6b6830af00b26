//! Pipeline runner lifecycle.

pub mod syncer;

pub use syncer::{PipelineRunner, PipelineRunnerFactory, Syncer};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use conveyor_core::SavedPipeline;
use conveyor_store::prelude::*;

use crate::scanner::{ResourceScanner, ScanRunner};
use crate::scheduler::Scheduler;

/// Production runner factory: one scan runner plus one scheduler loop per
/// pipeline, both stopping on the shared shutdown signal.
pub struct DefaultRunnerFactory {
    scheduler: Scheduler,
    scanner: ResourceScanner,
    store: Arc<dyn Store>,
    sync_interval: Duration,
}

impl DefaultRunnerFactory {
    pub fn new(
        scheduler: Scheduler,
        scanner: ResourceScanner,
        store: Arc<dyn Store>,
        sync_interval: Duration,
    ) -> Self {
        DefaultRunnerFactory {
            scheduler,
            scanner,
            store,
            sync_interval,
        }
    }
}

impl PipelineRunnerFactory for DefaultRunnerFactory {
    fn build(&self, pipeline: &SavedPipeline) -> PipelineRunner {
        let (shutdown, shutdown_rx) = watch::channel(false);

        let scan_runner = ScanRunner::new(
            self.scanner.clone(),
            self.store.clone(),
            pipeline.id,
            self.sync_interval,
        );
        let scheduler = self.scheduler.clone();
        let store = self.store.clone();
        let pipeline = pipeline.clone();
        let sync_interval = self.sync_interval;
        let mut scheduler_shutdown = shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let scans = tokio::spawn(scan_runner.run(shutdown_rx));

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(sync_interval) => {
                        // the pipeline may have paused or vanished since
                        // the last tick
                        match store
                            .get_pipeline_by_team_and_name(&pipeline.team_name, &pipeline.name)
                            .await
                        {
                            Ok(Some(current)) if !current.paused => {
                                scheduler.tick(&current).await;
                            }
                            Ok(_) => {}
                            Err(err) => {
                                tracing::error!(pipeline = %pipeline.name, error = %err, "failed to refresh pipeline");
                            }
                        }
                    }
                    _ = scheduler_shutdown.changed() => break,
                }
            }

            let _ = scans.await;
        });

        PipelineRunner { shutdown, handle }
    }
}
