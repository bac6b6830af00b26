//! Per-build scheduling decisions.

use std::sync::Arc;

use conveyor_core::{
    job_inputs, Build, BuildInput, BuildPreparation, BuildStatus, JobConfig, PreparationStatus,
    SavedPipeline,
};
use conveyor_store::algorithm::VersionsDb;
use conveyor_store::prelude::*;

use crate::scanner::ResourceScanner;
use crate::scheduler::resolve_build_inputs;

pub const REASON_CAN_BE_SCHEDULED: &str = "can-be-scheduled";
pub const REASON_JOB_PAUSED: &str = "job-paused";
pub const REASON_BUILD_NOT_PENDING: &str = "build-not-pending";
pub const REASON_MAX_IN_FLIGHT: &str = "max-in-flight-reached";
pub const REASON_NO_INPUT_VERSIONS: &str = "no-input-versions-available";
pub const REASON_FAILED_TO_SCAN: &str = "failed-to-scan";

/// A scheduling failure with the reason the scheduler should act on.
#[derive(Debug)]
pub struct SchedulingError {
    pub reason: &'static str,
    pub source: anyhow::Error,
}

pub struct JobService {
    store: Arc<dyn Store>,
    scanner: ResourceScanner,
}

impl JobService {
    pub fn new(store: Arc<dyn Store>, scanner: ResourceScanner) -> Self {
        JobService { store, scanner }
    }

    /// Decides whether a pending build can move to scheduled, resolving
    /// its input versions along the way and keeping the user-visible
    /// preparation flags current.
    ///
    /// When no versions snapshot is supplied (the manual-trigger path),
    /// every input resource is scanned first so the decision sees the
    /// freshest versions.
    pub async fn can_build_be_scheduled(
        &self,
        pipeline: &SavedPipeline,
        build: &Build,
        prep: &mut BuildPreparation,
        versions: Option<&VersionsDb>,
        job: &JobConfig,
    ) -> Result<(Vec<BuildInput>, bool, &'static str), SchedulingError> {
        if job.paused {
            prep.paused_job = PreparationStatus::Blocking;
            self.save_prep(prep).await;
            return Ok((vec![], false, REASON_JOB_PAUSED));
        }
        prep.paused_job = PreparationStatus::NotBlocking;

        if build.status != BuildStatus::Pending {
            return Ok((vec![], false, REASON_BUILD_NOT_PENDING));
        }

        if job.serial || !job.serial_groups.is_empty() {
            let running = self
                .store
                .get_running_builds_of_job(pipeline.id, &job.name)
                .await
                .map_err(|err| SchedulingError {
                    reason: REASON_MAX_IN_FLIGHT,
                    source: err.into(),
                })?;
            if !running.is_empty() {
                prep.max_running_builds = PreparationStatus::Blocking;
                self.save_prep(prep).await;
                return Ok((vec![], false, REASON_MAX_IN_FLIGHT));
            }
        }
        prep.max_running_builds = PreparationStatus::NotBlocking;

        let inputs = job_inputs(job);
        if inputs.is_empty() {
            self.save_prep(prep).await;
            return Ok((vec![], true, REASON_CAN_BE_SCHEDULED));
        }

        let loaded;
        let snapshot = match versions {
            Some(snapshot) => snapshot,
            None => {
                // catch up on every input resource before deciding
                for input in &inputs {
                    self.scanner
                        .scan_now(pipeline.id, &input.resource)
                        .await
                        .map_err(|err| SchedulingError {
                            reason: REASON_FAILED_TO_SCAN,
                            source: err,
                        })?;
                }
                loaded = self
                    .store
                    .load_versions_db(pipeline.id)
                    .await
                    .map_err(|err| SchedulingError {
                        reason: REASON_NO_INPUT_VERSIONS,
                        source: err.into(),
                    })?;
                &loaded
            }
        };

        let resolved = resolve_build_inputs(&self.store, snapshot, job)
            .await
            .map_err(|err| SchedulingError {
                reason: REASON_NO_INPUT_VERSIONS,
                source: err,
            })?;

        match resolved {
            Some(build_inputs) => {
                for input in &inputs {
                    prep.inputs
                        .insert(input.name.clone(), PreparationStatus::NotBlocking);
                }
                self.save_prep(prep).await;
                Ok((build_inputs, true, REASON_CAN_BE_SCHEDULED))
            }
            None => {
                for input in &inputs {
                    prep.inputs
                        .insert(input.name.clone(), PreparationStatus::Blocking);
                }
                self.save_prep(prep).await;
                Ok((vec![], false, REASON_NO_INPUT_VERSIONS))
            }
        }
    }

    async fn save_prep(&self, prep: &BuildPreparation) {
        if let Err(err) = self.store.update_build_preparation(prep).await {
            tracing::warn!(build_id = prep.build_id, error = %err, "failed to update build preparation");
        }
    }
}
