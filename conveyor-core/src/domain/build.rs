//! Build records and the build status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::resource::{MetadataField, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Scheduled,
    Started,
    Succeeded,
    Failed,
    Errored,
    Aborted,
}

impl BuildStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildStatus::Succeeded
                | BuildStatus::Failed
                | BuildStatus::Errored
                | BuildStatus::Aborted
        )
    }

    /// Whether `next` is a legal successor. Statuses only move forward:
    /// pending → scheduled → started → terminal, and nothing leaves a
    /// terminal state.
    pub fn can_transition_to(self, next: BuildStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            BuildStatus::Pending => false,
            BuildStatus::Scheduled => self == BuildStatus::Pending,
            BuildStatus::Started => {
                matches!(self, BuildStatus::Pending | BuildStatus::Scheduled)
            }
            _ => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Scheduled => "scheduled",
            BuildStatus::Started => "started",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
            BuildStatus::Errored => "errored",
            BuildStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BuildStatus::Pending),
            "scheduled" => Ok(BuildStatus::Scheduled),
            "started" => Ok(BuildStatus::Started),
            "succeeded" => Ok(BuildStatus::Succeeded),
            "failed" => Ok(BuildStatus::Failed),
            "errored" => Ok(BuildStatus::Errored),
            "aborted" => Ok(BuildStatus::Aborted),
            other => Err(format!("unknown build status '{other}'")),
        }
    }
}

/// One execution of a job, or a one-off plan.
///
/// `name` is the job-scoped build number shown to users; one-off builds
/// have no pipeline or job and are numbered globally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_name: Option<String>,
    pub team_name: String,
    pub status: BuildStatus,
    /// Name of the engine driving the build, empty until started.
    #[serde(default)]
    pub engine: String,
    /// Engine-owned serialized state (the execution plan).
    #[serde(default)]
    pub engine_metadata: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl Build {
    pub fn is_one_off(&self) -> bool {
        self.job_name.is_none()
    }
}

/// A version consumed by a build, recorded per input name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildInput {
    pub name: String,
    pub resource: String,
    pub version: Version,
    #[serde(default)]
    pub metadata: Vec<MetadataField>,
    /// True the first time this version is used by this job.
    #[serde(default)]
    pub first_occurrence: bool,
}

/// A version produced (or re-fetched) by a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildOutput {
    pub resource: String,
    pub version: Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreparationStatus {
    Unknown,
    Blocking,
    NotBlocking,
}

/// User-visible readiness flags for a pending build: what is holding it
/// up, per concern and per input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildPreparation {
    pub build_id: i64,
    pub paused_pipeline: PreparationStatus,
    pub paused_job: PreparationStatus,
    pub max_running_builds: PreparationStatus,
    pub inputs: BTreeMap<String, PreparationStatus>,
}

impl BuildPreparation {
    pub fn new(build_id: i64) -> Self {
        BuildPreparation {
            build_id,
            paused_pipeline: PreparationStatus::Unknown,
            paused_job: PreparationStatus::Unknown,
            max_running_builds: PreparationStatus::Unknown,
            inputs: BTreeMap::new(),
        }
    }
}
