//! Worker container identity.
//!
//! A container is addressed two ways: by its globally unique handle, and
//! by a compound identifier describing what it is for. Step containers
//! belong to a build's plan step; check containers belong to a resource.
//! Partial identifiers are construction bugs, not query wildcards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::plan::PlanId;
use super::resource::Source;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStage {
    #[default]
    Check,
    Get,
    Run,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerType {
    Check,
    Get,
    Put,
    Task,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("insufficient container identifier: {0}")]
    Invalid(String),
    #[error("multiple containers found for identifier")]
    Multiple,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerIdentifier {
    // step container identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<PlanId>,

    // check container identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_source: Option<Source>,

    // optional image-resource refinement for step containers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_resource_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_resource_source: Option<Source>,

    pub stage: ContainerStage,
}

impl ContainerIdentifier {
    pub fn for_step(build_id: i64, plan_id: PlanId, stage: ContainerStage) -> Self {
        ContainerIdentifier {
            build_id: Some(build_id),
            plan_id: Some(plan_id),
            stage,
            ..Default::default()
        }
    }

    pub fn for_check(resource_id: i64, check_type: String, check_source: Source) -> Self {
        ContainerIdentifier {
            resource_id: Some(resource_id),
            check_type: Some(check_type),
            check_source: Some(check_source),
            stage: ContainerStage::Check,
            ..Default::default()
        }
    }

    fn is_step(&self) -> bool {
        self.build_id.is_some() && self.plan_id.is_some()
    }

    fn is_check(&self) -> bool {
        self.resource_id.is_some() && self.check_type.is_some() && self.check_source.is_some()
    }

    /// An identifier must carry exactly one complete identity.
    pub fn validate(&self) -> Result<(), IdentifierError> {
        match (self.is_step(), self.is_check()) {
            (true, false) | (false, true) => Ok(()),
            (true, true) => Err(IdentifierError::Invalid(
                "both step and check identity present".to_string(),
            )),
            (false, false) => Err(IdentifierError::Invalid(
                "neither step nor check identity is complete".to_string(),
            )),
        }
    }

    /// Whether a stored identifier matches this query identifier.
    pub fn matches(&self, other: &ContainerIdentifier) -> bool {
        self.build_id == other.build_id
            && self.plan_id == other.plan_id
            && self.resource_id == other.resource_id
            && self.check_type == other.check_type
            && self.check_source == other.check_source
            && self.image_resource_type == other.image_resource_type
            && self.image_resource_source == other.image_resource_source
            && self.stage == other.stage
    }
}

/// Searchable facts about a container, not part of its identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    #[serde(default)]
    pub pipeline_name: String,
    #[serde(default)]
    pub job_name: String,
    #[serde(default)]
    pub step_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_type: Option<ContainerType>,
    #[serde(default)]
    pub worker_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub handle: String,
    pub identifier: ContainerIdentifier,
    pub metadata: ContainerMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_identifier_validates() {
        let id = ContainerIdentifier::for_step(42, 1, ContainerStage::Run);
        assert!(id.validate().is_ok());
    }

    #[test]
    fn check_identifier_validates() {
        let id = ContainerIdentifier::for_check(7, "git".to_string(), Source::new());
        assert!(id.validate().is_ok());
    }

    #[test]
    fn partial_identifier_is_invalid() {
        let id = ContainerIdentifier {
            build_id: Some(42),
            stage: ContainerStage::Run,
            ..Default::default()
        };
        assert!(matches!(id.validate(), Err(IdentifierError::Invalid(_))));

        let id = ContainerIdentifier {
            resource_id: Some(7),
            check_type: Some("git".to_string()),
            stage: ContainerStage::Check,
            ..Default::default()
        };
        assert!(matches!(id.validate(), Err(IdentifierError::Invalid(_))));
    }
}
