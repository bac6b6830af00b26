//! Executable build plans.
//!
//! The build factory compiles a job's declarative `PlanConfig` tree into
//! this form. The plan is serialized as the build's engine metadata and
//! re-parsed when a build is resumed, so the shapes here are wire-stable.

use serde::{Deserialize, Serialize};

use super::resource::{Params, Source, Version};
use super::task::TaskConfig;

/// Identifier of a step within one build's plan. Dense, assigned by the
/// build factory in pre-order.
pub type PlanId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepHook {
    Success,
    Failure,
    Ensure,
}

/// Positional identity of a step: where it sits in the tree, which
/// parallel/serial group it belongs to, and whether it hangs off a hook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: PlanId,
    pub parent_id: PlanId,
    #[serde(default)]
    pub parallel_group: PlanId,
    #[serde(default)]
    pub serial_group: PlanId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<StepHook>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    Aggregate(Vec<Plan>),
    Get(GetPlan),
    Put(PutPlan),
    DependentGet(DependentGetPlan),
    Task(TaskPlan),
    OnSuccess {
        step: Box<Plan>,
        next: Box<Plan>,
    },
    OnFailure {
        step: Box<Plan>,
        next: Box<Plan>,
    },
    Ensure {
        step: Box<Plan>,
        next: Box<Plan>,
    },
    Try(Box<Plan>),
    Timeout {
        duration: String,
        step: Box<Plan>,
    },
}

impl Plan {
    /// Location of the plan's entry step, when it has one.
    pub fn location(&self) -> Option<&Location> {
        match self {
            Plan::Get(get) => get.location.as_ref(),
            Plan::Put(put) => put.location.as_ref(),
            Plan::DependentGet(get) => get.location.as_ref(),
            Plan::Task(task) => task.location.as_ref(),
            Plan::OnSuccess { step, .. }
            | Plan::OnFailure { step, .. }
            | Plan::Ensure { step, .. } => step.location(),
            Plan::Try(step) | Plan::Timeout { step, .. } => step.location(),
            Plan::Aggregate(steps) => steps.first().and_then(Plan::location),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetPlan {
    pub name: String,
    pub resource: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub pipeline: String,
    #[serde(default, skip_serializing_if = "Source::is_empty")]
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
    /// Pinned by the scheduler when the triggering build resolved a
    /// version for this input; the engine fetches exactly this version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PutPlan {
    pub name: String,
    pub resource: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub pipeline: String,
    #[serde(default, skip_serializing_if = "Source::is_empty")]
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

/// The implicit re-fetch appended after every put.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependentGetPlan {
    pub name: String,
    pub resource: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub pipeline: String,
    #[serde(default, skip_serializing_if = "Source::is_empty")]
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub name: String,
    #[serde(default)]
    pub privileged: bool,
    pub pipeline: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<TaskConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_round_trips_through_json() {
        let plan = Plan::OnSuccess {
            step: Box::new(Plan::Get(GetPlan {
                name: "repo".to_string(),
                resource: "repo".to_string(),
                resource_type: "git".to_string(),
                pipeline: "main".to_string(),
                location: Some(Location {
                    id: 1,
                    ..Default::default()
                }),
                ..Default::default()
            })),
            next: Box::new(Plan::Timeout {
                duration: "1h".to_string(),
                step: Box::new(Plan::Task(TaskPlan {
                    name: "unit".to_string(),
                    pipeline: "main".to_string(),
                    location: Some(Location {
                        id: 2,
                        ..Default::default()
                    }),
                    ..Default::default()
                })),
            }),
        };

        let json = serde_json::to_string(&plan).unwrap();
        let parsed: Plan = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, plan);
    }

    #[test]
    fn location_of_composite_comes_from_entry_step() {
        let plan = Plan::Try(Box::new(Plan::Task(TaskPlan {
            name: "flaky".to_string(),
            pipeline: "main".to_string(),
            location: Some(Location {
                id: 7,
                ..Default::default()
            }),
            ..Default::default()
        })));

        assert_eq!(plan.location().unwrap().id, 7);
    }
}
