//! Pipeline configuration document.
//!
//! The declarative side of the system: resources, resource types, jobs and
//! their plan trees. The build factory turns `PlanConfig` trees into
//! executable `Plan`s; the scheduler consumes `job_inputs` to drive input
//! resolution.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use super::plan::Location;
use super::resource::{Params, Source};
use super::task::TaskConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<GroupConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_types: Vec<ResourceTypeConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jobs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Source::is_empty")]
    pub source: Source,
    /// Check interval override, e.g. "30s" or "5m".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_every: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceTypeConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Source::is_empty")]
    pub source: Source,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    #[serde(default)]
    pub paused: bool,
    /// At most one build of this job runs at a time.
    #[serde(default)]
    pub serial: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub serial_groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plan: Vec<PlanConfig>,
}

/// One declarative step of a job plan.
///
/// Exactly one of the step fields (`get`, `put`, `task`, `try_`,
/// `aggregate`, `do_`) should be set; the hook and timeout fields are
/// orthogonal modifiers. `conditions` is the retired predecessor of the
/// hooks and is rejected by the build factory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub put: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, rename = "try", skip_serializing_if = "Option::is_none")]
    pub try_: Option<Box<PlanConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<Vec<PlanConfig>>,
    #[serde(default, rename = "do", skip_serializing_if = "Option::is_none")]
    pub do_: Option<Vec<PlanConfig>>,

    /// Resource backing a get/put when it differs from the step name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub passed: Vec<String>,
    #[serde(default)]
    pub trigger: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get_params: Option<Params>,

    #[serde(default)]
    pub privileged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<TaskConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<Box<PlanConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<Box<PlanConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ensure: Option<Box<PlanConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Legacy conditional syntax. No longer supported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<String>>,

    /// Positional identity assigned by the build factory during plan
    /// construction; never part of the configured document.
    #[serde(skip)]
    pub location: Option<Location>,
}

impl PlanConfig {
    /// Name of the resource a get/put step operates on.
    pub fn resource_name(&self) -> Option<&str> {
        self.resource
            .as_deref()
            .or(self.get.as_deref())
            .or(self.put.as_deref())
    }

    fn children(&self) -> Vec<&PlanConfig> {
        let mut out = Vec::new();
        if let Some(agg) = &self.aggregate {
            out.extend(agg.iter());
        }
        if let Some(seq) = &self.do_ {
            out.extend(seq.iter());
        }
        if let Some(step) = &self.try_ {
            out.push(step);
        }
        if let Some(step) = &self.on_success {
            out.push(step);
        }
        if let Some(step) = &self.on_failure {
            out.push(step);
        }
        if let Some(step) = &self.ensure {
            out.push(step);
        }
        out
    }
}

/// A job input derived from a get step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInput {
    pub name: String,
    pub resource: String,
    pub passed: Vec<String>,
    pub trigger: bool,
}

/// A job output derived from a put step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutput {
    pub name: String,
    pub resource: String,
}

/// Flattens every get step of the job's plan, however nested, into inputs.
pub fn job_inputs(job: &JobConfig) -> Vec<JobInput> {
    let mut inputs = Vec::new();
    for step in &job.plan {
        collect_inputs(step, &mut inputs);
    }
    inputs
}

fn collect_inputs(step: &PlanConfig, out: &mut Vec<JobInput>) {
    if let Some(get) = &step.get {
        out.push(JobInput {
            name: get.clone(),
            resource: step.resource.clone().unwrap_or_else(|| get.clone()),
            passed: step.passed.clone(),
            trigger: step.trigger,
        });
    }
    for child in step.children() {
        collect_inputs(child, out);
    }
}

/// Flattens every put step of the job's plan into outputs.
pub fn job_outputs(job: &JobConfig) -> Vec<JobOutput> {
    let mut outputs = Vec::new();
    for step in &job.plan {
        collect_outputs(step, &mut outputs);
    }
    outputs
}

fn collect_outputs(step: &PlanConfig, out: &mut Vec<JobOutput>) {
    if let Some(put) = &step.put {
        out.push(JobOutput {
            name: put.clone(),
            resource: step.resource.clone().unwrap_or_else(|| put.clone()),
        });
    }
    for child in step.children() {
        collect_outputs(child, out);
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("duplicate resource name: {0}")]
    DuplicateResource(String),
    #[error("duplicate job name: {0}")]
    DuplicateJob(String),
    #[error("job '{job}' has input '{input}' referencing unknown resource '{resource}'")]
    UnknownResource {
        job: String,
        input: String,
        resource: String,
    },
    #[error("job '{job}' has input '{input}' with passed constraint on unknown job '{passed}'")]
    UnknownPassedJob {
        job: String,
        input: String,
        passed: String,
    },
    #[error("invalid duration '{0}'")]
    InvalidDuration(String),
}

impl Config {
    pub fn resource(&self, name: &str) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// Structural validation run before a config is persisted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut resource_names = HashSet::new();
        for resource in &self.resources {
            if !resource_names.insert(resource.name.as_str()) {
                return Err(ConfigError::DuplicateResource(resource.name.clone()));
            }
            if let Some(interval) = &resource.check_every {
                parse_duration(interval)
                    .map_err(|_| ConfigError::InvalidDuration(interval.clone()))?;
            }
        }

        let mut job_names = HashSet::new();
        for job in &self.jobs {
            if !job_names.insert(job.name.as_str()) {
                return Err(ConfigError::DuplicateJob(job.name.clone()));
            }
        }

        for job in &self.jobs {
            for input in job_inputs(job) {
                if !resource_names.contains(input.resource.as_str()) {
                    return Err(ConfigError::UnknownResource {
                        job: job.name.clone(),
                        input: input.name.clone(),
                        resource: input.resource,
                    });
                }
                for passed in &input.passed {
                    if !job_names.contains(passed.as_str()) {
                        return Err(ConfigError::UnknownPassedJob {
                            job: job.name.clone(),
                            input: input.name.clone(),
                            passed: passed.clone(),
                        });
                    }
                }
            }
        }

        Ok(())
    }
}

/// Parses a compound duration string such as "30s", "5m", or "1h30m".
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut saw_component = false;

    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }

        if digits.is_empty() {
            return Err(format!("invalid duration '{s}'"));
        }
        let value: u64 = digits.parse().map_err(|_| format!("invalid duration '{s}'"))?;
        digits.clear();

        let unit = match c {
            's' => Duration::from_secs(1),
            'm' => Duration::from_secs(60),
            'h' => Duration::from_secs(3600),
            _ => return Err(format!("unknown duration unit '{c}' in '{s}'")),
        };
        total += unit * value as u32;
        saw_component = true;
    }

    if !digits.is_empty() || !saw_component {
        return Err(format!("invalid duration '{s}'"));
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(name: &str) -> PlanConfig {
        PlanConfig {
            get: Some(name.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn job_inputs_flattens_nested_gets() {
        let job = JobConfig {
            name: "some-job".to_string(),
            plan: vec![
                PlanConfig {
                    get: Some("a".to_string()),
                    trigger: true,
                    passed: vec!["upstream".to_string()],
                    ..Default::default()
                },
                PlanConfig {
                    aggregate: Some(vec![get("b"), get("c")]),
                    ..Default::default()
                },
                PlanConfig {
                    do_: Some(vec![PlanConfig {
                        try_: Some(Box::new(get("d"))),
                        ..Default::default()
                    }]),
                    ..Default::default()
                },
                PlanConfig {
                    task: Some("build".to_string()),
                    on_failure: Some(Box::new(get("e"))),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let inputs = job_inputs(&job);
        let names: Vec<_> = inputs.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d", "e"]);
        assert!(inputs[0].trigger);
        assert_eq!(inputs[0].passed, vec!["upstream".to_string()]);
    }

    #[test]
    fn job_outputs_collects_puts() {
        let job = JobConfig {
            name: "some-job".to_string(),
            plan: vec![PlanConfig {
                put: Some("release".to_string()),
                resource: Some("release-bucket".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        };

        let outputs = job_outputs(&job);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].name, "release");
        assert_eq!(outputs[0].resource, "release-bucket");
    }

    #[test]
    fn validate_rejects_duplicates_and_unknown_references() {
        let mut config = Config {
            resources: vec![ResourceConfig {
                name: "repo".to_string(),
                resource_type: "git".to_string(),
                ..Default::default()
            }],
            jobs: vec![JobConfig {
                name: "unit".to_string(),
                plan: vec![get("repo")],
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.jobs[0].plan[0].passed = vec!["nonexistent".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownPassedJob { .. })
        ));

        config.jobs[0].plan[0].passed = vec![];
        config.jobs[0].plan.push(get("missing"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownResource { .. })
        ));
    }

    #[test]
    fn parse_duration_handles_compound_values() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert!(parse_duration("nope").is_err());
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("").is_err());
    }
}
