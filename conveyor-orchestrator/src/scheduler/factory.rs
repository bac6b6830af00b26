//! Build plan construction.
//!
//! Compiles a job's declarative plan into the executable tree: assigns
//! step locations by pre-order numbering, expands every put into
//! `on_success(put, dependent_get)`, chains sequences through success
//! hooks so failure short-circuits, pins get versions from the triggering
//! inputs, and wires the orthogonal hooks around each step.

use conveyor_core::{
    BuildInput, DependentGetPlan, GetPlan, JobConfig, Location, Plan, PlanConfig, PutPlan,
    ResourceConfig, StepHook, TaskPlan,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FactoryError {
    #[error("conditionals are no longer supported in build plans; use success/failure hooks instead")]
    LegacyConditions,
    #[error("job has an empty build plan")]
    EmptyPlan,
    #[error("plan step configures no action")]
    MalformedStep,
}

pub struct BuildFactory {
    pub pipeline_name: String,
}

impl BuildFactory {
    pub fn new(pipeline_name: &str) -> Self {
        BuildFactory {
            pipeline_name: pipeline_name.to_string(),
        }
    }

    pub fn create(
        &self,
        job: &JobConfig,
        resources: &[ResourceConfig],
        inputs: &[BuildInput],
    ) -> Result<Plan, FactoryError> {
        if sequence_has_conditionals(&job.plan) {
            return Err(FactoryError::LegacyConditions);
        }
        if job.plan.is_empty() {
            return Err(FactoryError::EmptyPlan);
        }

        let mut sequence = job.plan.clone();
        populate_locations(&mut sequence);

        self.construct_sequence(&sequence, resources, inputs)
    }

    fn construct_sequence(
        &self,
        sequence: &[PlanConfig],
        resources: &[ResourceConfig],
        inputs: &[BuildInput],
    ) -> Result<Plan, FactoryError> {
        let (first, rest) = sequence.split_first().ok_or(FactoryError::EmptyPlan)?;

        let plan = self.construct_step(first, resources, inputs)?;
        if rest.is_empty() {
            return Ok(plan);
        }

        Ok(Plan::OnSuccess {
            step: Box::new(plan),
            next: Box::new(self.construct_sequence(rest, resources, inputs)?),
        })
    }

    fn construct_step(
        &self,
        config: &PlanConfig,
        resources: &[ResourceConfig],
        inputs: &[BuildInput],
    ) -> Result<Plan, FactoryError> {
        let mut plan = if let Some(sequence) = &config.do_ {
            self.construct_sequence(sequence, resources, inputs)?
        } else if let Some(put_name) = &config.put {
            let resource_name = config.resource.clone().unwrap_or_else(|| put_name.clone());
            let resource = lookup_resource(resources, &resource_name);

            let (step_location, next_location) = put_locations(config.location.as_ref());

            Plan::OnSuccess {
                step: Box::new(Plan::Put(PutPlan {
                    name: put_name.clone(),
                    resource: resource_name.clone(),
                    resource_type: resource.resource_type.clone(),
                    pipeline: self.pipeline_name.clone(),
                    source: resource.source.clone(),
                    params: config.params.clone(),
                    tags: config.tags.clone(),
                    location: step_location,
                })),
                next: Box::new(Plan::DependentGet(DependentGetPlan {
                    name: put_name.clone(),
                    resource: resource_name,
                    resource_type: resource.resource_type.clone(),
                    pipeline: self.pipeline_name.clone(),
                    source: resource.source.clone(),
                    params: config.get_params.clone(),
                    tags: config.tags.clone(),
                    location: next_location,
                })),
            }
        } else if let Some(get_name) = &config.get {
            let resource_name = config.resource.clone().unwrap_or_else(|| get_name.clone());
            let resource = lookup_resource(resources, &resource_name);

            let version = inputs
                .iter()
                .find(|input| input.name == *get_name)
                .map(|input| input.version.clone());

            Plan::Get(GetPlan {
                name: get_name.clone(),
                resource: resource_name,
                resource_type: resource.resource_type.clone(),
                pipeline: self.pipeline_name.clone(),
                source: resource.source.clone(),
                params: config.params.clone(),
                version,
                tags: config.tags.clone(),
                location: config.location.clone(),
            })
        } else if let Some(task_name) = &config.task {
            Plan::Task(TaskPlan {
                name: task_name.clone(),
                privileged: config.privileged,
                pipeline: self.pipeline_name.clone(),
                config: config.config.clone(),
                config_path: config.file.clone(),
                tags: config.tags.clone(),
                location: config.location.clone(),
            })
        } else if let Some(inner) = &config.try_ {
            Plan::Try(Box::new(self.construct_step(inner, resources, inputs)?))
        } else if let Some(aggregate) = &config.aggregate {
            Plan::Aggregate(
                aggregate
                    .iter()
                    .map(|child| self.construct_step(child, resources, inputs))
                    .collect::<Result<_, _>>()?,
            )
        } else {
            return Err(FactoryError::MalformedStep);
        };

        if let Some(duration) = &config.timeout {
            plan = Plan::Timeout {
                duration: duration.clone(),
                step: Box::new(plan),
            };
        }

        if let Some(hook) = &config.on_failure {
            plan = Plan::OnFailure {
                step: Box::new(plan),
                next: Box::new(self.construct_step(hook, resources, inputs)?),
            };
        }
        if let Some(hook) = &config.on_success {
            plan = Plan::OnSuccess {
                step: Box::new(plan),
                next: Box::new(self.construct_step(hook, resources, inputs)?),
            };
        }
        if let Some(hook) = &config.ensure {
            plan = Plan::Ensure {
                step: Box::new(plan),
                next: Box::new(self.construct_step(hook, resources, inputs)?),
            };
        }

        Ok(plan)
    }
}

fn lookup_resource(resources: &[ResourceConfig], name: &str) -> ResourceConfig {
    resources
        .iter()
        .find(|r| r.name == name)
        .cloned()
        .unwrap_or_default()
}

fn sequence_has_conditionals(sequence: &[PlanConfig]) -> bool {
    sequence.iter().any(step_has_conditionals)
}

fn step_has_conditionals(step: &PlanConfig) -> bool {
    if step.conditions.is_some() {
        return true;
    }
    if let Some(aggregate) = &step.aggregate {
        if sequence_has_conditionals(aggregate) {
            return true;
        }
    }
    if let Some(sequence) = &step.do_ {
        if sequence_has_conditionals(sequence) {
            return true;
        }
    }
    for hook in [&step.try_, &step.on_success, &step.on_failure, &step.ensure]
        .into_iter()
        .flatten()
    {
        if step_has_conditionals(hook) {
            return true;
        }
    }
    false
}

/// A put occupies its own location and reserves the next id for the
/// dependent get that re-fetches what it produced.
fn put_locations(location: Option<&Location>) -> (Option<Location>, Option<Location>) {
    let Some(location) = location else {
        return (None, None);
    };

    let mut step_location = Location {
        id: location.id,
        hook: location.hook,
        serial_group: location.serial_group,
        ..Default::default()
    };
    if location.parallel_group != 0 {
        step_location.parallel_group = location.parallel_group;
    } else {
        step_location.parent_id = location.parent_id;
    }

    let next_location = Location {
        id: step_location.id + 1,
        parent_id: step_location.id,
        ..Default::default()
    };

    (Some(step_location), Some(next_location))
}

/// Pre-order location numbering. Ids are dense; aggregates claim an id
/// for the parallel group shared by their children, do sequences likewise
/// for their serial group, and puts reserve the id after their own for
/// the dependent get.
fn populate_locations(sequence: &mut [PlanConfig]) {
    let mut step_count: u32 = 1;
    for step in sequence.iter_mut() {
        let location = Location {
            id: step_count,
            ..Default::default()
        };
        step_count += populate_step_locations(step, location);
    }
}

fn populate_step_locations(step: &mut PlanConfig, mut location: Location) -> u32 {
    let mut step_count: u32 = 0;
    let mut parent_id = location.id;

    if step.put.is_some() {
        // reserve an id for the dependent get added during construction
        step_count += 1;
        step.location = Some(location.clone());
    } else if step.do_.is_some() {
        let serial_group = location.id + 1;
        step_count += 1;

        if location.serial_group != 0 {
            location.parent_id = location.serial_group;
        }

        let hook = location.hook;
        for child in step.do_.as_mut().unwrap() {
            let mut child_location = Location {
                id: location.id + step_count + 1,
                parent_id: location.parent_id,
                parallel_group: location.parallel_group,
                serial_group,
                hook: None,
            };
            if child.do_.is_none() {
                child_location.hook = hook;
            }
            step_count += populate_step_locations(child, child_location);
        }

        parent_id = serial_group;
    } else if step.try_.is_some() {
        let child_location = Location {
            id: location.id + step_count + 1,
            parent_id: location.parent_id,
            hook: location.hook,
            ..Default::default()
        };
        step_count += populate_step_locations(step.try_.as_mut().unwrap(), child_location);
    } else if step.aggregate.is_some() {
        let parallel_group = location.id + 1;
        step_count += 1;

        if location.parallel_group != 0 {
            location.parent_id = location.parallel_group;
        }

        let hook = location.hook;
        for child in step.aggregate.as_mut().unwrap() {
            let mut child_location = Location {
                id: location.id + step_count + 1,
                parent_id: location.parent_id,
                parallel_group,
                serial_group: location.serial_group,
                hook: None,
            };
            if child.aggregate.is_none() && child.do_.is_none() {
                child_location.hook = hook;
            }
            step_count += populate_step_locations(child, child_location);
        }

        parent_id = parallel_group;
    } else {
        step.location = Some(location.clone());
    }

    if let Some(hook) = step.on_failure.as_mut() {
        let child_location = Location {
            id: location.id + step_count + 1,
            parent_id,
            hook: Some(StepHook::Failure),
            ..Default::default()
        };
        step_count += populate_step_locations(hook, child_location);
    }
    if let Some(hook) = step.on_success.as_mut() {
        let child_location = Location {
            id: location.id + step_count + 1,
            parent_id,
            hook: Some(StepHook::Success),
            ..Default::default()
        };
        step_count += populate_step_locations(hook, child_location);
    }
    if let Some(hook) = step.ensure.as_mut() {
        let child_location = Location {
            id: location.id + step_count + 1,
            parent_id,
            hook: Some(StepHook::Ensure),
            ..Default::default()
        };
        step_count += populate_step_locations(hook, child_location);
    }

    step_count + 1
}
