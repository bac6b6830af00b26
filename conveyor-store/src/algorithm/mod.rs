//! Input version resolution.
//!
//! The resolver is a pure function over a [`VersionsDb`] snapshot: given a
//! job's inputs it finds one version per input such that every input
//! constrained by `passed` was carried through a common set of successful
//! upstream builds. All persistence happens in the scheduler, outside this
//! module.

mod build_set;

pub use build_set::BuildSet;

use std::collections::{BTreeSet, HashMap};

/// An enabled version of a resource, as the resolver sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceVersion {
    pub version_id: i64,
    pub resource_id: i64,
    pub check_order: i64,
}

/// One (version, build, job) fact: the build of the job consumed or
/// produced the version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildVersion {
    pub version_id: i64,
    pub resource_id: i64,
    pub build_id: i64,
    pub job_id: i64,
}

/// A read-only snapshot of the versions/build-history graph for one
/// pipeline. Only enabled versions and successful builds appear.
#[derive(Debug, Clone, Default)]
pub struct VersionsDb {
    pub resource_versions: Vec<ResourceVersion>,
    pub build_outputs: Vec<BuildVersion>,
    pub build_inputs: Vec<BuildVersion>,
    pub job_ids: HashMap<String, i64>,
    pub resource_ids: HashMap<String, i64>,
}

impl VersionsDb {
    /// Versions of a resource, newest first.
    fn versions_of(&self, resource_id: i64) -> Vec<ResourceVersion> {
        let mut versions: Vec<ResourceVersion> = self
            .resource_versions
            .iter()
            .filter(|v| v.resource_id == resource_id)
            .copied()
            .collect();
        versions.sort_by(|a, b| b.check_order.cmp(&a.check_order).then(b.version_id.cmp(&a.version_id)));
        versions
    }

    /// Successful builds of `job_id` that produced or consumed
    /// `version_id`.
    fn builds_touching(&self, job_id: i64, version_id: i64) -> BuildSet {
        let mut set = BuildSet::new();
        for output in &self.build_outputs {
            if output.job_id == job_id && output.version_id == version_id {
                set.insert(output.build_id);
            }
        }
        for input in &self.build_inputs {
            if input.job_id == job_id && input.version_id == version_id {
                set.insert(input.build_id);
            }
        }
        set
    }
}

/// A job input as the resolver consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputConfig {
    pub name: String,
    pub resource_id: i64,
    pub passed_job_ids: BTreeSet<i64>,
}

/// A resolved assignment for one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputVersion {
    pub input_name: String,
    pub version_id: i64,
}

/// Computes a satisfying assignment of one version per input, or `None`
/// when no combination satisfies the passed constraints today.
pub fn resolve(db: &VersionsDb, inputs: &[InputConfig]) -> Option<Vec<InputVersion>> {
    let mut chosen = Vec::with_capacity(inputs.len());
    let accumulator: HashMap<i64, BuildSet> = HashMap::new();
    if backtrack(db, inputs, 0, &accumulator, &mut chosen) {
        Some(chosen)
    } else {
        None
    }
}

fn backtrack(
    db: &VersionsDb,
    inputs: &[InputConfig],
    index: usize,
    accumulator: &HashMap<i64, BuildSet>,
    chosen: &mut Vec<InputVersion>,
) -> bool {
    let Some(input) = inputs.get(index) else {
        return true;
    };

    for version in db.versions_of(input.resource_id) {
        let mut narrowed = accumulator.clone();
        let mut viable = true;

        for &job_id in &input.passed_job_ids {
            let touching = db.builds_touching(job_id, version.version_id);
            let combined = match narrowed.get(&job_id) {
                Some(existing) => existing.intersect(&touching),
                None => touching,
            };
            if combined.is_empty() {
                viable = false;
                break;
            }
            narrowed.insert(job_id, combined);
        }

        if !viable {
            continue;
        }

        chosen.push(InputVersion {
            input_name: input.name.clone(),
            version_id: version.version_id,
        });

        if backtrack(db, inputs, index + 1, &narrowed, chosen) {
            return true;
        }

        chosen.pop();
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(name: &str, resource_id: i64, passed: &[i64]) -> InputConfig {
        InputConfig {
            name: name.to_string(),
            resource_id,
            passed_job_ids: passed.iter().copied().collect(),
        }
    }

    fn version(version_id: i64, resource_id: i64, check_order: i64) -> ResourceVersion {
        ResourceVersion {
            version_id,
            resource_id,
            check_order,
        }
    }

    fn output(version_id: i64, resource_id: i64, build_id: i64, job_id: i64) -> BuildVersion {
        BuildVersion {
            version_id,
            resource_id,
            build_id,
            job_id,
        }
    }

    #[test]
    fn unconstrained_input_takes_the_newest_version() {
        let db = VersionsDb {
            resource_versions: vec![version(1, 10, 1), version(2, 10, 2)],
            ..Default::default()
        };

        let resolved = resolve(&db, &[input("repo", 10, &[])]).unwrap();
        assert_eq!(resolved[0].version_id, 2);
    }

    #[test]
    fn passed_constraint_with_no_satisfying_build_finds_nothing() {
        // the only version of the resource was never output by job 7
        let db = VersionsDb {
            resource_versions: vec![version(1, 10, 1)],
            ..Default::default()
        };

        assert_eq!(resolve(&db, &[input("repo", 10, &[7])]), None);
    }

    #[test]
    fn passed_constraint_selects_version_carried_by_upstream_build() {
        let db = VersionsDb {
            resource_versions: vec![version(1, 10, 1), version(2, 10, 2)],
            // job 7's build 100 output version 1; version 2 never passed
            build_outputs: vec![output(1, 10, 100, 7)],
            ..Default::default()
        };

        let resolved = resolve(&db, &[input("repo", 10, &[7])]).unwrap();
        assert_eq!(resolved[0].version_id, 1);
    }

    #[test]
    fn inputs_sharing_passed_jobs_move_as_a_set() {
        // two resources, both passed through job 7. build 100 carried
        // (v1 of 10, v3 of 20); build 101 carried (v2 of 10, v4 of 20).
        let db = VersionsDb {
            resource_versions: vec![
                version(1, 10, 1),
                version(2, 10, 2),
                version(3, 20, 1),
                version(4, 20, 2),
            ],
            build_outputs: vec![
                output(1, 10, 100, 7),
                output(3, 20, 100, 7),
                output(2, 10, 101, 7),
                output(4, 20, 101, 7),
            ],
            ..Default::default()
        };

        let resolved = resolve(&db, &[input("a", 10, &[7]), input("b", 20, &[7])]).unwrap();
        // both come from build 101, the newer combination
        assert_eq!(resolved[0].version_id, 2);
        assert_eq!(resolved[1].version_id, 4);
    }

    #[test]
    fn backtracks_when_the_newest_choice_blocks_a_later_input() {
        // v2 of resource 10 passed job 7 via build 101, but resource 20's
        // only passed version went through build 100 together with v1.
        let db = VersionsDb {
            resource_versions: vec![
                version(1, 10, 1),
                version(2, 10, 2),
                version(3, 20, 1),
            ],
            build_outputs: vec![
                output(1, 10, 100, 7),
                output(3, 20, 100, 7),
                output(2, 10, 101, 7),
            ],
            ..Default::default()
        };

        let resolved = resolve(&db, &[input("a", 10, &[7]), input("b", 20, &[7])]).unwrap();
        assert_eq!(resolved[0].version_id, 1);
        assert_eq!(resolved[1].version_id, 3);
    }

    #[test]
    fn intersection_across_distinct_passed_jobs() {
        // input must have passed both jobs 7 and 8
        let db = VersionsDb {
            resource_versions: vec![version(1, 10, 1), version(2, 10, 2)],
            build_outputs: vec![
                output(2, 10, 100, 7), // newest passed only job 7
                output(1, 10, 101, 7),
                output(1, 10, 102, 8),
            ],
            ..Default::default()
        };

        let resolved = resolve(&db, &[input("repo", 10, &[7, 8])]).unwrap();
        assert_eq!(resolved[0].version_id, 1);
    }

    #[test]
    fn inputs_consumed_by_upstream_jobs_count_as_carried() {
        let db = VersionsDb {
            resource_versions: vec![version(1, 10, 1)],
            build_inputs: vec![output(1, 10, 100, 7)],
            ..Default::default()
        };

        let resolved = resolve(&db, &[input("repo", 10, &[7])]).unwrap();
        assert_eq!(resolved[0].version_id, 1);
    }
}
