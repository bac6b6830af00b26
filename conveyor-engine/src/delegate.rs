//! Build delegates.
//!
//! Step progress is a side-channel: log lines, discovered versions, and
//! lifecycle marks must be persisted even when `run` ultimately errors, so
//! leaf steps report through a delegate rather than their return value.
//! Store failures inside a delegate are logged and swallowed; losing an
//! event must never fail the build itself.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

use conveyor_core::{
    BuildInput, Event, GetPlan, Origin, OriginSource, PlanId, PutPlan, TaskConfig, TaskPlan,
};
use conveyor_store::prelude::*;

use crate::step::VersionInfo;

#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write_line(&self, line: &str);
}

/// Reports a get step's lifecycle and records the consumed version.
#[async_trait]
pub trait GetDelegate: Send + Sync {
    async fn initializing(&self);
    async fn completed(&self, version: &VersionInfo);
    async fn failed(&self, message: &str);
    fn stdout(&self) -> Arc<dyn LogSink>;
    fn stderr(&self) -> Arc<dyn LogSink>;
}

/// Reports a put or dependent get's lifecycle and records the produced
/// version.
#[async_trait]
pub trait OutputDelegate: Send + Sync {
    async fn initializing(&self);
    async fn completed(&self, version: &VersionInfo);
    async fn failed(&self, message: &str);
    fn stdout(&self) -> Arc<dyn LogSink>;
    fn stderr(&self) -> Arc<dyn LogSink>;
}

#[async_trait]
pub trait TaskDelegate: Send + Sync {
    async fn initializing(&self, config: &TaskConfig);
    async fn started(&self);
    async fn finished(&self, exit_status: i32);
    async fn failed(&self, message: &str);
    fn stdout(&self) -> Arc<dyn LogSink>;
    fn stderr(&self) -> Arc<dyn LogSink>;
}

/// Produces the per-step delegates for one build.
pub trait BuildDelegate: Send + Sync {
    fn input_delegate(&self, plan: &GetPlan) -> Arc<dyn GetDelegate>;
    fn output_delegate(&self, plan: &PutPlan) -> Arc<dyn OutputDelegate>;
    fn implicit_output_delegate(&self, name: &str, resource: &str, plan_id: PlanId)
        -> Arc<dyn OutputDelegate>;
    fn task_delegate(&self, plan: &TaskPlan) -> Arc<dyn TaskDelegate>;
}

// ---------------------------------------------------------------------------
// Store-backed implementation
// ---------------------------------------------------------------------------

pub struct ExecBuildDelegate {
    store: Arc<dyn Store>,
    build_id: i64,
}

impl ExecBuildDelegate {
    pub fn new(store: Arc<dyn Store>, build_id: i64) -> Self {
        ExecBuildDelegate { store, build_id }
    }

    fn sink(&self, source: OriginSource, plan_id: PlanId) -> Arc<dyn LogSink> {
        Arc::new(EventLogSink {
            store: self.store.clone(),
            build_id: self.build_id,
            origin: Origin {
                source,
                id: plan_id.to_string(),
            },
        })
    }

    async fn save_event(store: &Arc<dyn Store>, build_id: i64, event: Event) {
        if let Err(err) = store.save_build_event(build_id, &event).await {
            tracing::warn!(build_id, error = %err, "failed to save build event");
        }
    }
}

struct EventLogSink {
    store: Arc<dyn Store>,
    build_id: i64,
    origin: Origin,
}

#[async_trait]
impl LogSink for EventLogSink {
    async fn write_line(&self, line: &str) {
        ExecBuildDelegate::save_event(
            &self.store,
            self.build_id,
            Event::Log {
                origin: self.origin.clone(),
                payload: line.to_string(),
            },
        )
        .await;
    }
}

impl BuildDelegate for ExecBuildDelegate {
    fn input_delegate(&self, plan: &GetPlan) -> Arc<dyn GetDelegate> {
        let plan_id = plan.location.as_ref().map(|l| l.id).unwrap_or_default();
        Arc::new(ExecGetDelegate {
            store: self.store.clone(),
            build_id: self.build_id,
            name: plan.name.clone(),
            resource: plan.resource.clone(),
            plan_id,
            stdout: self.sink(OriginSource::Stdout, plan_id),
            stderr: self.sink(OriginSource::Stderr, plan_id),
        })
    }

    fn output_delegate(&self, plan: &PutPlan) -> Arc<dyn OutputDelegate> {
        let plan_id = plan.location.as_ref().map(|l| l.id).unwrap_or_default();
        self.implicit_output_delegate(&plan.name, &plan.resource, plan_id)
    }

    fn implicit_output_delegate(
        &self,
        name: &str,
        resource: &str,
        plan_id: PlanId,
    ) -> Arc<dyn OutputDelegate> {
        Arc::new(ExecOutputDelegate {
            store: self.store.clone(),
            build_id: self.build_id,
            name: name.to_string(),
            resource: resource.to_string(),
            plan_id,
            stdout: self.sink(OriginSource::Stdout, plan_id),
            stderr: self.sink(OriginSource::Stderr, plan_id),
        })
    }

    fn task_delegate(&self, plan: &TaskPlan) -> Arc<dyn TaskDelegate> {
        let plan_id = plan.location.as_ref().map(|l| l.id).unwrap_or_default();
        Arc::new(ExecTaskDelegate {
            store: self.store.clone(),
            build_id: self.build_id,
            name: plan.name.clone(),
            plan_id,
            stdout: self.sink(OriginSource::Stdout, plan_id),
            stderr: self.sink(OriginSource::Stderr, plan_id),
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    pub struct NullSink;

    #[async_trait]
    impl LogSink for NullSink {
        async fn write_line(&self, _line: &str) {}
    }

    #[derive(Default)]
    pub struct CapturedCalls {
        pub initializing: usize,
        pub started: usize,
        pub completed: Vec<VersionInfo>,
        pub finished: Vec<i32>,
        pub failed: Vec<String>,
    }

    /// One capturing delegate usable wherever the leaf steps need one.
    #[derive(Default)]
    pub struct CapturingDelegate {
        pub calls: Mutex<CapturedCalls>,
    }

    impl CapturingDelegate {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }
    }

    #[async_trait]
    impl GetDelegate for CapturingDelegate {
        async fn initializing(&self) {
            self.calls.lock().unwrap().initializing += 1;
        }

        async fn completed(&self, version: &VersionInfo) {
            self.calls.lock().unwrap().completed.push(version.clone());
        }

        async fn failed(&self, message: &str) {
            self.calls.lock().unwrap().failed.push(message.to_string());
        }

        fn stdout(&self) -> Arc<dyn LogSink> {
            Arc::new(NullSink)
        }

        fn stderr(&self) -> Arc<dyn LogSink> {
            Arc::new(NullSink)
        }
    }

    #[async_trait]
    impl OutputDelegate for CapturingDelegate {
        async fn initializing(&self) {
            self.calls.lock().unwrap().initializing += 1;
        }

        async fn completed(&self, version: &VersionInfo) {
            self.calls.lock().unwrap().completed.push(version.clone());
        }

        async fn failed(&self, message: &str) {
            self.calls.lock().unwrap().failed.push(message.to_string());
        }

        fn stdout(&self) -> Arc<dyn LogSink> {
            Arc::new(NullSink)
        }

        fn stderr(&self) -> Arc<dyn LogSink> {
            Arc::new(NullSink)
        }
    }

    #[async_trait]
    impl TaskDelegate for CapturingDelegate {
        async fn initializing(&self, _config: &TaskConfig) {
            self.calls.lock().unwrap().initializing += 1;
        }

        async fn started(&self) {
            self.calls.lock().unwrap().started += 1;
        }

        async fn finished(&self, exit_status: i32) {
            self.calls.lock().unwrap().finished.push(exit_status);
        }

        async fn failed(&self, message: &str) {
            self.calls.lock().unwrap().failed.push(message.to_string());
        }

        fn stdout(&self) -> Arc<dyn LogSink> {
            Arc::new(NullSink)
        }

        fn stderr(&self) -> Arc<dyn LogSink> {
            Arc::new(NullSink)
        }
    }
}

struct ExecGetDelegate {
    store: Arc<dyn Store>,
    build_id: i64,
    name: String,
    resource: String,
    plan_id: PlanId,
    stdout: Arc<dyn LogSink>,
    stderr: Arc<dyn LogSink>,
}

#[async_trait]
impl GetDelegate for ExecGetDelegate {
    async fn initializing(&self) {
        ExecBuildDelegate::save_event(
            &self.store,
            self.build_id,
            Event::Initialize {
                plan_id: self.plan_id,
                step_name: self.name.clone(),
            },
        )
        .await;
    }

    async fn completed(&self, version: &VersionInfo) {
        let input = BuildInput {
            name: self.name.clone(),
            resource: self.resource.clone(),
            version: version.version.clone(),
            metadata: version.metadata.clone(),
            first_occurrence: false,
        };

        let first_occurrence = match self.store.save_build_input(self.build_id, &input).await {
            Ok(_) => self
                .store
                .get_build_inputs(self.build_id)
                .await
                .ok()
                .and_then(|inputs| {
                    inputs
                        .into_iter()
                        .find(|i| i.name == self.name)
                        .map(|i| i.first_occurrence)
                })
                .unwrap_or(false),
            Err(err) => {
                tracing::warn!(build_id = self.build_id, error = %err, "failed to save build input");
                false
            }
        };

        ExecBuildDelegate::save_event(
            &self.store,
            self.build_id,
            Event::Input {
                input: BuildInput {
                    first_occurrence,
                    ..input
                },
            },
        )
        .await;
    }

    async fn failed(&self, message: &str) {
        ExecBuildDelegate::save_event(
            &self.store,
            self.build_id,
            Event::Error {
                message: message.to_string(),
                origin: Some(Origin {
                    source: OriginSource::Stderr,
                    id: self.plan_id.to_string(),
                }),
            },
        )
        .await;
    }

    fn stdout(&self) -> Arc<dyn LogSink> {
        self.stdout.clone()
    }

    fn stderr(&self) -> Arc<dyn LogSink> {
        self.stderr.clone()
    }
}

struct ExecOutputDelegate {
    store: Arc<dyn Store>,
    build_id: i64,
    name: String,
    resource: String,
    plan_id: PlanId,
    stdout: Arc<dyn LogSink>,
    stderr: Arc<dyn LogSink>,
}

#[async_trait]
impl OutputDelegate for ExecOutputDelegate {
    async fn initializing(&self) {
        ExecBuildDelegate::save_event(
            &self.store,
            self.build_id,
            Event::Initialize {
                plan_id: self.plan_id,
                step_name: self.name.clone(),
            },
        )
        .await;
    }

    async fn completed(&self, version: &VersionInfo) {
        if let Err(err) = self
            .store
            .save_build_output(self.build_id, &self.resource, &version.version)
            .await
        {
            tracing::warn!(build_id = self.build_id, error = %err, "failed to save build output");
        }

        ExecBuildDelegate::save_event(
            &self.store,
            self.build_id,
            Event::Output {
                resource: self.resource.clone(),
                version: version.version.clone(),
            },
        )
        .await;
    }

    async fn failed(&self, message: &str) {
        ExecBuildDelegate::save_event(
            &self.store,
            self.build_id,
            Event::Error {
                message: message.to_string(),
                origin: Some(Origin {
                    source: OriginSource::Stderr,
                    id: self.plan_id.to_string(),
                }),
            },
        )
        .await;
    }

    fn stdout(&self) -> Arc<dyn LogSink> {
        self.stdout.clone()
    }

    fn stderr(&self) -> Arc<dyn LogSink> {
        self.stderr.clone()
    }
}

struct ExecTaskDelegate {
    store: Arc<dyn Store>,
    build_id: i64,
    name: String,
    plan_id: PlanId,
    stdout: Arc<dyn LogSink>,
    stderr: Arc<dyn LogSink>,
}

#[async_trait]
impl TaskDelegate for ExecTaskDelegate {
    async fn initializing(&self, _config: &TaskConfig) {
        ExecBuildDelegate::save_event(
            &self.store,
            self.build_id,
            Event::Initialize {
                plan_id: self.plan_id,
                step_name: self.name.clone(),
            },
        )
        .await;
    }

    async fn started(&self) {
        ExecBuildDelegate::save_event(
            &self.store,
            self.build_id,
            Event::Start {
                plan_id: self.plan_id,
                step_name: self.name.clone(),
                time: Utc::now().timestamp(),
            },
        )
        .await;
    }

    async fn finished(&self, exit_status: i32) {
        ExecBuildDelegate::save_event(
            &self.store,
            self.build_id,
            Event::Finish {
                plan_id: self.plan_id,
                step_name: self.name.clone(),
                exit_status,
                time: Utc::now().timestamp(),
            },
        )
        .await;
    }

    async fn failed(&self, message: &str) {
        ExecBuildDelegate::save_event(
            &self.store,
            self.build_id,
            Event::Error {
                message: message.to_string(),
                origin: Some(Origin {
                    source: OriginSource::Stderr,
                    id: self.plan_id.to_string(),
                }),
            },
        )
        .await;
    }

    fn stdout(&self) -> Arc<dyn LogSink> {
        self.stdout.clone()
    }

    fn stderr(&self) -> Arc<dyn LogSink> {
        self.stderr.clone()
    }
}
