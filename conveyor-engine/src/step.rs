//! The step lifecycle contract.

use async_trait::async_trait;
use conveyor_core::{MetadataField, Version};

use crate::signals::{Ready, Signals};

/// Whether a step's work came out successfully. Distinct from `run`'s
/// error: a failed task is a successful run with `Success(false)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Success(pub bool);

/// The version a get or put materialized, with its metadata.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VersionInfo {
    pub version: Version,
    pub metadata: Vec<MetadataField>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus(pub i32);

/// A node of an executing build plan.
///
/// `run` drives the step to completion, closing `ready` once its
/// preconditions are met and honoring signals cooperatively. The typed
/// result accessors return `None` until the step has that result.
/// `release` frees held worker resources and is idempotent.
#[async_trait]
pub trait Step: Send {
    async fn run(&mut self, signals: &mut Signals, ready: Ready) -> anyhow::Result<()>;

    fn succeeded(&self) -> Option<Success>;

    fn version_info(&self) -> Option<VersionInfo> {
        None
    }

    fn exit_status(&self) -> Option<ExitStatus> {
        None
    }

    async fn release(&mut self) {}
}

pub type BoxStep = Box<dyn Step>;
