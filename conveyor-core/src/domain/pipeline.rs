//! Saved pipelines, teams, and pipes.

use serde::{Deserialize, Serialize};

/// A configured pipeline as the store knows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedPipeline {
    pub id: i64,
    pub name: String,
    pub team_id: i64,
    pub team_name: String,
    pub paused: bool,
    /// Opaque monotonic token bumped on every config save; used for
    /// optimistic concurrency on updates.
    pub config_version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: i64,
    pub name: String,
}

/// Default team owning one-off builds.
pub const DEFAULT_TEAM_NAME: &str = "main";

/// A transient streaming handle between two builds' steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipe {
    pub id: String,
    pub url: String,
}
