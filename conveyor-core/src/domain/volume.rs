//! Worker volume cache records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::resource::{Source, Version};

/// A cached resource volume on a worker. `(worker_name, handle)` is
/// unique. A ttl of zero means the volume is kept indefinitely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub worker_name: String,
    pub handle: String,
    pub resource_hash: String,
    pub resource_version: Version,
    pub ttl: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Cache key for a resource's volumes: the type plus the canonical source
/// encoding. Source maps are ordered, so the encoding is deterministic.
pub fn resource_hash(resource_type: &str, source: &Source) -> String {
    let encoded = serde_json::to_string(source).unwrap_or_default();
    format!("{resource_type}{encoded}")
}
