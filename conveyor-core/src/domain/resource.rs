//! Resource and version types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque resource source configuration (e.g. a git URI and branch).
///
/// A `BTreeMap` so that serialization is deterministic; the volume cache
/// hash and version uniqueness both depend on that.
pub type Source = BTreeMap<String, serde_json::Value>;

/// Step parameters passed to a resource or task.
pub type Params = BTreeMap<String, serde_json::Value>;

/// An opaque version identity, e.g. `{ref: abc123}`.
pub type Version = BTreeMap<String, String>;

/// A named piece of version metadata reported by a resource check or fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    pub name: String,
    pub value: String,
}

/// A version record persisted for a resource.
///
/// `id` is a store-assigned surrogate that is monotone over insertion and
/// is what pagination and input resolution order by. `(resource_name,
/// version)` is unique; saving the same version map again is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedVersion {
    pub id: i64,
    pub resource_name: String,
    pub version: Version,
    #[serde(default)]
    pub metadata: Vec<MetadataField>,
    pub enabled: bool,
    /// Position in the resource's check history; newer checks have higher
    /// order even when versions arrive out of id sequence.
    pub check_order: i64,
}
