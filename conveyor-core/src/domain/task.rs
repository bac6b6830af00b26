//! Task configuration.
//!
//! A task config may be inlined in the plan, loaded from a file fetched out
//! of an artifact source, or both (merged). The merge and validation rules
//! live here; the engine's config sources compose them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<TaskInputConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<TaskRunConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskInputConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRunConfig {
    pub path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl TaskConfig {
    /// Overlays `other` on top of `self`.
    ///
    /// Params are merged key-by-key with `other` winning; platform, image,
    /// run, and inputs come from whichever side provides them, preferring
    /// `other`.
    pub fn merge(&self, other: &TaskConfig) -> TaskConfig {
        let mut params = self.params.clone();
        for (k, v) in &other.params {
            params.insert(k.clone(), v.clone());
        }

        let mut inputs = self.inputs.clone();
        if !other.inputs.is_empty() {
            inputs = other.inputs.clone();
        }

        TaskConfig {
            platform: if other.platform.is_empty() {
                self.platform.clone()
            } else {
                other.platform.clone()
            },
            image: other.image.clone().or_else(|| self.image.clone()),
            params,
            inputs,
            run: other.run.clone().or_else(|| self.run.clone()),
        }
    }

    /// Checks that the config is runnable: it must name a platform and a
    /// run path.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut messages = Vec::new();

        if self.platform.is_empty() {
            messages.push("missing 'platform'".to_string());
        }

        match &self.run {
            None => messages.push("missing path to executable to run".to_string()),
            Some(run) if run.path.is_empty() => {
                messages.push("missing path to executable to run".to_string())
            }
            Some(_) => {}
        }

        if messages.is_empty() {
            Ok(())
        } else {
            Err(messages)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> TaskConfig {
        TaskConfig {
            platform: "linux".to_string(),
            run: Some(TaskRunConfig {
                path: "ls".to_string(),
                args: vec![],
            }),
            ..Default::default()
        }
    }

    #[test]
    fn merge_prefers_overlay_params() {
        let base = TaskConfig {
            params: BTreeMap::from([
                ("FOO".to_string(), "1".to_string()),
                ("BAR".to_string(), "2".to_string()),
            ]),
            ..valid_config()
        };
        let overlay = TaskConfig {
            params: BTreeMap::from([("FOO".to_string(), "3".to_string())]),
            ..Default::default()
        };

        let merged = base.merge(&overlay);
        assert_eq!(merged.params.get("FOO"), Some(&"3".to_string()));
        assert_eq!(merged.params.get("BAR"), Some(&"2".to_string()));
        assert_eq!(merged.platform, "linux");
    }

    #[test]
    fn merge_takes_run_from_whichever_provides_it() {
        let base = TaskConfig::default();
        let overlay = valid_config();

        assert_eq!(base.merge(&overlay).run, overlay.run);
        assert_eq!(overlay.merge(&base).run, overlay.run);
    }

    #[test]
    fn validate_requires_platform_and_run_path() {
        assert!(valid_config().validate().is_ok());

        let missing_platform = TaskConfig {
            platform: String::new(),
            ..valid_config()
        };
        assert_eq!(
            missing_platform.validate().unwrap_err(),
            vec!["missing 'platform'".to_string()]
        );

        let missing_run = TaskConfig {
            run: None,
            ..valid_config()
        };
        assert_eq!(
            missing_run.validate().unwrap_err(),
            vec!["missing path to executable to run".to_string()]
        );
    }
}
