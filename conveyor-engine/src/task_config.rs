//! Composable task config sources.
//!
//! A task's configuration may be inlined in the plan, fetched from a file
//! inside an artifact source, or both; sources compose so the task step
//! can build one chain and fetch once: merge on top of the file, warn on
//! deprecated usage, validate last.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use conveyor_core::TaskConfig;

use crate::delegate::LogSink;
use crate::source_repository::{ArtifactError, SourceRepository};

#[derive(Debug, thiserror::Error)]
pub enum TaskConfigError {
    #[error("unknown artifact source: {0}")]
    UnknownArtifactSource(String),
    #[error("config path '{0}' does not specify where the file lives")]
    UnspecifiedArtifactSource(String),
    #[error("invalid task configuration:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
    #[error("failed to read task config file '{path}': {message}")]
    ReadFailed { path: String, message: String },
    #[error("failed to parse task config file '{path}': {message}")]
    ParseFailed { path: String, message: String },
}

#[async_trait]
pub trait TaskConfigSource: Send + Sync {
    async fn fetch_config(&self, repo: &SourceRepository) -> Result<TaskConfig, TaskConfigError>;
}

/// Config inlined in the plan.
pub struct StaticConfigSource {
    pub config: TaskConfig,
}

#[async_trait]
impl TaskConfigSource for StaticConfigSource {
    async fn fetch_config(&self, _repo: &SourceRepository) -> Result<TaskConfig, TaskConfigError> {
        Ok(self.config.clone())
    }
}

/// Config loaded from a YAML file inside a registered artifact source. The
/// path's first segment names the source.
pub struct FileConfigSource {
    pub path: String,
}

#[async_trait]
impl TaskConfigSource for FileConfigSource {
    async fn fetch_config(&self, repo: &SourceRepository) -> Result<TaskConfig, TaskConfigError> {
        let Some((source_name, file_path)) = self.path.split_once('/') else {
            return Err(TaskConfigError::UnspecifiedArtifactSource(self.path.clone()));
        };
        if file_path.is_empty() {
            return Err(TaskConfigError::UnspecifiedArtifactSource(self.path.clone()));
        }

        let source = repo
            .get(source_name)
            .ok_or_else(|| TaskConfigError::UnknownArtifactSource(source_name.to_string()))?;

        let mut reader =
            source
                .stream_file(file_path)
                .await
                .map_err(|err| match err {
                    ArtifactError::FileNotFound(path) => TaskConfigError::ReadFailed {
                        path: self.path.clone(),
                        message: format!("file not found: {path}"),
                    },
                    ArtifactError::StreamFailed(message) => TaskConfigError::ReadFailed {
                        path: self.path.clone(),
                        message,
                    },
                })?;

        let mut contents = Vec::new();
        reader
            .read_to_end(&mut contents)
            .await
            .map_err(|err| TaskConfigError::ReadFailed {
                path: self.path.clone(),
                message: err.to_string(),
            })?;

        serde_yaml::from_slice(&contents).map_err(|err| TaskConfigError::ParseFailed {
            path: self.path.clone(),
            message: err.to_string(),
        })
    }
}

/// Overlays `b` on `a`: b's params win; platform, image, and run come from
/// whichever provides them.
pub struct MergedConfigSource {
    pub a: Box<dyn TaskConfigSource>,
    pub b: Box<dyn TaskConfigSource>,
}

#[async_trait]
impl TaskConfigSource for MergedConfigSource {
    async fn fetch_config(&self, repo: &SourceRepository) -> Result<TaskConfig, TaskConfigError> {
        let a = self.a.fetch_config(repo).await?;
        let b = self.b.fetch_config(repo).await?;
        Ok(a.merge(&b))
    }
}

/// Warns when a task carries both a config file and inline params, the
/// combination that is on its way out.
pub struct DeprecationConfigSource {
    pub inner: Box<dyn TaskConfigSource>,
    pub stderr: Arc<dyn LogSink>,
}

#[async_trait]
impl TaskConfigSource for DeprecationConfigSource {
    async fn fetch_config(&self, repo: &SourceRepository) -> Result<TaskConfig, TaskConfigError> {
        self.stderr
            .write_line(
                "DEPRECATION WARNING: Specifying both `file:` and `config.params:` in a task step is deprecated; move the params into the task config file",
            )
            .await;
        self.inner.fetch_config(repo).await
    }
}

/// Rejects configs that cannot run.
pub struct ValidatingConfigSource {
    pub inner: Box<dyn TaskConfigSource>,
}

#[async_trait]
impl TaskConfigSource for ValidatingConfigSource {
    async fn fetch_config(&self, repo: &SourceRepository) -> Result<TaskConfig, TaskConfigError> {
        let config = self.inner.fetch_config(repo).await?;
        config.validate().map_err(TaskConfigError::Invalid)?;
        Ok(config)
    }
}
