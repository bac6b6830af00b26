//! Store error type.

use conveyor_core::{BuildStatus, ConfigError, IdentifierError};

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("pipeline config version mismatch")]
    ConfigComparisonFailed,
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
    #[error(transparent)]
    Identifier(#[from] IdentifierError),
    #[error("illegal build status transition from {from} to {to}")]
    IllegalTransition { from: BuildStatus, to: BuildStatus },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
