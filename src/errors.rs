// src/errors.rs

//! Crate-wide error aliases and helpers.

use thiserror::Error;

use crate::model::{PipelineId, TaskId};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// Inconsistent input: bad graph, missing base record, dangling reference.
    #[error("Structural error: {0}")]
    Structural(String),

    #[error("Cycle detected in DAG: {0}")]
    DagCycle(String),

    #[error("status is empty for {0}")]
    EmptyStatus(String),

    /// Aggregation fell through every rule; carries the per-stage summary.
    #[error("strange pipeline status, stages: {summary}")]
    StrangeStatus { summary: String },

    /// Transient infrastructure fault talking to an executor or a store.
    #[error("abnormal error: {0}")]
    Abnormal(String),

    /// Business failure caused by the user's definition; never retried.
    #[error("user error: {0}")]
    User(String),

    #[error("executor not found: {0}")]
    ExecutorNotFound(String),

    #[error("pipeline not found: {0}")]
    PipelineNotFound(PipelineId),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Faults worth retrying locally with backoff.
    pub fn is_abnormal(&self) -> bool {
        matches!(
            self,
            EngineError::Abnormal(_) | EngineError::IoError(_) | EngineError::Other(_)
        )
    }

    pub fn is_user(&self) -> bool {
        matches!(self, EngineError::User(_))
    }

    pub fn abnormal(msg: impl Into<String>) -> Self {
        EngineError::Abnormal(msg.into())
    }

    pub fn structural(msg: impl Into<String>) -> Self {
        EngineError::Structural(msg.into())
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, EngineError>;
