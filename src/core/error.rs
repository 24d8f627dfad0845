//! Engine error taxonomy.
//!
//! Every failure the lifecycle engine can report. Nothing here is retried
//! automatically; callers decide whether to try again.

use std::fmt::Display;

use thiserror::Error;

use crate::domain::PipelineState;

/// Result alias used throughout the engine
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Errors raised by the store, registry, and lifecycle controller
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("pipeline '{0}' not found")]
    PipelineNotFound(String),

    #[error("stage '{stage_id}' not found in pipeline '{pipeline_id}'")]
    StageNotFound {
        pipeline_id: String,
        stage_id: String,
    },

    #[error("no pipeline selected; pass a pipeline id or load one first")]
    NoCurrentPipeline,

    #[error("pipeline '{0}' already exists")]
    AlreadyExists(String),

    #[error("stage id '{stage_id}' is already used in pipeline '{pipeline_id}'")]
    DuplicateStageId {
        pipeline_id: String,
        stage_id: String,
    },

    #[error("stage type '{0}' is not registered")]
    UnknownStageType(String),

    #[error("cannot {operation} pipeline '{pipeline_id}' while it is {state}")]
    InvalidStateTransition {
        pipeline_id: String,
        operation: &'static str,
        state: PipelineState,
    },

    #[error("pipeline '{0}' has not been built")]
    NotBuilt(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("stage '{stage_id}' could not resolve its configuration: {reason}")]
    BuildFailed { stage_id: String, reason: String },

    #[error("invalid identifier '{id}': {reason}")]
    InvalidIdentifier { id: String, reason: &'static str },

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("executor '{executor}' failed: {reason}")]
    ExecutionFailed { executor: String, reason: String },
}

impl EngineError {
    /// Wrap a storage-layer error with the action that was being attempted
    pub fn persistence(action: impl Display, err: impl Display) -> Self {
        Self::Persistence(format!("{}: {}", action, err))
    }

    /// Stable machine-readable category
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PipelineNotFound(_) | Self::StageNotFound { .. } | Self::NoCurrentPipeline => {
                "not_found"
            }
            Self::AlreadyExists(_) => "already_exists",
            Self::DuplicateStageId { .. } => "duplicate_stage_id",
            Self::UnknownStageType(_) => "unknown_stage_type",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::NotBuilt(_) => "not_built",
            Self::Persistence(_) => "persistence_failure",
            Self::BuildFailed { .. } => "build_failed",
            Self::InvalidIdentifier { .. } | Self::InvalidPattern { .. } => "invalid_request",
            Self::ExecutionFailed { .. } => "execution_failed",
        }
    }

    /// Whether this error means the addressed pipeline does not exist
    pub fn is_pipeline_missing(&self) -> bool {
        matches!(self, Self::PipelineNotFound(_))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::persistence("serialization", err)
    }
}
