use thiserror::Error;

use crate::domain::{TaskFailure, TaskId, TaskKind, TideId};

#[derive(Debug, Error)]
pub enum TideError {
    /// A terminal entity was asked to run again (or was claimed twice).
    #[error("{entity} was already processed")]
    AlreadyProcessed { entity: String },

    #[error("task {task_id} failed: {failure}")]
    TaskFailed {
        task_id: TaskId,
        failure: TaskFailure,
    },

    /// The notification channel went away before a result could be observed.
    /// Distinct from `TaskFailed`: the task itself may have succeeded.
    #[error("result delivery failed for {key}: {reason}")]
    DeliveryFailure { key: String, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    /// Recorded on entities whose heartbeat expired. Never returned to callers.
    #[error("{entity} stopped sending heartbeats and was declared stuck")]
    StuckResource { entity: String },

    #[error("handler not found for task kind={0}")]
    HandlerNotFound(TaskKind),

    #[error("duplicate handler for task kind={0}")]
    DuplicateHandler(TaskKind),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("tide not found: {0}")]
    TideNotFound(TideId),

    #[error("unique constraint violated: {0}")]
    UniqueViolation(&'static str),

    #[error("json codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("store: {0}")]
    Store(String),
}

impl TideError {
    pub fn already_processed(entity: impl std::fmt::Display) -> Self {
        TideError::AlreadyProcessed {
            entity: entity.to_string(),
        }
    }

    pub fn delivery(key: impl Into<String>, reason: impl Into<String>) -> Self {
        TideError::DeliveryFailure {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// True for the handler-failure outcome (as opposed to infrastructure errors).
    pub fn is_task_failure(&self) -> bool {
        matches!(self, TideError::TaskFailed { .. })
    }
}

pub type Result<T, E = TideError> = std::result::Result<T, E>;
