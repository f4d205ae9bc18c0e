//! Outcome model: what ends up in a task's durable result slot.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::TaskId;
use crate::error::TideError;

/// Structured error recorded on a failed task: message + trace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl TaskFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    /// Message from `Display`, trace from the `source()` chain.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        let failure = Self::new(err.to_string());
        if chain.is_empty() {
            failure
        } else {
            failure.with_trace(chain.join("\ncaused by: "))
        }
    }

    /// Builds a failure from a `catch_unwind` payload.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "handler panicked".to_string()
        };
        Self::new(message).with_trace("panic")
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.message.fmt(f)
    }
}

impl std::error::Error for TaskFailure {}

/// Terminal outcome stored in the result slot.
///
/// The pub/sub notification never carries this; subscribers always re-read
/// the slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum TaskOutcome<R> {
    Succeeded(R),
    Failed(TaskFailure),
}

impl<R> TaskOutcome<R> {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded(_))
    }

    pub fn into_result(self, task_id: TaskId) -> Result<R, TideError> {
        match self {
            TaskOutcome::Succeeded(value) => Ok(value),
            TaskOutcome::Failed(failure) => Err(TideError::TaskFailed { task_id, failure }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use ulid::Ulid;

    #[derive(Debug, thiserror::Error)]
    #[error("outer")]
    struct Outer(#[source] Inner);

    #[derive(Debug, thiserror::Error)]
    #[error("inner")]
    struct Inner;

    #[test]
    fn failure_trace_follows_source_chain() {
        let failure = TaskFailure::from_error(&Outer(Inner));
        assert_eq!(failure.message, "outer");
        assert_eq!(failure.trace.as_deref(), Some("inner"));
    }

    #[test]
    fn failure_without_source_has_no_trace() {
        let failure = TaskFailure::from_error(&Inner);
        assert_eq!(failure.message, "inner");
        assert!(failure.trace.is_none());
    }

    #[test]
    fn panic_payloads_become_messages() {
        let str_payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        let string_payload: Box<dyn std::any::Any + Send> = Box::new(String::from("kaboom"));
        let other_payload: Box<dyn std::any::Any + Send> = Box::new(42_u8);

        assert_eq!(TaskFailure::from_panic(str_payload.as_ref()).message, "boom");
        assert_eq!(TaskFailure::from_panic(string_payload.as_ref()).message, "kaboom");
        assert_eq!(
            TaskFailure::from_panic(other_payload.as_ref()).message,
            "handler panicked"
        );
    }

    #[test]
    fn outcome_wire_shape() {
        let ok: TaskOutcome<serde_json::Value> = TaskOutcome::Succeeded(json!({"x": 1}));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"status": "succeeded", "value": {"x": 1}})
        );

        let failed: TaskOutcome<serde_json::Value> = TaskOutcome::Failed(TaskFailure::new("boom"));
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            json!({"status": "failed", "value": {"message": "boom"}})
        );
    }

    #[test]
    fn failed_outcome_maps_to_task_failed() {
        let task_id = TaskId::from_ulid(Ulid::new());
        let failed: TaskOutcome<i32> = TaskOutcome::Failed(TaskFailure::new("boom"));

        match failed.into_result(task_id) {
            Err(TideError::TaskFailed { task_id: id, failure }) => {
                assert_eq!(id, task_id);
                assert_eq!(failure.message, "boom");
            }
            other => panic!("expected TaskFailed, got {other:?}"),
        }
    }
}
