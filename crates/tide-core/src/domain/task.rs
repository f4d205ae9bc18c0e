//! Task record: timestamps, error slot and the derived lifecycle predicates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::kind::TaskKind;
use super::liveness::{EntityRef, Heartbeatable};
use super::outcome::TaskFailure;
use super::state::TaskStatus;
use crate::error::{Result, TideError};

/// One unit of schedulable work.
///
/// Design:
/// - Status is never stored; it is derived from `started_at`, `finished_at`
///   and `error`.
/// - `finished_at` is written once and never cleared.
/// - The result payload does not live here; it lives in the result slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub kind: TaskKind,

    /// Input handed to the handler.
    pub payload: serde_json::Value,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_alive_at: DateTime<Utc>,

    /// Set when the task was reaped after its heartbeat stopped.
    pub stuck: bool,

    pub error: Option<TaskFailure>,

    /// Whether creation alone triggers execution in the creating process.
    pub autorun: bool,
}

impl TaskRecord {
    pub fn new(
        id: TaskId,
        kind: TaskKind,
        payload: serde_json::Value,
        autorun: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            kind,
            payload,
            created_at: now,
            started_at: None,
            finished_at: None,
            last_alive_at: now,
            stuck: false,
            error: None,
            autorun,
        }
    }

    /// Not finished yet. Note: also true while still pending.
    pub fn is_running(&self) -> bool {
        self.finished_at.is_none()
    }

    pub fn is_pending(&self) -> bool {
        self.started_at.is_none()
    }

    /// `None` while running, then `Some(error.is_none())`.
    pub fn succeeded(&self) -> Option<bool> {
        if self.is_running() {
            None
        } else {
            Some(self.error.is_none())
        }
    }

    pub fn status(&self) -> TaskStatus {
        match self.succeeded() {
            Some(true) => TaskStatus::Succeeded,
            Some(false) => TaskStatus::Failed,
            None if self.is_pending() => TaskStatus::Pending,
            None => TaskStatus::Running,
        }
    }

    /// Pending -> Running. This is the claim step; callers run it inside an
    /// exclusive transaction.
    pub fn mark_started(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.is_running() || !self.is_pending() {
            return Err(TideError::already_processed(self.id));
        }
        self.started_at = Some(now);
        self.last_alive_at = now;
        Ok(())
    }

    /// Running -> Succeeded.
    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.finish(now)
    }

    /// Running -> Failed.
    pub fn mark_failed(&mut self, now: DateTime<Utc>, failure: TaskFailure) -> Result<()> {
        self.finish(now)?;
        self.error = Some(failure);
        Ok(())
    }

    /// Running -> Failed, after the task's heartbeat expired.
    pub fn mark_abandoned(&mut self, now: DateTime<Utc>, failure: TaskFailure) -> Result<()> {
        self.mark_failed(now, failure)?;
        self.stuck = true;
        Ok(())
    }

    fn finish(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.is_running() {
            return Err(TideError::already_processed(self.id));
        }
        // started_at <= finished_at
        let finished_at = match self.started_at {
            Some(started_at) => now.max(started_at),
            None => {
                self.started_at = Some(now);
                now
            }
        };
        self.finished_at = Some(finished_at);
        Ok(())
    }
}

impl Heartbeatable for TaskRecord {
    fn entity(&self) -> EntityRef {
        EntityRef::Task(self.id)
    }

    fn last_alive_at(&self) -> DateTime<Utc> {
        self.last_alive_at
    }

    fn is_running(&self) -> bool {
        TaskRecord::is_running(self)
    }
}
