//! Tide record: one exclusive run period.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TideId;
use super::liveness::{EntityRef, Heartbeatable};
use crate::error::{Result, TideError};

/// A single run of outstanding tasks (plus any created while it runs).
///
/// At most one tide with `finished_at == None` may exist; the record store
/// enforces this as a constraint. Tides are never deleted, retired ones stay
/// as an audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TideRecord {
    pub id: TideId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_alive_at: DateTime<Utc>,
    /// Set only when the tide was force-retired after missing heartbeats.
    pub stuck: bool,
}

impl TideRecord {
    pub fn new(id: TideId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            started_at: now,
            finished_at: None,
            last_alive_at: now,
            stuck: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.finished_at.is_none()
    }

    /// Running -> Finished. Terminal; retiring twice is an error.
    pub fn retire(&mut self, now: DateTime<Utc>, stuck: bool) -> Result<()> {
        if !self.is_running() {
            return Err(TideError::already_processed(self.id));
        }
        self.finished_at = Some(now.max(self.started_at));
        self.stuck = stuck;
        Ok(())
    }
}

impl Heartbeatable for TideRecord {
    fn entity(&self) -> EntityRef {
        EntityRef::Tide(self.id)
    }

    fn last_alive_at(&self) -> DateTime<Utc> {
        self.last_alive_at
    }

    fn is_running(&self) -> bool {
        TideRecord::is_running(self)
    }
}
