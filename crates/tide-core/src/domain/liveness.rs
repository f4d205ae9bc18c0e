//! Heartbeat policy and the stuck predicate shared by tides and tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::ids::{TaskId, TideId};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(4);
pub const DEFAULT_HEARTBEAT_GRACE_PERIOD: Duration = Duration::from_secs(4);

/// How often an entity refreshes `last_alive_at`, and how much slack it gets
/// before it is declared stuck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    pub interval: Duration,
    pub grace_period: Duration,
}

impl HeartbeatPolicy {
    pub const fn new(interval: Duration, grace_period: Duration) -> Self {
        Self {
            interval,
            grace_period,
        }
    }

    /// interval + grace. Saturates instead of overflowing for absurd configs.
    pub fn stuck_after(&self) -> chrono::Duration {
        let total = self.interval.saturating_add(self.grace_period);
        chrono::Duration::from_std(total).unwrap_or(chrono::Duration::MAX)
    }

    /// `last_alive_at < now - interval - grace`.
    ///
    /// Exactly interval+grace old is still alive; one tick older is stuck.
    pub fn is_stuck(&self, last_alive_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match now.checked_sub_signed(self.stuck_after()) {
            Some(deadline) => last_alive_at < deadline,
            None => false,
        }
    }
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HEARTBEAT_GRACE_PERIOD)
    }
}

/// Anything that carries a `last_alive_at` timestamp refreshed by a heartbeat.
pub trait Heartbeatable {
    fn entity(&self) -> EntityRef;

    fn last_alive_at(&self) -> DateTime<Utc>;

    /// Heartbeats only run while this is true.
    fn is_running(&self) -> bool;

    fn is_stuck(&self, policy: &HeartbeatPolicy, now: DateTime<Utc>) -> bool {
        self.is_running() && policy.is_stuck(self.last_alive_at(), now)
    }
}

/// Reference to a heartbeating entity in the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityRef {
    Tide(TideId),
    Task(TaskId),
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Tide(id) => id.fmt(f),
            EntityRef::Task(id) => id.fmt(f),
        }
    }
}

/// Serializable snapshot of a policy, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPolicyView {
    pub interval_ms: u64,
    pub grace_period_ms: u64,
}

impl From<HeartbeatPolicy> for HeartbeatPolicyView {
    fn from(policy: HeartbeatPolicy) -> Self {
        Self {
            interval_ms: policy.interval.as_millis() as u64,
            grace_period_ms: policy.grace_period.as_millis() as u64,
        }
    }
}
