//! Status - 詰まり具合の説明
//!
//! # 使用例
//! ```ignore
//! let report = coordinator.report().await?;
//! println!("{}", serde_json::to_string_pretty(&report)?);
//! ```

use serde::{Deserialize, Serialize};

use crate::domain::{HeartbeatPolicyView, TideRecord};
use crate::ports::TaskCounts;

/// Snapshot of the shared state as seen by one coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorReport {
    /// The running tide, if any.
    pub tide: Option<TideRecord>,

    /// Tides ever force-retired after missing heartbeats.
    pub stuck_tides: usize,

    pub tasks: TaskCounts,

    pub heartbeat: HeartbeatPolicyView,
}

impl CoordinatorReport {
    /// Nothing pending and nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.tasks.pending == 0 && self.tasks.running == 0
    }
}
