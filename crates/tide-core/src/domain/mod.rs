//! Domain model (IDs, records, liveness, outcomes).
//!
//! Pure data + state transitions. Nothing here touches a store, a clock or
//! the network; callers pass `now` in explicitly.

pub mod ids;
pub mod kind;
pub mod liveness;
pub mod outcome;
pub mod state;
pub mod task;
pub mod tide;

pub use ids::{Id, IdMarker, TaskId, TideId};
pub use kind::TaskKind;
pub use liveness::{EntityRef, HeartbeatPolicy, HeartbeatPolicyView, Heartbeatable};
pub use outcome::{TaskFailure, TaskOutcome};
pub use state::TaskStatus;
pub use task::TaskRecord;
pub use tide::TideRecord;
