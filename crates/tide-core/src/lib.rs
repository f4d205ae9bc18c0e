//! tide-core
//!
//! Single-active-run coordination for background tasks shared by several
//! processes.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, kind, liveness, tide, task, outcome, state）
//! - **ports**: 抽象化レイヤー（RecordStore, KvPubSub, Clock, IdGenerator）
//! - **impls**: 実装（InMemoryRecordStore, InMemoryKvPubSub）
//! - **typed**: 型付き Task API（Task trait, Handler / SyncHandler, TaskRegistry）
//! - **app**: 協調ロジック（heartbeat, result channel, executor, reaper, coordinator, runner）
//! - **config**: TideConfig（環境変数 / JSON）
//! - **error**: TideError

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod typed;

pub use app::{
    BuildError, CoordinatorBuilder, CoordinatorReport, EnsuredTide, SubmitOptions,
    TideCoordinator, TideRunner,
};
pub use config::TideConfig;
pub use domain::{TaskFailure, TaskId, TaskKind, TaskStatus, TideId};
pub use error::{Result, TideError};
pub use typed::{Handler, SyncHandler, Task};
