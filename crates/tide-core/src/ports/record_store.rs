//! RecordStore port - Tide / Task レコードの正本（source of truth）
//!
//! 複数プロセスが同じストアを共有する前提です。
//! - グローバルに一意でなければならない遷移（tide の作成・退役、task の claim）は
//!   `begin()` で開いた排他トランザクションの中で行う
//! - 「running な tide は高々 1 つ」はストア側の制約として強制する
//! - heartbeat は `touch()` でタイムスタンプ 1 列だけを書く

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{EntityRef, TaskId, TaskKind, TaskRecord, TideId, TideRecord};
use crate::error::Result;

/// Number of tasks per derived status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Failed tasks that were reaped after their heartbeat stopped.
    pub stuck: usize,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Open an exclusive transaction.
    ///
    /// Rows read through the transaction are locked until it ends (the
    /// `SELECT ... FOR UPDATE` discipline). Dropping it without `commit`
    /// rolls back.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;

    async fn insert_task(&self, task: TaskRecord) -> Result<()>;

    async fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>>;

    async fn get_tide(&self, id: TideId) -> Result<Option<TideRecord>>;

    /// All tides, oldest first.
    async fn list_tides(&self) -> Result<Vec<TideRecord>>;

    /// Heartbeat write: sets `last_alive_at` and nothing else.
    ///
    /// Returns `false` (and writes nothing) once the entity is finished.
    async fn touch(&self, entity: EntityRef, at: DateTime<Utc>) -> Result<bool>;

    async fn task_counts(&self) -> Result<TaskCounts>;
}

#[async_trait]
pub trait StoreTransaction: Send {
    /// The running tide, locked.
    async fn running_tide_for_update(&mut self) -> Result<Option<TideRecord>>;

    /// Fails with `UniqueViolation` if another tide is still running.
    async fn insert_tide(&mut self, tide: TideRecord) -> Result<()>;

    async fn update_tide(&mut self, tide: &TideRecord) -> Result<()>;

    /// Oldest pending task of `kind`, locked.
    async fn next_pending_task_for_update(&mut self, kind: &TaskKind)
    -> Result<Option<TaskRecord>>;

    async fn task_for_update(&mut self, id: TaskId) -> Result<Option<TaskRecord>>;

    /// Every started-but-unfinished task, locked.
    async fn started_tasks_for_update(&mut self) -> Result<Vec<TaskRecord>>;

    async fn update_task(&mut self, task: &TaskRecord) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}
