//! InMemoryRecordStore - 開発用・テスト用の正本
//!
//! # 実装詳細
//! - `Arc<tokio::sync::Mutex<StoreState>>` を複数の coordinator で共有する
//! - `begin()` は `lock_owned()` でストア全体をロックする（行ロックより粗いが、
//!   排他性の保証は同じ）
//! - トランザクションは状態のコピーに書き込み、`commit` でまとめて反映する
//!   （commit せずに drop すれば rollback）
//! - task の挿入順を別に持つ（FixedClock の下では ULID が単調にならないため）

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::{EntityRef, TaskId, TaskKind, TaskRecord, TaskStatus, TideId, TideRecord};
use crate::error::{Result, TideError};
use crate::ports::{RecordStore, StoreTransaction, TaskCounts};

const UNIQUE_UNFINISHED_TIDE: &str = "unique_unfinished_tide";

#[derive(Debug, Clone, Default)]
struct StoreState {
    tides: HashMap<TideId, TideRecord>,
    tide_order: Vec<TideId>,
    tasks: HashMap<TaskId, TaskRecord>,
    task_order: Vec<TaskId>,
}

impl StoreState {
    fn running_tide(&self) -> Option<&TideRecord> {
        self.tide_order
            .iter()
            .filter_map(|id| self.tides.get(id))
            .find(|tide| tide.is_running())
    }

    fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts::default();
        for task in self.tasks.values() {
            match task.status() {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Succeeded => counts.succeeded += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
            if task.stuck {
                counts.stuck += 1;
            }
        }
        counts
    }
}

/// Shared in-memory record store.
///
/// Cloning shares the same state, so several coordinators built from clones
/// behave like processes sharing one database.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRecordStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(InMemoryTransaction { guard, staged }))
    }

    async fn insert_task(&self, task: TaskRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&task.id) {
            return Err(TideError::UniqueViolation("task_pkey"));
        }
        state.task_order.push(task.id);
        state.tasks.insert(task.id, task);
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>> {
        Ok(self.state.lock().await.tasks.get(&id).cloned())
    }

    async fn get_tide(&self, id: TideId) -> Result<Option<TideRecord>> {
        Ok(self.state.lock().await.tides.get(&id).cloned())
    }

    async fn list_tides(&self) -> Result<Vec<TideRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .tide_order
            .iter()
            .filter_map(|id| state.tides.get(id).cloned())
            .collect())
    }

    async fn touch(&self, entity: EntityRef, at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock().await;
        match entity {
            EntityRef::Tide(id) => {
                let tide = state.tides.get_mut(&id).ok_or(TideError::TideNotFound(id))?;
                if !tide.is_running() {
                    return Ok(false);
                }
                tide.last_alive_at = at;
                Ok(true)
            }
            EntityRef::Task(id) => {
                let task = state.tasks.get_mut(&id).ok_or(TideError::TaskNotFound(id))?;
                if !task.is_running() {
                    return Ok(false);
                }
                task.last_alive_at = at;
                Ok(true)
            }
        }
    }

    async fn task_counts(&self) -> Result<TaskCounts> {
        Ok(self.state.lock().await.counts())
    }
}

struct InMemoryTransaction {
    guard: OwnedMutexGuard<StoreState>,
    staged: StoreState,
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn running_tide_for_update(&mut self) -> Result<Option<TideRecord>> {
        Ok(self.staged.running_tide().cloned())
    }

    async fn insert_tide(&mut self, tide: TideRecord) -> Result<()> {
        if tide.is_running() && self.staged.running_tide().is_some() {
            return Err(TideError::UniqueViolation(UNIQUE_UNFINISHED_TIDE));
        }
        if self.staged.tides.contains_key(&tide.id) {
            return Err(TideError::UniqueViolation("tide_pkey"));
        }
        self.staged.tide_order.push(tide.id);
        self.staged.tides.insert(tide.id, tide);
        Ok(())
    }

    async fn update_tide(&mut self, tide: &TideRecord) -> Result<()> {
        if tide.is_running()
            && self
                .staged
                .running_tide()
                .is_some_and(|running| running.id != tide.id)
        {
            return Err(TideError::UniqueViolation(UNIQUE_UNFINISHED_TIDE));
        }
        let slot = self
            .staged
            .tides
            .get_mut(&tide.id)
            .ok_or(TideError::TideNotFound(tide.id))?;
        *slot = tide.clone();
        Ok(())
    }

    async fn next_pending_task_for_update(
        &mut self,
        kind: &TaskKind,
    ) -> Result<Option<TaskRecord>> {
        let staged = &self.staged;
        Ok(staged
            .task_order
            .iter()
            .filter_map(|id| staged.tasks.get(id))
            .find(|task| &task.kind == kind && task.is_running() && task.is_pending())
            .cloned())
    }

    async fn task_for_update(&mut self, id: TaskId) -> Result<Option<TaskRecord>> {
        Ok(self.staged.tasks.get(&id).cloned())
    }

    async fn started_tasks_for_update(&mut self) -> Result<Vec<TaskRecord>> {
        let staged = &self.staged;
        Ok(staged
            .task_order
            .iter()
            .filter_map(|id| staged.tasks.get(id))
            .filter(|task| task.is_running() && !task.is_pending())
            .cloned()
            .collect())
    }

    async fn update_task(&mut self, task: &TaskRecord) -> Result<()> {
        let slot = self
            .staged
            .tasks
            .get_mut(&task.id)
            .ok_or(TideError::TaskNotFound(task.id))?;
        *slot = task.clone();
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let InMemoryTransaction { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::time::Duration;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn tide() -> TideRecord {
        TideRecord::new(TideId::from_ulid(Ulid::new()), t0())
    }

    fn task(kind: &str) -> TaskRecord {
        TaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            TaskKind::new(kind),
            json!({}),
            false,
            t0(),
        )
    }

    #[tokio::test]
    async fn second_running_tide_is_rejected() {
        let store = InMemoryRecordStore::new();

        let mut tx = store.begin().await.unwrap();
        tx.insert_tide(tide()).await.unwrap();
        let err = tx.insert_tide(tide()).await.unwrap_err();
        assert!(matches!(err, TideError::UniqueViolation(UNIQUE_UNFINISHED_TIDE)));
        tx.commit().await.unwrap();

        assert_eq!(store.list_tides().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retired_tide_frees_the_slot() {
        let store = InMemoryRecordStore::new();
        let mut first = tide();

        let mut tx = store.begin().await.unwrap();
        tx.insert_tide(first.clone()).await.unwrap();
        first.retire(t0(), true).unwrap();
        tx.update_tide(&first).await.unwrap();
        tx.insert_tide(tide()).await.unwrap();
        tx.commit().await.unwrap();

        let tides = store.list_tides().await.unwrap();
        assert_eq!(tides.len(), 2);
        assert!(tides[0].stuck);
        assert!(tides[1].is_running());
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = InMemoryRecordStore::new();

        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_tide(tide()).await.unwrap();
        }

        assert!(store.list_tides().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_tasks_come_out_in_insertion_order() {
        let store = InMemoryRecordStore::new();
        let first = task("a");
        let other_kind = task("b");
        let second = task("a");
        store.insert_task(first.clone()).await.unwrap();
        store.insert_task(other_kind).await.unwrap();
        store.insert_task(second.clone()).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let mut claimed = tx
            .next_pending_task_for_update(&TaskKind::new("a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, first.id);
        claimed.mark_started(t0()).unwrap();
        tx.update_task(&claimed).await.unwrap();

        let next = tx
            .next_pending_task_for_update(&TaskKind::new("a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, second.id);
        tx.commit().await.unwrap();

        let counts = store.task_counts().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.running, 1);
    }

    #[tokio::test]
    async fn transactions_are_exclusive() {
        let store = InMemoryRecordStore::new();
        let tx = store.begin().await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), store.begin()).await;
        assert!(blocked.is_err());

        drop(tx);
        assert!(store.begin().await.is_ok());
    }

    #[tokio::test]
    async fn touch_only_writes_while_running() {
        let store = InMemoryRecordStore::new();
        let mut record = task("a");
        store.insert_task(record.clone()).await.unwrap();

        let later = t0() + chrono::Duration::seconds(3);
        assert!(store.touch(EntityRef::Task(record.id), later).await.unwrap());
        assert_eq!(
            store.get_task(record.id).await.unwrap().unwrap().last_alive_at,
            later
        );

        let mut tx = store.begin().await.unwrap();
        record.mark_started(t0()).unwrap();
        record.mark_succeeded(t0()).unwrap();
        tx.update_task(&record).await.unwrap();
        tx.commit().await.unwrap();

        let much_later = t0() + chrono::Duration::minutes(1);
        assert!(!store.touch(EntityRef::Task(record.id), much_later).await.unwrap());
    }

    #[tokio::test]
    async fn touch_unknown_entity_is_an_error() {
        let store = InMemoryRecordStore::new();
        let id = TideId::from_ulid(Ulid::new());
        let err = store.touch(EntityRef::Tide(id), t0()).await.unwrap_err();
        assert!(matches!(err, TideError::TideNotFound(missing) if missing == id));
    }
}
