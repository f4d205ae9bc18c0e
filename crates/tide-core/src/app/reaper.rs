//! AbandonedTaskReaper - heartbeat が止まった task の回収
//!
//! # フロー
//! 1. 排他トランザクションで started かつ未完了の task を取得
//! 2. heartbeat が interval + grace より古いものを選ぶ
//! 3. 結果スロットに失敗 outcome を書く → `stuck = true` で Failed にする → commit
//! 4. 待っている呼び出し側を起こすために通知
//!
//! 再キューはしない（handler は 1 task につき高々 1 回しか呼ばれない）。

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use super::executor::OutcomeChannel;
use crate::domain::{HeartbeatPolicy, Heartbeatable, TaskFailure, TaskId, TaskOutcome};
use crate::error::{Result, TideError};
use crate::ports::{Clock, RecordStore};

pub struct AbandonedTaskReaper {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    results: OutcomeChannel,
    policy: HeartbeatPolicy,
}

impl AbandonedTaskReaper {
    pub fn new(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        results: OutcomeChannel,
        policy: HeartbeatPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            results,
            policy,
        }
    }

    /// Fail every running task whose heartbeat expired. Returns the reaped ids.
    pub async fn reap(&self) -> Result<Vec<TaskId>> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let mut reaped = Vec::new();
        for mut task in tx.started_tasks_for_update().await? {
            if !task.is_stuck(&self.policy, now) {
                continue;
            }
            let failure = TaskFailure::new(
                TideError::StuckResource {
                    entity: task.id.to_string(),
                }
                .to_string(),
            );
            let outcome: TaskOutcome<Value> = TaskOutcome::Failed(failure.clone());
            self.results.store(task.id, &outcome).await?;
            task.mark_abandoned(now, failure)?;
            tx.update_task(&task).await?;

            warn!(
                task_id = %task.id,
                kind = %task.kind,
                last_alive_at = %task.last_alive_at,
                "task heartbeat expired; marked stuck"
            );
            reaped.push(task.id);
        }

        if reaped.is_empty() {
            return Ok(reaped);
        }
        tx.commit().await?;

        for id in &reaped {
            self.results.notify(*id).await?;
        }
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::result_channel::ResultChannel;
    use crate::domain::{TaskKind, TaskRecord, TaskStatus};
    use crate::impls::{InMemoryKvPubSub, InMemoryRecordStore};
    use crate::ports::FixedClock;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    async fn started_task(store: &InMemoryRecordStore, at: DateTime<Utc>) -> TaskId {
        let mut task = TaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            TaskKind::new("test.slow.v1"),
            json!(null),
            false,
            at,
        );
        let id = task.id;
        store.insert_task(task.clone()).await.unwrap();
        let mut tx = store.begin().await.unwrap();
        task.mark_started(at).unwrap();
        tx.update_task(&task).await.unwrap();
        tx.commit().await.unwrap();
        id
    }

    #[tokio::test]
    async fn expired_task_is_failed_stuck_and_published() {
        let store = InMemoryRecordStore::new();
        let clock = Arc::new(FixedClock::new(t0()));
        let results: OutcomeChannel = ResultChannel::new(Arc::new(InMemoryKvPubSub::new()));
        let reaper = AbandonedTaskReaper::new(
            Arc::new(store.clone()),
            clock.clone(),
            results.clone(),
            HeartbeatPolicy::default(),
        );

        let abandoned = started_task(&store, t0()).await;
        let fresh = started_task(&store, t0() + chrono::Duration::seconds(6)).await;

        let waiter = tokio::spawn({
            let results = results.clone();
            async move { results.wait_for_result(abandoned).await }
        });

        clock.advance(chrono::Duration::seconds(9));
        assert_eq!(reaper.reap().await.unwrap(), vec![abandoned]);

        let record = store.get_task(abandoned).await.unwrap().unwrap();
        assert!(record.stuck);
        assert_eq!(record.status(), TaskStatus::Failed);
        assert!(record.error.unwrap().message.contains("declared stuck"));
        assert_eq!(
            store.get_task(fresh).await.unwrap().unwrap().status(),
            TaskStatus::Running
        );

        let outcome = waiter.await.unwrap().unwrap();
        assert!(!outcome.is_success());
        assert_eq!(store.task_counts().await.unwrap().stuck, 1);
    }

    #[tokio::test]
    async fn nothing_to_reap_within_grace() {
        let store = InMemoryRecordStore::new();
        let clock = Arc::new(FixedClock::new(t0()));
        let reaper = AbandonedTaskReaper::new(
            Arc::new(store.clone()),
            clock.clone(),
            ResultChannel::new(Arc::new(InMemoryKvPubSub::new())),
            HeartbeatPolicy::default(),
        );
        started_task(&store, t0()).await;

        clock.advance(chrono::Duration::seconds(8));
        assert!(reaper.reap().await.unwrap().is_empty());
    }
}
