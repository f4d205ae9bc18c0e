//! TaskExecutor - Task の状態機械
//!
//! # フロー（1 タスク）
//! 1. claim: 排他トランザクションの中で Pending → Running（`started_at = now`）
//! 2. task の heartbeat を開始
//! 3. handler を実行（panic も失敗として捕まえる）
//! 4. heartbeat を止める（成功でも失敗でも必ず）
//! 5. 結果スロットに outcome を書く → レコードを終端状態にする → 通知
//!
//! 5 の順番で、`succeeded` が見えた時点でスロットには必ず値がある。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::liveness::spawn_heartbeat;
use super::result_channel::{ResultChannel, result_key};
use crate::domain::{
    EntityRef, HeartbeatPolicy, TaskFailure, TaskId, TaskKind, TaskOutcome, TaskRecord, TaskStatus,
};
use crate::error::{Result, TideError};
use crate::ports::{Clock, RecordStore};
use crate::typed::{DynHandler, TaskRegistry};

pub type OutcomeChannel = ResultChannel<TaskOutcome<Value>>;

/// Runs claimed tasks and serves their results.
pub struct TaskExecutor {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    registry: Arc<TaskRegistry>,
    results: OutcomeChannel,
    policy: HeartbeatPolicy,
}

impl TaskExecutor {
    pub fn new(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        registry: Arc<TaskRegistry>,
        results: OutcomeChannel,
        policy: HeartbeatPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            registry,
            results,
            policy,
        }
    }

    fn handler_for(&self, kind: &TaskKind) -> Result<Arc<dyn DynHandler>> {
        self.registry
            .get(kind)
            .ok_or_else(|| TideError::HandlerNotFound(kind.clone()))
    }

    /// Claim `task_id` and run it to completion.
    ///
    /// Fails with `AlreadyProcessed` if the task was already claimed (by this
    /// or any other process) and with `TaskFailed` if the handler failed.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn execute(&self, task_id: TaskId) -> Result<Value> {
        let mut tx = self.store.begin().await?;
        let mut task = tx
            .task_for_update(task_id)
            .await?
            .ok_or(TideError::TaskNotFound(task_id))?;
        let handler = self.handler_for(&task.kind)?;
        task.mark_started(self.clock.now())?;
        tx.update_task(&task).await?;
        tx.commit().await?;

        self.run_claimed(task, handler).await
    }

    /// Claim the oldest pending task of `kind` and run it.
    ///
    /// `Ok(None)` when nothing of that kind is pending.
    pub async fn execute_next(&self, kind: &TaskKind) -> Result<Option<(TaskId, Result<Value>)>> {
        let handler = self.handler_for(kind)?;

        let mut tx = self.store.begin().await?;
        let Some(mut task) = tx.next_pending_task_for_update(kind).await? else {
            return Ok(None);
        };
        task.mark_started(self.clock.now())?;
        tx.update_task(&task).await?;
        tx.commit().await?;

        let task_id = task.id;
        Ok(Some((task_id, self.run_claimed(task, handler).await)))
    }

    async fn run_claimed(&self, task: TaskRecord, handler: Arc<dyn DynHandler>) -> Result<Value> {
        let task_id = task.id;
        debug!(%task_id, kind = %task.kind, "task started");

        let heartbeat = spawn_heartbeat(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            EntityRef::Task(task_id),
            self.policy.interval,
        );

        let invoked = AssertUnwindSafe(handler.handle_dyn(task.payload))
            .catch_unwind()
            .await;

        heartbeat.stop().await;

        let outcome = match invoked {
            Ok(Ok(value)) => TaskOutcome::Succeeded(value),
            Ok(Err(failure)) => TaskOutcome::Failed(failure),
            Err(panic) => TaskOutcome::Failed(TaskFailure::from_panic(panic.as_ref())),
        };

        self.finish(task_id, outcome).await
    }

    async fn finish(&self, task_id: TaskId, outcome: TaskOutcome<Value>) -> Result<Value> {
        let mut tx = self.store.begin().await?;
        let mut record = tx
            .task_for_update(task_id)
            .await?
            .ok_or(TideError::TaskNotFound(task_id))?;

        if !record.is_running() {
            // reaped while we were running; its recorded outcome stands
            drop(tx);
            warn!(%task_id, "task finished after it was declared stuck; discarding late outcome");
            return Err(TideError::TaskFailed {
                task_id,
                failure: record.error.unwrap_or_default(),
            });
        }

        self.results.store(task_id, &outcome).await?;

        let now = self.clock.now();
        match &outcome {
            TaskOutcome::Succeeded(_) => record.mark_succeeded(now)?,
            TaskOutcome::Failed(failure) => record.mark_failed(now, failure.clone())?,
        }
        tx.update_task(&record).await?;
        tx.commit().await?;

        // record is already terminal
        if let Err(first) = self.results.notify(task_id).await {
            debug!(%task_id, error = %first, "notify failed; retrying once");
            if let Err(e) = self.results.notify(task_id).await {
                warn!(%task_id, error = %e, "completion notify failed; waiters fall back to the slot");
            }
        }

        match &outcome {
            TaskOutcome::Succeeded(_) => debug!(%task_id, "task succeeded"),
            TaskOutcome::Failed(failure) => debug!(%task_id, error = %failure, "task failed"),
        }
        outcome.into_result(task_id)
    }

    /// Wait for the terminal outcome of `task_id`.
    ///
    /// Finished tasks answer immediately without subscribing.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn await_result(&self, task_id: TaskId) -> Result<Value> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(TideError::TaskNotFound(task_id))?;

        match task.succeeded() {
            Some(false) => Err(TideError::TaskFailed {
                task_id,
                failure: task.error.unwrap_or_default(),
            }),
            Some(true) => self
                .results
                .read(task_id)
                .await?
                .ok_or_else(|| {
                    TideError::delivery(result_key(task_id), "result slot empty for a succeeded task")
                })?
                .into_result(task_id),
            None => self.results.wait_for_result(task_id).await?.into_result(task_id),
        }
    }

    pub async fn status(&self, task_id: TaskId) -> Result<TaskStatus> {
        self.store
            .get_task(task_id)
            .await?
            .map(|task| task.status())
            .ok_or(TideError::TaskNotFound(task_id))
    }

    /// Non-suspending read. `Ok(None)` while no outcome is published.
    pub fn try_result(&self, task_id: TaskId) -> Result<Option<Value>> {
        match self.results.try_read(task_id)? {
            None => Ok(None),
            Some(outcome) => outcome.into_result(task_id).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskKind;
    use crate::impls::{InMemoryKvPubSub, InMemoryRecordStore};
    use crate::ports::{KvPubSub, Subscription, SystemClock};
    use crate::typed::{Handler, SyncHandler, Task};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use ulid::Ulid;

    #[derive(Debug, Serialize, Deserialize)]
    struct Echo {
        value: Value,
    }

    impl Task for Echo {
        const KIND: &'static str = "test.echo.v1";
        type Output = Value;
    }

    /// Echoes the payload after `gate` is released; counts invocations.
    struct EchoHandler {
        calls: Arc<AtomicUsize>,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl Handler<Echo> for EchoHandler {
        async fn handle(&self, task: Echo) -> std::result::Result<Value, TaskFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if task.value == json!("boom") {
                return Err(TaskFailure::new("boom").with_trace("EchoHandler::handle"));
            }
            if task.value == json!("panic") {
                panic!("handler exploded");
            }
            Ok(task.value)
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Count {
        n: u32,
    }

    impl Task for Count {
        const KIND: &'static str = "test.count.v1";
        type Output = Vec<u32>;
    }

    struct CountHandler;

    impl SyncHandler<Count> for CountHandler {
        fn handle(&self, task: Count) -> std::result::Result<Vec<u32>, TaskFailure> {
            Ok((0..task.n).collect())
        }
    }

    struct Fixture {
        store: InMemoryRecordStore,
        executor: Arc<TaskExecutor>,
        calls: Arc<AtomicUsize>,
        clock: Arc<dyn Clock>,
    }

    fn fixture(gate: Option<Arc<Notify>>) -> Fixture {
        fixture_with_kv(gate, Arc::new(InMemoryKvPubSub::new()))
    }

    fn fixture_with_kv(gate: Option<Arc<Notify>>, kv: Arc<dyn KvPubSub>) -> Fixture {
        let store = InMemoryRecordStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = TaskRegistry::new();
        registry
            .register::<Echo, _>(EchoHandler {
                calls: calls.clone(),
                gate,
            })
            .unwrap();
        registry.register_sync::<Count, _>(CountHandler).unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let executor = Arc::new(TaskExecutor::new(
            Arc::new(store.clone()),
            clock.clone(),
            Arc::new(registry),
            ResultChannel::new(kv),
            HeartbeatPolicy::default(),
        ));
        Fixture {
            store,
            executor,
            calls,
            clock,
        }
    }

    async fn submit(f: &Fixture, kind: &str, payload: Value) -> TaskId {
        let record = TaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            TaskKind::new(kind),
            payload,
            false,
            f.clock.now(),
        );
        let id = record.id;
        f.store.insert_task(record).await.unwrap();
        id
    }

    #[tokio::test]
    async fn successful_task_publishes_its_result() {
        let f = fixture(None);
        let id = submit(&f, Echo::KIND, json!({"value": {"x": 1}})).await;

        assert_eq!(f.executor.execute(id).await.unwrap(), json!({"x": 1}));
        assert_eq!(f.executor.await_result(id).await.unwrap(), json!({"x": 1}));
        assert_eq!(f.executor.status(id).await.unwrap(), TaskStatus::Succeeded);
        assert_eq!(f.executor.try_result(id).unwrap(), Some(json!({"x": 1})));
    }

    #[tokio::test]
    async fn failing_task_records_error_and_raises() {
        let f = fixture(None);
        let id = submit(&f, Echo::KIND, json!({"value": "boom"})).await;

        let err = f.executor.execute(id).await.unwrap_err();
        assert!(matches!(&err, TideError::TaskFailed { failure, .. } if failure.message == "boom"));

        let record = f.store.get_task(id).await.unwrap().unwrap();
        let error = record.error.unwrap();
        assert_eq!(error.message, "boom");
        assert_eq!(error.trace.as_deref(), Some("EchoHandler::handle"));
        assert_eq!(f.executor.status(id).await.unwrap(), TaskStatus::Failed);

        let awaited = f.executor.await_result(id).await.unwrap_err();
        assert!(matches!(awaited, TideError::TaskFailed { failure, .. } if failure.message == "boom"));
    }

    #[tokio::test]
    async fn panicking_handler_is_a_task_failure() {
        let f = fixture(None);
        let id = submit(&f, Echo::KIND, json!({"value": "panic"})).await;

        let err = f.executor.execute(id).await.unwrap_err();
        assert!(
            matches!(&err, TideError::TaskFailed { failure, .. } if failure.message == "handler exploded")
        );
        assert!(f.store.get_task(id).await.unwrap().unwrap().finished_at.is_some());
    }

    #[tokio::test]
    async fn sync_handler_runs_to_completion() {
        let f = fixture(None);
        let id = submit(&f, Count::KIND, json!({"n": 3})).await;

        assert_eq!(f.executor.execute(id).await.unwrap(), json!([0, 1, 2]));
    }

    #[tokio::test]
    async fn executing_twice_is_already_processed() {
        let f = fixture(None);
        let id = submit(&f, Echo::KIND, json!({"value": 1})).await;
        f.executor.execute(id).await.unwrap();
        let finished_at = f.store.get_task(id).await.unwrap().unwrap().finished_at;

        let err = f.executor.execute(id).await.unwrap_err();
        assert!(matches!(err, TideError::AlreadyProcessed { .. }));
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            f.store.get_task(id).await.unwrap().unwrap().finished_at,
            finished_at
        );
    }

    #[tokio::test]
    async fn await_is_idempotent() {
        let f = fixture(None);
        let id = submit(&f, Echo::KIND, json!({"value": [1, 2]})).await;
        f.executor.execute(id).await.unwrap();

        let first = f.executor.await_result(id).await.unwrap();
        let second = f.executor.await_result(id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_waiters_started_early_all_get_the_result() {
        let gate = Arc::new(Notify::new());
        let f = fixture(Some(gate.clone()));
        let id = submit(&f, Echo::KIND, json!({"value": "late"})).await;

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let executor = f.executor.clone();
                tokio::spawn(async move { executor.await_result(id).await })
            })
            .collect();
        let running = tokio::spawn({
            let executor = f.executor.clone();
            async move { executor.execute(id).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.executor.status(id).await.unwrap(), TaskStatus::Running);
        assert_eq!(f.executor.try_result(id).unwrap(), None);
        gate.notify_one();

        running.await.unwrap().unwrap();
        for waiter in waiters {
            let result = tokio::time::timeout(Duration::from_secs(5), waiter)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(result.unwrap(), json!("late"));
        }
    }

    #[tokio::test]
    async fn waiters_are_woken_by_failure_too() {
        let gate = Arc::new(Notify::new());
        let f = fixture(Some(gate.clone()));
        let id = submit(&f, Echo::KIND, json!({"value": "boom"})).await;

        let waiter = tokio::spawn({
            let executor = f.executor.clone();
            async move { executor.await_result(id).await }
        });
        let running = tokio::spawn({
            let executor = f.executor.clone();
            async move { executor.execute(id).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();

        assert!(running.await.unwrap().is_err());
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, TideError::TaskFailed { failure, .. } if failure.message == "boom"));
    }

    #[tokio::test]
    async fn execute_next_takes_pending_tasks_in_order() {
        let f = fixture(None);
        let first = submit(&f, Echo::KIND, json!({"value": 1})).await;
        let second = submit(&f, Echo::KIND, json!({"value": 2})).await;
        let kind = TaskKind::new(Echo::KIND);

        let (id, result) = f.executor.execute_next(&kind).await.unwrap().unwrap();
        assert_eq!((id, result.unwrap()), (first, json!(1)));
        let (id, _) = f.executor.execute_next(&kind).await.unwrap().unwrap();
        assert_eq!(id, second);
        assert!(f.executor.execute_next(&kind).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_kind_is_not_claimed() {
        let f = fixture(None);
        let id = submit(&f, "test.unknown.v1", json!(null)).await;

        let err = f.executor.execute(id).await.unwrap_err();
        assert!(matches!(err, TideError::HandlerNotFound(_)));
        assert_eq!(f.executor.status(id).await.unwrap(), TaskStatus::Pending);
    }

    #[tokio::test]
    async fn await_unknown_task_is_not_found() {
        let f = fixture(None);
        let id = TaskId::from_ulid(Ulid::new());
        let err = f.executor.await_result(id).await.unwrap_err();
        assert!(matches!(err, TideError::TaskNotFound(missing) if missing == id));
    }

    /// KV that stores slots but refuses every publish.
    struct MuteKv {
        inner: InMemoryKvPubSub,
        publishes: AtomicUsize,
    }

    #[async_trait]
    impl KvPubSub for MuteKv {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }

        fn try_get(&self, key: &str) -> Result<Option<String>> {
            self.inner.try_get(key)
        }

        async fn set(&self, key: &str, value: String) -> Result<()> {
            self.inner.set(key, value).await
        }

        async fn publish(&self, _topic: &str, _message: String) -> Result<usize> {
            self.publishes.fetch_add(1, Ordering::SeqCst);
            Err(TideError::Store("publish refused".into()))
        }

        async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>> {
            self.inner.subscribe(topic).await
        }
    }

    #[tokio::test]
    async fn failed_notify_keeps_the_outcome() {
        let kv = Arc::new(MuteKv {
            inner: InMemoryKvPubSub::new(),
            publishes: AtomicUsize::new(0),
        });
        let f = fixture_with_kv(None, kv.clone());
        let id = submit(&f, Echo::KIND, json!({"value": "kept"})).await;

        assert_eq!(f.executor.execute(id).await.unwrap(), json!("kept"));
        assert_eq!(kv.publishes.load(Ordering::SeqCst), 2);
        assert_eq!(f.executor.status(id).await.unwrap(), TaskStatus::Succeeded);
        assert_eq!(f.executor.await_result(id).await.unwrap(), json!("kept"));
    }
}
