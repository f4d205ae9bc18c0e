//! TideCoordinator - tide の排他と監督
//!
//! # 学習ポイント
//! - `ensure()`: 排他トランザクションの中で「取得 or 作成 or 退役して作り直し」
//! - 自分が作った tide だけを drive する（それ以外は standby で ensure を繰り返す）
//! - drive ループ: reaper → kind ごとに claim + execute → 何もなければ少し sleep
//!
//! tide の heartbeat と task の heartbeat は独立して動きます。

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::executor::TaskExecutor;
use super::liveness::spawn_heartbeat;
use super::reaper::AbandonedTaskReaper;
use super::status::CoordinatorReport;
use crate::config::TideConfig;
use crate::domain::{
    EntityRef, HeartbeatPolicy, Heartbeatable, TaskId, TaskKind, TaskRecord, TaskStatus, TideId,
    TideRecord,
};
use crate::error::{Result, TideError};
use crate::ports::{Clock, IdGenerator, RecordStore};
use crate::typed::{Task, TaskRegistry};

/// Result of [`TideCoordinator::ensure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsuredTide {
    /// The running tide after the call.
    pub tide: TideRecord,

    /// True if this call inserted `tide`.
    pub created: bool,

    /// The stuck tide retired to make room, if any.
    pub replaced: Option<TideRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// `None` falls back to `TideConfig::default_autorun`.
    pub autorun: Option<bool>,
}

impl SubmitOptions {
    pub fn autorun(autorun: bool) -> Self {
        Self {
            autorun: Some(autorun),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriveExit {
    Shutdown,
    RetiredElsewhere,
}

pub struct TideCoordinator {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    registry: Arc<TaskRegistry>,
    config: TideConfig,
    policy: HeartbeatPolicy,
    kinds: Vec<TaskKind>,
    executor: Arc<TaskExecutor>,
    reaper: AbandonedTaskReaper,
}

impl TideCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        registry: Arc<TaskRegistry>,
        config: TideConfig,
        kinds: Vec<TaskKind>,
        executor: Arc<TaskExecutor>,
        reaper: AbandonedTaskReaper,
    ) -> Self {
        let policy = config.heartbeat_policy();
        Self {
            store,
            clock,
            ids,
            registry,
            config,
            policy,
            kinds,
            executor,
            reaper,
        }
    }

    pub fn config(&self) -> &TideConfig {
        &self.config
    }

    /// Kinds driven by this coordinator, in drive order.
    pub fn kinds(&self) -> &[TaskKind] {
        &self.kinds
    }

    /// Get the running tide, creating one if none exists.
    ///
    /// A running tide whose heartbeat expired is retired as stuck and
    /// replaced inside the same exclusive transaction.
    #[instrument(skip(self))]
    pub async fn ensure(&self) -> Result<EnsuredTide> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let ensured = match tx.running_tide_for_update().await? {
            Some(tide) if !tide.is_stuck(&self.policy, now) => EnsuredTide {
                tide,
                created: false,
                replaced: None,
            },
            Some(mut stuck) => {
                stuck.retire(now, true)?;
                tx.update_tide(&stuck).await?;
                let fresh = TideRecord::new(self.ids.generate_tide_id(), now);
                tx.insert_tide(fresh.clone()).await?;
                warn!(
                    stuck_tide = %stuck.id,
                    last_alive_at = %stuck.last_alive_at,
                    tide_id = %fresh.id,
                    "tide heartbeat expired; retired as stuck and replaced"
                );
                EnsuredTide {
                    tide: fresh,
                    created: true,
                    replaced: Some(stuck),
                }
            }
            None => {
                let fresh = TideRecord::new(self.ids.generate_tide_id(), now);
                tx.insert_tide(fresh.clone()).await?;
                info!(tide_id = %fresh.id, "tide created");
                EnsuredTide {
                    tide: fresh,
                    created: true,
                    replaced: None,
                }
            }
        };

        tx.commit().await?;
        Ok(ensured)
    }

    /// Supervise until `shutdown` flips to true (or its sender is dropped).
    ///
    /// Drives a tide this process created; otherwise stands by and re-runs
    /// `ensure()` every heartbeat interval.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            match self.ensure().await {
                Ok(ensured) if ensured.created => {
                    if self.drive(ensured.tide.id, &mut shutdown).await == DriveExit::Shutdown {
                        return;
                    }
                    continue;
                }
                Ok(ensured) => debug!(tide_id = %ensured.tide.id, "tide owned elsewhere; standing by"),
                Err(e) => warn!(error = %e, "ensure failed; retrying"),
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(self.policy.interval) => {}
            }
        }
    }

    async fn drive(&self, tide_id: TideId, shutdown: &mut watch::Receiver<bool>) -> DriveExit {
        let heartbeat = spawn_heartbeat(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            EntityRef::Tide(tide_id),
            self.policy.interval,
        );
        info!(%tide_id, kinds = ?self.kinds, "driving tide");

        let exit = loop {
            if *shutdown.borrow() {
                break DriveExit::Shutdown;
            }

            match self.store.get_tide(tide_id).await {
                Ok(Some(tide)) if tide.is_running() => {}
                Ok(_) => break DriveExit::RetiredElsewhere,
                Err(e) => warn!(%tide_id, error = %e, "could not re-read tide"),
            }

            let executed = self.drive_pass(shutdown).await;
            if executed > 0 {
                continue;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break DriveExit::Shutdown;
                    }
                }
                _ = tokio::time::sleep(self.config.idle_poll_interval()) => {}
            }
        };

        heartbeat.stop().await;

        match exit {
            DriveExit::Shutdown => {
                if let Err(e) = self.retire(tide_id).await {
                    warn!(%tide_id, error = %e, "could not retire tide on shutdown");
                }
            }
            DriveExit::RetiredElsewhere => {
                warn!(%tide_id, "tide was retired by another process; stopping")
            }
        }
        exit
    }

    /// One pass: reap, then drain each kind in order. Returns how many tasks ran.
    async fn drive_pass(&self, shutdown: &watch::Receiver<bool>) -> usize {
        if self.config.reap_abandoned_tasks
            && let Err(e) = self.reaper.reap().await
        {
            warn!(error = %e, "reaping abandoned tasks failed");
        }

        let mut executed = 0;
        for kind in &self.kinds {
            while !*shutdown.borrow() {
                match self.executor.execute_next(kind).await {
                    Ok(None) => break,
                    Ok(Some((task_id, Ok(_)))) => {
                        executed += 1;
                        debug!(%task_id, %kind, "task done");
                    }
                    Ok(Some((task_id, Err(e)))) if e.is_task_failure() => {
                        executed += 1;
                        info!(%task_id, %kind, error = %e, "task failed");
                    }
                    Ok(Some((task_id, Err(e)))) => {
                        executed += 1;
                        warn!(%task_id, %kind, error = %e, "task ended with an infrastructure error; continuing");
                    }
                    Err(e) => {
                        warn!(%kind, error = %e, "claim failed; skipping kind for this pass");
                        break;
                    }
                }
            }
        }
        executed
    }

    /// Retire our own tide (not stuck). No-op if it is no longer running.
    async fn retire(&self, tide_id: TideId) -> Result<()> {
        let mut tx = self.store.begin().await?;
        match tx.running_tide_for_update().await? {
            Some(mut tide) if tide.id == tide_id => {
                tide.retire(self.clock.now(), false)?;
                tx.update_tide(&tide).await?;
                tx.commit().await?;
                info!(%tide_id, "tide retired");
            }
            _ => debug!(%tide_id, "tide already retired"),
        }
        Ok(())
    }

    pub async fn submit(&self, kind: impl Into<TaskKind> + Send, payload: Value) -> Result<TaskId> {
        self.submit_with(kind, payload, SubmitOptions::default()).await
    }

    pub async fn submit_with(
        &self,
        kind: impl Into<TaskKind> + Send,
        payload: Value,
        options: SubmitOptions,
    ) -> Result<TaskId> {
        let kind = kind.into();
        if !self.registry.contains(&kind) {
            return Err(TideError::HandlerNotFound(kind));
        }

        let autorun = options.autorun.unwrap_or(self.config.default_autorun);
        let task = TaskRecord::new(
            self.ids.generate_task_id(),
            kind,
            payload,
            autorun,
            self.clock.now(),
        );
        let task_id = task.id;
        debug!(%task_id, kind = %task.kind, autorun, "task submitted");
        self.store.insert_task(task).await?;

        if autorun {
            let executor = Arc::clone(&self.executor);
            tokio::spawn(async move {
                match executor.execute(task_id).await {
                    Ok(_) => debug!(%task_id, "autorun task done"),
                    // a driving tide got there first
                    Err(TideError::AlreadyProcessed { .. }) => {
                        debug!(%task_id, "autorun task already claimed")
                    }
                    Err(e) if e.is_task_failure() => info!(%task_id, error = %e, "autorun task failed"),
                    Err(e) => warn!(%task_id, error = %e, "autorun task errored"),
                }
            });
        }
        Ok(task_id)
    }

    pub async fn submit_task<T: Task>(&self, task: &T) -> Result<TaskId> {
        self.submit(T::kind(), serde_json::to_value(task)?).await
    }

    /// Claim and run `task_id` in this process.
    pub async fn execute(&self, task_id: TaskId) -> Result<Value> {
        self.executor.execute(task_id).await
    }

    /// Wait for the outcome; `TaskFailed` if the handler failed.
    pub async fn await_result(&self, task_id: TaskId) -> Result<Value> {
        self.executor.await_result(task_id).await
    }

    pub async fn await_task<T: Task>(&self, task_id: TaskId) -> Result<T::Output> {
        let value = self.executor.await_result(task_id).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn status(&self, task_id: TaskId) -> Result<TaskStatus> {
        self.executor.status(task_id).await
    }

    /// Non-suspending read of a published outcome.
    pub fn try_result(&self, task_id: TaskId) -> Result<Option<Value>> {
        self.executor.try_result(task_id)
    }

    pub async fn report(&self) -> Result<CoordinatorReport> {
        let tides = self.store.list_tides().await?;
        let stuck_tides = tides.iter().filter(|tide| tide.stuck).count();
        let tide = tides.into_iter().find(|tide| tide.is_running());
        Ok(CoordinatorReport {
            tide,
            stuck_tides,
            tasks: self.store.task_counts().await?,
            heartbeat: self.policy.into(),
        })
    }
}
