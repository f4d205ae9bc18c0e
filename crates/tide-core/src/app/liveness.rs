//! Liveness tracker - heartbeat ループ
//!
//! # フロー
//! 1. interval だけ sleep（cancel と select で競合させる）
//! 2. `RecordStore::touch()` で `last_alive_at` の 1 列だけを書く
//! 3. entity が finished なら終了、書き込み失敗は warn して次の tick で再試行
//!
//! cancel は sleep の境界でしか効かないので、書き込みの途中で止まることはありません。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::EntityRef;
use crate::ports::{Clock, RecordStore};

/// Owner side of a running heartbeat loop.
///
/// Dropping the handle cancels the loop; `stop()` also waits for it to exit.
pub struct HeartbeatHandle {
    cancel_tx: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl HeartbeatHandle {
    pub fn cancel(&self) {
        // ignore send error: the loop may already have exited
        let _ = self.cancel_tx.send(true);
    }

    /// Cancel and wait until the loop has exited.
    pub async fn stop(mut self) {
        self.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|join| join.is_finished())
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Start refreshing `entity`'s `last_alive_at` every `interval`.
pub fn spawn_heartbeat(
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    entity: EntityRef,
    interval: Duration,
) -> HeartbeatHandle {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let join = tokio::spawn(heartbeat_loop(store, clock, entity, interval, cancel_rx));
    HeartbeatHandle {
        cancel_tx,
        join: Some(join),
    }
}

async fn heartbeat_loop(
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    entity: EntityRef,
    interval: Duration,
    mut cancel_rx: watch::Receiver<bool>,
) {
    loop {
        if *cancel_rx.borrow() {
            break;
        }

        tokio::select! {
            changed = cancel_rx.changed() => {
                // sender dropped counts as cancel
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        match store.touch(entity, clock.now()).await {
            Ok(true) => debug!(%entity, "heartbeat"),
            Ok(false) => {
                debug!(%entity, "entity finished; heartbeat stops");
                break;
            }
            Err(e) => warn!(%entity, error = %e, "heartbeat write failed; retrying next tick"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskId, TaskRecord, TideId, TideRecord};
    use crate::error::{Result, TideError};
    use crate::impls::InMemoryRecordStore;
    use crate::ports::{FixedClock, StoreTransaction, TaskCounts};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    async fn store_with_tide() -> (InMemoryRecordStore, TideId) {
        let store = InMemoryRecordStore::new();
        let id = TideId::from_ulid(Ulid::new());
        let mut tx = store.begin().await.unwrap();
        tx.insert_tide(TideRecord::new(id, t0())).await.unwrap();
        tx.commit().await.unwrap();
        (store, id)
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_last_alive_at_every_interval() {
        let (store, id) = store_with_tide().await;
        let clock = Arc::new(FixedClock::new(t0()));

        let handle = spawn_heartbeat(
            Arc::new(store.clone()),
            clock.clone(),
            EntityRef::Tide(id),
            Duration::from_secs(4),
        );

        clock.advance(chrono::Duration::seconds(4));
        tokio::time::sleep(Duration::from_millis(4_100)).await;
        let tide = store.get_tide(id).await.unwrap().unwrap();
        assert_eq!(tide.last_alive_at, t0() + chrono::Duration::seconds(4));

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_future_refreshes() {
        let (store, id) = store_with_tide().await;
        let clock = Arc::new(FixedClock::new(t0()));

        let handle = spawn_heartbeat(
            Arc::new(store.clone()),
            clock.clone(),
            EntityRef::Tide(id),
            Duration::from_secs(4),
        );
        handle.stop().await;

        clock.advance(chrono::Duration::seconds(60));
        tokio::time::sleep(Duration::from_secs(60)).await;

        let tide = store.get_tide(id).await.unwrap().unwrap();
        assert_eq!(tide.last_alive_at, t0());
    }

    #[tokio::test(start_paused = true)]
    async fn loop_exits_once_entity_is_finished() {
        let (store, id) = store_with_tide().await;
        let clock = Arc::new(FixedClock::new(t0()));

        let handle = spawn_heartbeat(
            Arc::new(store.clone()),
            clock.clone(),
            EntityRef::Tide(id),
            Duration::from_secs(4),
        );

        let mut tx = store.begin().await.unwrap();
        let mut tide = tx.running_tide_for_update().await.unwrap().unwrap();
        tide.retire(t0(), false).unwrap();
        tx.update_tide(&tide).await.unwrap();
        tx.commit().await.unwrap();

        tokio::time::sleep(Duration::from_millis(4_100)).await;
        assert!(handle.is_finished());
    }

    /// Fails the first `failures` touches, then delegates.
    struct FlakyStore {
        inner: InMemoryRecordStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl RecordStore for FlakyStore {
        async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
            self.inner.begin().await
        }

        async fn insert_task(&self, task: TaskRecord) -> Result<()> {
            self.inner.insert_task(task).await
        }

        async fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>> {
            self.inner.get_task(id).await
        }

        async fn get_tide(&self, id: TideId) -> Result<Option<TideRecord>> {
            self.inner.get_tide(id).await
        }

        async fn list_tides(&self) -> Result<Vec<TideRecord>> {
            self.inner.list_tides().await
        }

        async fn touch(&self, entity: EntityRef, at: DateTime<Utc>) -> Result<bool> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(TideError::Store("connection reset".into()));
            }
            self.inner.touch(entity, at).await
        }

        async fn task_counts(&self) -> Result<TaskCounts> {
            self.inner.task_counts().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_is_retried_next_tick() {
        let (inner, id) = store_with_tide().await;
        let store = Arc::new(FlakyStore {
            inner: inner.clone(),
            failures: AtomicUsize::new(1),
        });
        let clock = Arc::new(FixedClock::new(t0()));

        let handle = spawn_heartbeat(store, clock.clone(), EntityRef::Tide(id), Duration::from_secs(4));

        clock.advance(chrono::Duration::seconds(4));
        tokio::time::sleep(Duration::from_millis(4_100)).await;
        assert_eq!(inner.get_tide(id).await.unwrap().unwrap().last_alive_at, t0());
        assert!(!handle.is_finished());

        clock.advance(chrono::Duration::seconds(4));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(
            inner.get_tide(id).await.unwrap().unwrap().last_alive_at,
            t0() + chrono::Duration::seconds(8)
        );

        handle.stop().await;
    }
}
