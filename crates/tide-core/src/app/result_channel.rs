//! Result channel - 結果スロット + 完了通知
//!
//! # 学習ポイント
//! - スロット（KV）が正本、通知はただの「起こす合図」
//! - publish は「スロットに書く → 通知する」の順番を崩さない
//! - wait は「読む → subscribe → もう一度読む → 通知を待つ → 読む」で競合を潰す
//!
//! 通知が重複しても取りこぼしても、読み手は必ずスロットを読み直すので結果は壊れません。

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::domain::TaskId;
use crate::error::{Result, TideError};
use crate::ports::{KvPubSub, Subscription};

const DONE_MESSAGE: &str = "done";

/// Durable slot key for `id`.
pub fn result_key(id: TaskId) -> String {
    format!("{id}:result")
}

/// Notification topic for `id`.
pub fn done_topic(id: TaskId) -> String {
    format!("{id}:done")
}

/// Result channel for values of type `R`, stored as JSON.
pub struct ResultChannel<R> {
    kv: Arc<dyn KvPubSub>,
    _marker: PhantomData<fn() -> R>,
}

impl<R> Clone for ResultChannel<R> {
    fn clone(&self) -> Self {
        Self {
            kv: Arc::clone(&self.kv),
            _marker: PhantomData,
        }
    }
}

impl<R: Serialize + DeserializeOwned> ResultChannel<R> {
    pub fn new(kv: Arc<dyn KvPubSub>) -> Self {
        Self {
            kv,
            _marker: PhantomData,
        }
    }

    /// Store, then notify.
    pub async fn publish(&self, id: TaskId, result: &R) -> Result<()> {
        self.store(id, result).await?;
        self.notify(id).await
    }

    /// Slot write only. Callers that also persist a record between the two
    /// steps use this plus [`notify`](Self::notify).
    pub async fn store(&self, id: TaskId, result: &R) -> Result<()> {
        let encoded = serde_json::to_string(result)?;
        self.kv.set(&result_key(id), encoded).await
    }

    pub async fn notify(&self, id: TaskId) -> Result<()> {
        let woken = self.kv.publish(&done_topic(id), DONE_MESSAGE.to_string()).await?;
        debug!(task_id = %id, woken, "result published");
        Ok(())
    }

    pub async fn read(&self, id: TaskId) -> Result<Option<R>> {
        decode(self.kv.get(&result_key(id)).await?)
    }

    /// `Ok(None)` means "not ready"; never suspends.
    pub fn try_read(&self, id: TaskId) -> Result<Option<R>> {
        decode(self.kv.try_get(&result_key(id))?)
    }

    /// Wait until the slot for `id` is filled and return it.
    ///
    /// Fails with `DeliveryFailure` if the channel closes before a result is
    /// observed. Once a result is in hand, a failing unsubscribe is only
    /// logged.
    pub async fn wait_for_result(&self, id: TaskId) -> Result<R> {
        if let Some(result) = self.read(id).await? {
            return Ok(result);
        }

        let topic = done_topic(id);
        let mut subscription = self.kv.subscribe(&topic).await?;

        let outcome = self.wait_subscribed(id, subscription.as_mut()).await;

        let unsubscribed = subscription.unsubscribe().await;
        let result = outcome?;
        if let Err(e) = unsubscribed {
            warn!(%topic, error = %e, "unsubscribe failed after the result arrived");
        }
        Ok(result)
    }

    async fn wait_subscribed(&self, id: TaskId, subscription: &mut dyn Subscription) -> Result<R> {
        // published between the first read and subscribe
        if let Some(result) = self.read(id).await? {
            return Ok(result);
        }

        loop {
            match subscription.next_message().await {
                Some(_) => {
                    if let Some(result) = self.read(id).await? {
                        return Ok(result);
                    }
                    // spurious wake-up; the slot is authoritative
                }
                None => {
                    return Err(TideError::delivery(
                        done_topic(id),
                        "channel closed before a result was published",
                    ));
                }
            }
        }
    }
}

fn decode<R: DeserializeOwned>(raw: Option<String>) -> Result<Option<R>> {
    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(TideError::from)
}
