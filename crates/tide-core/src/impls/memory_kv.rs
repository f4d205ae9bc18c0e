//! InMemoryKvPubSub - 開発用の結果スロット + 完了通知
//!
//! # 学習ポイント
//! - スロットは同期の `RwLock<HashMap>`（`try_get` を await なしで返すため）
//! - topic ごとの `tokio::sync::broadcast` で multicast fan-out
//! - 購読者がいない topic への publish は 0 を返すだけ（Redis と同じ）

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::ports::{KvPubSub, Subscription};

const TOPIC_CAPACITY: usize = 64;

/// Cloning shares the same slots and topics.
#[derive(Debug, Clone, Default)]
pub struct InMemoryKvPubSub {
    slots: Arc<RwLock<HashMap<String, String>>>,
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
}

impl InMemoryKvPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every topic; live subscriptions observe a closed channel.
    pub fn close_all_topics(&self) {
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn prune(&self, topic: &str) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        if topics
            .get(topic)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            topics.remove(topic);
        }
    }
}

#[async_trait]
impl KvPubSub for InMemoryKvPubSub {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.try_get(key)
    }

    fn try_get(&self, key: &str) -> Result<Option<String>> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        Ok(slots.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        slots.insert(key.to_string(), value);
        Ok(())
    }

    async fn publish(&self, topic: &str, message: String) -> Result<usize> {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        Ok(match topics.get(topic) {
            // send fails only when nobody is listening
            Some(sender) => sender.send(message).unwrap_or(0),
            None => 0,
        })
    }

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>> {
        let receiver = {
            let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
            topics
                .entry(topic.to_string())
                .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
                .subscribe()
        };
        Ok(Box::new(InMemorySubscription {
            owner: self.clone(),
            topic: topic.to_string(),
            receiver,
        }))
    }
}

struct InMemorySubscription {
    owner: InMemoryKvPubSub,
    topic: String,
    receiver: broadcast::Receiver<String>,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next_message(&mut self) -> Option<String> {
        match self.receiver.recv().await {
            Ok(message) => Some(message),
            // 取りこぼしても「何か起きた」ことは分かる。呼び出し側はスロットを読み直す
            Err(broadcast::error::RecvError::Lagged(_)) => Some(String::new()),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    async fn unsubscribe(self: Box<Self>) -> Result<()> {
        let InMemorySubscription {
            owner,
            topic,
            receiver,
        } = *self;
        drop(receiver);
        owner.prune(&topic);
        Ok(())
    }
}
