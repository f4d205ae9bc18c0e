//! KvPubSub port - 結果スロット（KV）と完了通知（pub/sub）
//!
//! Redis のような共有サービスを想定しています。
//! - `get` / `set`: 任意の文字列キーに対する永続的な読み書き
//! - `publish` / `subscribe`: 生きている購読者への at-least-once 配送、順序保証なし
//!
//! 通知はただの「起こす合図」で、ペイロードは載せません。

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait KvPubSub: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Non-suspending read for callers that must not await.
    ///
    /// Backends that cannot answer without I/O return `Ok(None)` ("not ready").
    fn try_get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String) -> Result<()>;

    /// Returns how many live subscribers were notified.
    async fn publish(&self, topic: &str, message: String) -> Result<usize>;

    /// Every subscriber of a topic receives every message published after
    /// `subscribe` returns (multicast fan-out).
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Next message, or `None` once the channel is closed.
    async fn next_message(&mut self) -> Option<String>;

    async fn unsubscribe(self: Box<Self>) -> Result<()>;
}
