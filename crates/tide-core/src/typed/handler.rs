//! Handler traits - Task を実行する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (`Handler<T>`, `SyncHandler<T>`)
//! - Object-safe trait (`DynHandler`)
//! - Type erasure パターン (`TypedHandler<T, H>` → `DynHandler`)
//!
//! 同期 handler は `spawn_blocking` で実行するので、runtime のワーカースレッドを塞ぎません。

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use super::task::Task;
use crate::domain::{TaskFailure, TaskKind};

/// Async handler for one task type.
///
/// # 使用例
/// ```ignore
/// struct RenderHandler;
///
/// #[async_trait]
/// impl Handler<RenderReport> for RenderHandler {
///     async fn handle(&self, task: RenderReport) -> Result<String, TaskFailure> {
///         Ok(format!("report {}", task.report_id))
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T) -> Result<T::Output, TaskFailure>;
}

/// Blocking handler for one task type. Runs on the blocking thread pool.
pub trait SyncHandler<T: Task>: Send + Sync {
    fn handle(&self, task: T) -> Result<T::Output, TaskFailure>;
}

/// Object-safe handler over JSON payloads.
///
/// `TypedHandler` / `BlockingHandler` を `DynHandler` に変換することで
/// `HashMap<TaskKind, Arc<dyn DynHandler>>` に格納できます。
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(&self, payload: serde_json::Value)
    -> Result<serde_json::Value, TaskFailure>;

    fn kind(&self) -> TaskKind;
}

fn decode<T: Task>(payload: serde_json::Value) -> Result<T, TaskFailure> {
    serde_json::from_value(payload)
        .map_err(|e| TaskFailure::new(format!("payload decode for {}: {e}", T::KIND)))
}

fn encode<T: Task>(output: T::Output) -> Result<serde_json::Value, TaskFailure> {
    serde_json::to_value(output)
        .map_err(|e| TaskFailure::new(format!("result encode for {}: {e}", T::KIND)))
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn(T)>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(
        &self,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, TaskFailure> {
        let task = decode::<T>(payload)?;
        encode::<T>(self.handler.handle(task).await?)
    }

    fn kind(&self) -> TaskKind {
        T::kind()
    }
}

pub struct BlockingHandler<T: Task, H: SyncHandler<T>> {
    handler: Arc<H>,
    _marker: PhantomData<fn(T)>,
}

impl<T: Task, H: SyncHandler<T>> BlockingHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: SyncHandler<T> + 'static> DynHandler for BlockingHandler<T, H> {
    async fn handle_dyn(
        &self,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, TaskFailure> {
        let task = decode::<T>(payload)?;
        let handler = Arc::clone(&self.handler);
        let output = tokio::task::spawn_blocking(move || handler.handle(task))
            .await
            .map_err(|join_err| {
                if join_err.is_panic() {
                    TaskFailure::from_panic(join_err.into_panic().as_ref())
                } else {
                    TaskFailure::new(format!("blocking handler cancelled: {join_err}"))
                }
            })??;
        encode::<T>(output)
    }

    fn kind(&self) -> TaskKind {
        T::kind()
    }
}
