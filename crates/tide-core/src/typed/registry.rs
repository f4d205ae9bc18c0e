//! TaskRegistry - Handler の登録と管理
//!
//! # 学習ポイント
//! - HashMap での型消去された trait object の管理
//! - Generic methods での登録と型安全性
//! - 登録順を `Vec` で保持（tide はこの順番で kind を処理する）

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{BlockingHandler, DynHandler, Handler, SyncHandler, TypedHandler};
use super::task::Task;
use crate::domain::TaskKind;
use crate::error::{Result, TideError};

/// Maps each task kind to exactly one handler.
///
/// # 使用例
/// ```ignore
/// let mut registry = TaskRegistry::new();
/// registry.register::<RenderReport, _>(RenderHandler)?;
/// registry.register_sync::<Resize, _>(ResizeHandler)?;
///
/// let handler = registry.get(&TaskKind::new("reports.render.v1"));
/// ```
#[derive(Default, Clone)]
pub struct TaskRegistry {
    handlers: HashMap<TaskKind, Arc<dyn DynHandler>>,
    order: Vec<TaskKind>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(&mut self, handler: H) -> Result<()> {
        self.insert(Arc::new(TypedHandler::<T, H>::new(handler)))
    }

    pub fn register_sync<T: Task, H: SyncHandler<T> + 'static>(&mut self, handler: H) -> Result<()> {
        self.insert(Arc::new(BlockingHandler::<T, H>::new(handler)))
    }

    fn insert(&mut self, handler: Arc<dyn DynHandler>) -> Result<()> {
        let kind = handler.kind();
        if self.handlers.contains_key(&kind) {
            return Err(TideError::DuplicateHandler(kind));
        }
        self.order.push(kind.clone());
        self.handlers.insert(kind, handler);
        Ok(())
    }

    pub fn get(&self, kind: &TaskKind) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &TaskKind) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered kinds in registration order.
    pub fn kinds(&self) -> &[TaskKind] {
        &self.order
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("kinds", &self.order)
            .finish()
    }
}
