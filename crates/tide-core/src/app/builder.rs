//! CoordinatorBuilder - coordinator の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）: 期待される kind に handler が無ければ build() で落ちる
//! - ports の既定値（in-memory 実装, SystemClock, ULID）

use std::sync::Arc;

use super::coordinator::TideCoordinator;
use super::executor::TaskExecutor;
use super::reaper::AbandonedTaskReaper;
use super::result_channel::ResultChannel;
use crate::config::TideConfig;
use crate::domain::TaskKind;
use crate::error::TideError;
use crate::impls::{InMemoryKvPubSub, InMemoryRecordStore};
use crate::ports::{Clock, IdGenerator, KvPubSub, RecordStore, SystemClock, UlidGenerator};
use crate::typed::{Handler, SyncHandler, Task, TaskRegistry};

/// CoordinatorBuilder wires ports, handlers and configuration together.
///
/// # 使用例
/// ```ignore
/// let coordinator = CoordinatorBuilder::new()
///     .store(store)
///     .kv(kv)
///     .config(TideConfig::from_env()?)
///     .register::<RenderReport, _>(RenderHandler)?
///     .expect_kinds(&["reports.render.v1"])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - expect_kinds()（または `TideConfig::task_kinds`）で期待される kind を指定
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 不足があれば BuildError を返す
pub struct CoordinatorBuilder {
    store: Option<Arc<dyn RecordStore>>,
    kv: Option<Arc<dyn KvPubSub>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    config: TideConfig,
    registry: TaskRegistry,
    expected_kinds: Option<Vec<TaskKind>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing task kinds: {0:?}. These kinds were expected but have no handler.")]
    MissingTaskKinds(Vec<String>),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CoordinatorBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            kv: None,
            clock: None,
            ids: None,
            config: TideConfig::default(),
            registry: TaskRegistry::new(),
            expected_kinds: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn kv(mut self, kv: Arc<dyn KvPubSub>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn config(mut self, config: TideConfig) -> Self {
        self.config = config;
        self
    }

    /// Async handler を登録
    pub fn register<T: Task, H: Handler<T> + 'static>(mut self, handler: H) -> Result<Self, TideError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    /// 同期 handler を登録（blocking スレッドで実行される）
    pub fn register_sync<T: Task, H: SyncHandler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, TideError> {
        self.registry.register_sync::<T, H>(handler)?;
        Ok(self)
    }

    /// 期待される kind のリストを設定（`TideConfig::task_kinds` より優先）
    pub fn expect_kinds(mut self, kinds: &[&str]) -> Self {
        self.expected_kinds = Some(kinds.iter().map(|&kind| TaskKind::new(kind)).collect());
        self
    }

    /// # 検証
    /// - `TideConfig::validate` に通らなければ `BuildError::InvalidConfig`
    /// - 期待される kind が全て登録されているかチェック
    /// - 不足があれば `BuildError::MissingTaskKinds`
    ///
    /// drive 順は `TideConfig::task_kinds`、空なら登録順。
    pub fn build(self) -> Result<TideCoordinator, BuildError> {
        self.config
            .validate()
            .map_err(|e| BuildError::InvalidConfig(e.to_string()))?;

        let configured = self.config.kinds();
        let expected = self.expected_kinds.clone().unwrap_or_else(|| configured.clone());

        let missing: Vec<String> = expected
            .iter()
            .chain(configured.iter())
            .filter(|kind| !self.registry.contains(kind))
            .map(|kind| kind.to_string())
            .fold(Vec::new(), |mut acc, kind| {
                if !acc.contains(&kind) {
                    acc.push(kind);
                }
                acc
            });
        if !missing.is_empty() {
            return Err(BuildError::MissingTaskKinds(missing));
        }

        let kinds = if configured.is_empty() {
            self.registry.kinds().to_vec()
        } else {
            configured
        };

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryRecordStore::new()));
        let kv = self.kv.unwrap_or_else(|| Arc::new(InMemoryKvPubSub::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));

        let policy = self.config.heartbeat_policy();
        let registry = Arc::new(self.registry);
        let results = ResultChannel::new(kv);

        let executor = Arc::new(TaskExecutor::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&registry),
            results.clone(),
            policy,
        ));
        let reaper =
            AbandonedTaskReaper::new(Arc::clone(&store), Arc::clone(&clock), results, policy);

        Ok(TideCoordinator::new(
            store,
            clock,
            ids,
            registry,
            self.config,
            kinds,
            executor,
            reaper,
        ))
    }
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
