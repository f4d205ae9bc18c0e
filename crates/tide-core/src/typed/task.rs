//! Task trait - 型付き Task の定義
//!
//! # 学習ポイント
//! - Associated Constants (`const KIND`)
//! - Associated Types (`type Output`) で結果の型も静的に決める

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::TaskKind;

/// Task ties a kind name to its payload type and its result type.
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct RenderReport {
///     report_id: u64,
/// }
///
/// impl Task for RenderReport {
///     const KIND: &'static str = "reports.render.v1";
///     type Output = String;
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize` / `DeserializeOwned`: payload は JSON でストアに入る
/// - `Output` も JSON で結果スロットに入る
/// - `Send + Sync + 'static`: 別タスク・blocking スレッドに渡すため
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// 命名規約: `{domain}.{action}.v{major}`
    const KIND: &'static str;

    type Output: Serialize + DeserializeOwned + Send + 'static;

    fn kind() -> TaskKind {
        TaskKind::new(Self::KIND)
    }
}
