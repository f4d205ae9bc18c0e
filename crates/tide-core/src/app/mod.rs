//! App - アプリケーション層
//!
//! ports を組み合わせて協調ロジックを実装します。
//!
//! # 主要コンポーネント
//! - **liveness**: heartbeat ループと cancel ハンドル
//! - **ResultChannel**: 結果スロット + 完了通知
//! - **TaskExecutor**: task の状態機械（claim → 実行 → 公開）
//! - **AbandonedTaskReaper**: heartbeat が止まった task の回収
//! - **TideCoordinator**: tide の排他と drive ループ
//! - **TideRunner**: drive ループの spawn と shutdown
//! - **CoordinatorBuilder**: 構築とワイヤリング

pub mod builder;
pub mod coordinator;
pub mod executor;
pub mod liveness;
pub mod reaper;
pub mod result_channel;
pub mod runner;
pub mod status;

pub use self::builder::{BuildError, CoordinatorBuilder};
pub use self::coordinator::{EnsuredTide, SubmitOptions, TideCoordinator};
pub use self::executor::TaskExecutor;
pub use self::liveness::{HeartbeatHandle, spawn_heartbeat};
pub use self::reaper::AbandonedTaskReaper;
pub use self::result_channel::ResultChannel;
pub use self::runner::TideRunner;
pub use self::status::CoordinatorReport;
