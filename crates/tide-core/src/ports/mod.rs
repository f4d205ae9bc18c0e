//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」です。各 trait は共有サービス
//! （リレーショナル DB, Redis のような KV + pub/sub）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - RecordStore が source of truth（正本）: tide / task のライフサイクル
//! - KvPubSub は結果スロットと完了通知だけを扱う
//! - 時刻と ID は Clock / IdGenerator から受け取る（テストで差し替え可能）

pub mod clock;
pub mod id_generator;
pub mod kv_pubsub;
pub mod record_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::kv_pubsub::{KvPubSub, Subscription};
pub use self::record_store::{RecordStore, StoreTransaction, TaskCounts};
