//! Impls - ports の実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryRecordStore**: プロセス内で共有する正本
//! - **InMemoryKvPubSub**: 結果スロット + 完了通知
//!
//! どちらも clone するとデータを共有するので、1 プロセス内で複数の
//! coordinator を立てれば「複数プロセスが同じ DB / Redis を見ている」状況を再現できます。

pub mod memory_kv;
pub mod memory_store;

pub use self::memory_kv::InMemoryKvPubSub;
pub use self::memory_store::InMemoryRecordStore;
