//! Typed - 型付き Task API
//!
//! kind 名の typo を型で排除し、Handler との対応付けを静的に保証します。
//!
//! # 二層構造
//! - **表層（Typed）**: `Task`, `Handler<T>`, `SyncHandler<T>` - 型安全
//! - **内部（Dyn）**: `DynHandler` - object-safe, JSON で type erasure

pub mod handler;
pub mod registry;
pub mod task;

pub use self::handler::{BlockingHandler, DynHandler, Handler, SyncHandler, TypedHandler};
pub use self::registry::TaskRegistry;
pub use self::task::Task;
