//! Typed - 型付き Task API
//!
//! このモジュールは func_path の typo を型で排除し、
//! Handler との対応付けを静的に保証します。
//!
//! # 二層構造
//! - **表層（Typed）**: `Task` trait, `Handler<T>` trait - 型安全
//! - **内部（Dyn）**: `DynHandler` / `PreparedCall` trait - object-safe, type erasure

pub mod codec;
pub mod context;
pub mod handler;
pub mod registry;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

// 主要な trait/型 を再エクスポート
pub use self::codec::{CodecError, PayloadCodec};
pub use self::context::ExecContext;
pub use self::handler::{CallFuture, DynHandler, Handler, PreparedCall, TypedHandler};
pub use self::registry::{RegistryError, TypedRegistry};
pub use self::task::Task;
