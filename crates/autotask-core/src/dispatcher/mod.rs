//! Dispatcher - 中央の task 配布者
//!
//! - **engine**: queue / BlockSet / lease の管理（`DispatcherCore`）
//! - **server**: axum による RPC 公開と drain 付きの serve ループ

mod engine;
pub mod server;

pub use self::engine::{DispatcherCore, MAX_CLAIM_ATTEMPTS};
pub use self::server::{ApiError, router, run_dispatcher, serve, serve_on};

use serde::{Deserialize, Serialize};

use crate::domain::TaskSn;

/// What one `refresh_queue` pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshReport {
    /// Another refresh was in flight; nothing was done.
    pub skipped: bool,
    /// Shutdown was requested, so only the lease sweep ran.
    pub shutting_down: bool,
    /// Leases reported to the store as timed out in this pass.
    pub timed_out: Vec<TaskSn>,
    pub queued: usize,
    pub available: usize,
    pub blocked_keys: usize,
}
