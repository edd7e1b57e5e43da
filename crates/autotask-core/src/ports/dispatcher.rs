//! Dispatcher ports - worker / cluster / 管理者から見た dispatcher
//!
//! 実装は 2 つ:
//! - `DispatcherCore` 自身（同一プロセス、テスト用）
//! - `HttpDispatcherClient`（RPC 越し）

use async_trait::async_trait;

use crate::app::status::DispatcherStatus;
use crate::dispatcher::RefreshReport;
use crate::domain::{
    ClusterState, CrashReport, GetTaskReply, InvalidConfigReport, SuccessReport, TaskSn,
};
use crate::rpc::RpcError;
use crate::store::TaskSubmission;

/// Calls made by clusters and workers.
#[async_trait]
pub trait DispatcherApi: Send + Sync {
    /// Returns the dispatcher status code, or `MALFORMED_PING`.
    async fn ping(&self, state: &ClusterState) -> Result<i32, RpcError>;

    async fn get_task(
        &self,
        worker_name: &str,
        combine: Option<i64>,
    ) -> Result<GetTaskReply, RpcError>;

    async fn task_success(&self, report: &SuccessReport) -> Result<bool, RpcError>;

    async fn task_crash(&self, report: &CrashReport) -> Result<bool, RpcError>;

    async fn invalid_config(&self, report: &InvalidConfigReport) -> Result<bool, RpcError>;
}

/// Operator calls.
#[async_trait]
pub trait DispatcherAdmin: Send + Sync {
    async fn refresh(&self) -> Result<RefreshReport, RpcError>;

    async fn status(&self) -> Result<DispatcherStatus, RpcError>;

    async fn shutdown(&self) -> Result<String, RpcError>;

    async fn submit(&self, tasks: &[TaskSubmission]) -> Result<Vec<TaskSn>, RpcError>;
}
