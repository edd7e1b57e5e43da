//! TaskStore port - task record の正本（source of truth）
//!
//! Dispatcher が必要とする最小の契約だけを定義する。
//! この契約を満たす storage engine なら何でも差し替え可能。

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{CrashReport, InvalidConfigReport, StoreError, SuccessReport, TaskData, TaskSn};
use crate::store::TaskSubmission;

/// Narrow query/update interface the dispatcher drives.
///
/// # 設計原則
/// - Lease の権威はここにある。`set_task_running` が `None` を返したら claim は無効。
/// - Dispatcher は再起動で何も覚えていない。running 中の block key はここから復元する。
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Claimable records ordered by `(priority, task_sn)`, at most `limit`.
    async fn get_task_queue(&self, limit: usize) -> Result<Vec<TaskData>, StoreError>;

    /// Block keys of records currently in the running state.
    async fn get_running_block_keys(&self) -> Result<HashSet<String>, StoreError>;

    /// Confirms a claim. Returns the lease expiry, or `None` when the record
    /// can no longer be claimed.
    async fn set_task_running(
        &self,
        task_sn: TaskSn,
        worker_name: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// `false` when the record is no longer running under `report.worker_name`.
    async fn set_task_success(&self, report: &SuccessReport) -> Result<bool, StoreError>;

    async fn set_task_crash(&self, report: &CrashReport) -> Result<bool, StoreError>;

    /// Resolves by `task_sn` when present, otherwise by the running record
    /// held by `worker_name`.
    async fn set_task_invalid_config(
        &self,
        report: &InvalidConfigReport,
    ) -> Result<bool, StoreError>;

    async fn set_task_timeout(&self, task_sn: TaskSn) -> Result<bool, StoreError>;

    /// Creates one record per submission, in order. All or nothing.
    async fn submit_tasks(&self, tasks: &[TaskSubmission]) -> Result<Vec<TaskSn>, StoreError>;

    /// Store-side lease sweep. Returns how many records were timed out.
    async fn overtime_task_process(&self) -> Result<usize, StoreError>;

    /// Creates the next task of every due recurring scheme. Returns how many
    /// tasks were created. Stores without schemes create none.
    async fn process_due_schemes(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}
