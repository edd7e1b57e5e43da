//! Status - dispatcher のステータスクエリ
//!
//! `status()` の返り値。運用者が「誰が何を掴んでいるか」「どの cluster が
//! 生きているか」を一度に確認するためのもの。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ClusterState, DispatcherId, StatusCode, TaskSn};
use crate::observability::QueueCounts;

/// Dispatcher-wide lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherState {
    Running,
    /// Shutdown requested, claimed tasks may still be running.
    Draining,
    /// Shutdown requested and nothing is claimed any more.
    Drained,
}

/// Last ping received from one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub state: ClusterState,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningTask {
    pub task_sn: TaskSn,
    pub worker_name: String,
    /// `None` while the claim is still being confirmed by the store.
    pub lease_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherStatus {
    pub name: String,
    pub instance: DispatcherId,
    pub state: DispatcherState,
    pub code: StatusCode,
    pub clusters: BTreeMap<String, ClusterSnapshot>,
    pub running_tasks: Vec<RunningTask>,
    pub counts: QueueCounts,
}

impl DispatcherStatus {
    pub fn online_clusters(&self) -> usize {
        self.clusters
            .values()
            .filter(|c| c.state.status == crate::domain::ClusterStatus::Online)
            .count()
    }
}
