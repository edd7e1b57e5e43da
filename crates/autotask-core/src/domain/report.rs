//! Claim replies and outcome reports exchanged between workers and the dispatcher.

use serde::{Deserialize, Serialize};

use super::ids::TaskSn;
use super::task::TaskPayload;

/// Returned by `ping` when the cluster state could not be parsed.
pub const MALFORMED_PING: i32 = -99;

/// Dispatcher health as seen by clusters and workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    ShuttingDown,
    /// Nothing unclaimed is queued.
    Idle,
    /// At least one queued task is unclaimed.
    Ready,
}

impl StatusCode {
    pub const fn code(self) -> i32 {
        match self {
            Self::ShuttingDown => -1,
            Self::Idle => 0,
            Self::Ready => 1,
        }
    }
}

/// Result of a claim attempt. `-1 = shutting down, 0 = empty, 1 = busy`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GetTaskReply {
    Claimed(TaskPayload),
    /// Refresh in flight or the claim could not be confirmed; retry shortly.
    Busy,
    Empty,
    ShuttingDown,
}

impl GetTaskReply {
    /// Numeric sentinel for the non-payload variants.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Claimed(_) => None,
            Self::ShuttingDown => Some(-1),
            Self::Empty => Some(0),
            Self::Busy => Some(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessReport {
    pub task_sn: TaskSn,
    /// Claimant; a report from anyone else is stale and ignored.
    pub worker_name: String,
    pub result: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_warn: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashReport {
    pub task_sn: TaskSn,
    pub worker_name: String,
    pub message: String,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_warn: Option<String>,
}

/// Sent when a worker cannot resolve or decode the task it was handed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidConfigReport {
    pub worker_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_sn: Option<TaskSn>,
    pub detail: String,
}
