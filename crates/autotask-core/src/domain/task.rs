//! Task data handed from the store to the dispatcher, and from the dispatcher to a worker.

use serde::{Deserialize, Serialize};

use super::ids::TaskSn;

/// Well known priority levels. Lower is more urgent; any `i32` is accepted.
pub struct Priority;

impl Priority {
    pub const MAX: i32 = 10;
    pub const SCHEME: i32 = 50;
    pub const NORMAL: i32 = 100;
    pub const IDLE: i32 = 200;
}

/// Immutable snapshot of a schedulable task, produced by the Task Store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskData {
    pub task_sn: TaskSn,
    pub name: String,
    /// Registry key of the executable unit (`Task::TYPE`).
    pub func_path: String,
    pub args_blob: String,
    pub kwargs_blob: String,
    /// Seconds.
    pub exec_time_limit: u64,
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combine: Option<i64>,
}

impl TaskData {
    /// Scheduling order key: `(priority asc, task_sn asc)`.
    pub fn order_key(&self) -> (i32, TaskSn) {
        (self.priority, self.task_sn)
    }

    pub fn to_payload(&self) -> TaskPayload {
        TaskPayload {
            task_sn: self.task_sn,
            name: self.name.clone(),
            func_path: self.func_path.clone(),
            args_blob: self.args_blob.clone(),
            kwargs_blob: self.kwargs_blob.clone(),
            exec_time_limit: self.exec_time_limit,
        }
    }
}

/// What a worker receives on a successful claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub task_sn: TaskSn,
    pub name: String,
    pub func_path: String,
    pub args_blob: String,
    pub kwargs_blob: String,
    pub exec_time_limit: u64,
}
