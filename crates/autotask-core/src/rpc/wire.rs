//! Paths, header and request/response bodies shared by server and client.

use serde::{Deserialize, Serialize};

/// Header carrying the shared secret.
pub const AUTH_HEADER: &str = "x-autotask-key";

pub const PING: &str = "/rpc/ping";
pub const GET_TASK: &str = "/rpc/get-task";
pub const TASK_SUCCESS: &str = "/rpc/task-success";
pub const TASK_CRASH: &str = "/rpc/task-crash";
pub const INVALID_CONFIG: &str = "/rpc/invalid-config";
pub const REFRESH: &str = "/admin/refresh";
pub const STATUS: &str = "/admin/status";
pub const SHUTDOWN: &str = "/admin/shutdown";
pub const SUBMIT: &str = "/admin/submit";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetTaskRequest {
    pub worker_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combine: Option<i64>,
}

/// Admin calls without arguments still post an empty object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}
