//! Lease state of one queued task.

use chrono::{DateTime, Utc};

use crate::domain::{TaskData, TaskSn};

/// Dispatcher-owned wrapper around one `TaskData`.
///
/// State transitions:
/// - available -> claimed (worker set) -> leased (lease_end set) -> done
/// - claimed -> available (store error, unclaim)
/// - claimed -> done (store rejected the claim)
///
/// `worker_name` is `Some` exactly while the task is leased; `finish` clears it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskState {
    data: TaskData,
    worker_name: Option<String>,
    lease_end: Option<DateTime<Utc>>,
    done: bool,
}

impl TaskState {
    pub fn new(data: TaskData) -> Self {
        Self {
            data,
            worker_name: None,
            lease_end: None,
            done: false,
        }
    }

    pub fn data(&self) -> &TaskData {
        &self.data
    }

    pub fn task_sn(&self) -> TaskSn {
        self.data.task_sn
    }

    pub fn block_key(&self) -> Option<&str> {
        self.data.block_key.as_deref()
    }

    pub fn worker_name(&self) -> Option<&str> {
        self.worker_name.as_deref()
    }

    pub fn lease_end(&self) -> Option<DateTime<Utc>> {
        self.lease_end
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Held by a worker and not yet terminated.
    pub fn is_claimed(&self) -> bool {
        self.worker_name.is_some() && !self.done
    }

    /// Eligible for a claim, ignoring block keys.
    pub fn is_available(&self) -> bool {
        self.worker_name.is_none() && !self.done
    }

    pub fn claim(&mut self, worker_name: &str) {
        self.worker_name = Some(worker_name.to_string());
        self.lease_end = None;
    }

    pub fn confirm(&mut self, lease_end: DateTime<Utc>) {
        self.lease_end = Some(lease_end);
    }

    pub fn unclaim(&mut self) {
        self.worker_name = None;
        self.lease_end = None;
    }

    /// The store refused the claim: the record moved on without us.
    pub fn reject(&mut self) {
        self.unclaim();
        self.done = true;
    }

    /// Terminal outcome reported (success, crash, invalid config or timeout).
    pub fn finish(&mut self) {
        self.unclaim();
        self.done = true;
    }

    /// Lease confirmed and `lease_end + grace` already in the past.
    pub fn lease_expired(&self, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
        self.is_claimed() && self.lease_end.is_some_and(|end| end + grace < now)
    }
}
