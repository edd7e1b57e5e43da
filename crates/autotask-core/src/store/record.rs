//! Task record: the store's single source of truth for one task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::RetryPolicy;
use crate::domain::{ErrorCode, PackageSn, Priority, RecordState, SchemeSn, TaskData, TaskSn};

/// A request to create a task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub name: String,
    pub func_path: String,
    /// JSON array of positional arguments.
    #[serde(default)]
    pub args: Value,
    /// JSON object of keyword arguments.
    #[serde(default)]
    pub kwargs: Value,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combine: Option<i64>,
    /// Seconds; store default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_time_limit: Option<u64>,
    /// Executions allowed before failing; store default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_limit: Option<u32>,
    /// Seconds; store default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<u64>,
    /// Not claimable before this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_time: Option<DateTime<Utc>>,
    /// Not claimable until this task succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_task: Option<TaskSn>,
}

fn default_priority() -> i32 {
    Priority::NORMAL
}

impl TaskSubmission {
    pub fn new(name: impl Into<String>, func_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            func_path: func_path.into(),
            args: Value::Null,
            kwargs: Value::Null,
            priority: Priority::NORMAL,
            block_key: None,
            combine: None,
            exec_time_limit: None,
            exec_limit: None,
            retry_delay: None,
            plan_time: None,
            previous_task: None,
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Value) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_block_key(mut self, key: impl Into<String>) -> Self {
        self.block_key = Some(key.into());
        self
    }

    pub fn with_combine(mut self, combine: i64) -> Self {
        self.combine = Some(combine);
        self
    }

    pub fn with_exec_time_limit(mut self, seconds: u64) -> Self {
        self.exec_time_limit = Some(seconds);
        self
    }

    pub fn with_exec_limit(mut self, executions: u32) -> Self {
        self.exec_limit = Some(executions);
        self
    }

    pub fn with_retry_delay(mut self, seconds: u64) -> Self {
        self.retry_delay = Some(seconds);
        self
    }

    pub fn with_plan_time(mut self, at: DateTime<Utc>) -> Self {
        self.plan_time = Some(at);
        self
    }

    pub fn after(mut self, previous: TaskSn) -> Self {
        self.previous_task = Some(previous);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_sn: TaskSn,
    pub name: String,
    pub func_path: String,
    pub args_blob: String,
    pub kwargs_blob: String,
    pub priority: i32,
    pub block_key: Option<String>,
    pub combine: Option<i64>,
    pub exec_time_limit: u64,
    pub exec_limit: u32,
    pub retry_delay: u64,
    pub previous_task: Option<TaskSn>,
    pub package: Option<PackageSn>,
    pub scheme: Option<SchemeSn>,

    /// Held out of the queue until resumed.
    pub paused: bool,
    /// Never handed out again; a run already in progress still reports.
    pub cancelled: bool,

    pub state: RecordState,
    pub state_time: DateTime<Utc>,
    pub plan_time: DateTime<Utc>,
    pub retry_at: DateTime<Utc>,

    pub worker_name: Option<String>,
    /// Number of times this task has been started, including the current run.
    pub execute: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub lease_end: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,

    pub result: Option<String>,
    pub exec_warn: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub detail: Option<String>,
}

impl TaskRecord {
    pub fn to_task_data(&self) -> TaskData {
        TaskData {
            task_sn: self.task_sn,
            name: self.name.clone(),
            func_path: self.func_path.clone(),
            args_blob: self.args_blob.clone(),
            kwargs_blob: self.kwargs_blob.clone(),
            exec_time_limit: self.exec_time_limit,
            priority: self.priority,
            block_key: self.block_key.clone(),
            combine: self.combine,
        }
    }

    /// Planned time and retry delay both elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.plan_time <= now && self.retry_at <= now
    }

    fn update_state(&mut self, state: RecordState, now: DateTime<Utc>) {
        self.state = state;
        self.state_time = now;
    }

    /// Claimable now, ignoring the previous task.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state.is_claimable() && !self.paused && !self.cancelled && self.is_due(now)
    }

    /// Returns the lease expiry, or `None` if the record is not claimable.
    pub fn set_running(&mut self, worker_name: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.state.is_claimable() || self.paused || self.cancelled {
            return None;
        }
        self.execute += 1;
        self.worker_name = Some(worker_name.to_string());
        self.start_time = Some(now);
        let lease_end = now + chrono::Duration::seconds(self.exec_time_limit as i64);
        self.lease_end = Some(lease_end);
        self.update_state(RecordState::Running, now);
        Some(lease_end)
    }

    /// Running under `worker_name`. A worker whose lease was timed out and
    /// reassigned no longer holds the record.
    pub fn is_held_by(&self, worker_name: &str) -> bool {
        self.state == RecordState::Running && self.worker_name.as_deref() == Some(worker_name)
    }

    pub fn set_success(
        &mut self,
        worker_name: &str,
        result: String,
        exec_warn: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.is_held_by(worker_name) {
            return false;
        }
        self.result = Some(result);
        if exec_warn.is_some() {
            self.exec_warn = exec_warn;
        }
        self.end_time = Some(now);
        self.update_state(RecordState::Success, now);
        true
    }

    /// Invalid config fails immediately; otherwise the record crashes and
    /// waits for a retry until `exec_limit` executions are used up.
    pub fn set_error(
        &mut self,
        code: ErrorCode,
        message: &str,
        detail: Option<&str>,
        exec_warn: Option<&str>,
        retry: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> bool {
        if self.state != RecordState::Running {
            return false;
        }
        self.error_code = Some(code);
        self.error_message = Some(message.to_string());
        if let Some(detail) = detail {
            self.detail = Some(detail.to_string());
        }
        if let Some(warn) = exec_warn {
            self.exec_warn = Some(warn.to_string());
        }
        self.end_time = Some(now);

        if code == ErrorCode::InvalidConfig || self.execute >= self.exec_limit {
            self.update_state(RecordState::Fail, now);
            return true;
        }

        let delay = retry.next_delay(self.execute);
        self.retry_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.update_state(RecordState::Crash, now);
        true
    }

    /// Running past `lease_end + grace`.
    pub fn is_overtime(&self, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
        self.state == RecordState::Running && self.lease_end.is_some_and(|end| end + grace < now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    fn record(exec_limit: u32) -> TaskRecord {
        let created = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        TaskRecord {
            task_sn: TaskSn::new(1),
            name: "t".into(),
            func_path: "demo.echo.v1".into(),
            args_blob: "[]".into(),
            kwargs_blob: "{}".into(),
            priority: Priority::NORMAL,
            block_key: None,
            combine: None,
            exec_time_limit: 20,
            exec_limit,
            retry_delay: 30,
            previous_task: None,
            package: None,
            scheme: None,
            paused: false,
            cancelled: false,
            state: RecordState::Init,
            state_time: created,
            plan_time: created,
            retry_at: created,
            worker_name: None,
            execute: 0,
            start_time: None,
            lease_end: None,
            end_time: None,
            result: None,
            exec_warn: None,
            error_code: None,
            error_message: None,
            detail: None,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 1, 0).unwrap()
    }

    #[test]
    fn running_lease_is_start_plus_limit() {
        let mut rec = record(5);
        let lease = rec.set_running("w-01", now()).unwrap();
        assert_eq!(lease, now() + chrono::Duration::seconds(20));
        assert_eq!(rec.execute, 1);
        assert_eq!(rec.state, RecordState::Running);

        // already running: second claim is refused
        assert!(rec.set_running("w-02", now()).is_none());
    }

    #[test]
    fn paused_and_cancelled_records_are_not_claimable() {
        let mut rec = record(5);
        rec.paused = true;
        assert!(!rec.is_eligible(now()));
        assert!(rec.set_running("w-01", now()).is_none());

        rec.paused = false;
        rec.cancelled = true;
        assert!(!rec.is_eligible(now()));
        assert!(rec.set_running("w-01", now()).is_none());
        assert_eq!(rec.execute, 0);
    }

    #[test]
    fn crash_schedules_retry_until_limit() {
        let policy = RetryPolicy::fixed(Duration::from_secs(30));
        let mut rec = record(2);

        rec.set_running("w-01", now());
        assert!(rec.set_error(ErrorCode::Crash, "boom", Some("trace"), None, &policy, now()));
        assert_eq!(rec.state, RecordState::Crash);
        assert_eq!(rec.retry_at, now() + chrono::Duration::seconds(30));
        assert!(!rec.is_due(now()));

        rec.set_running("w-01", now());
        assert!(rec.set_error(ErrorCode::Crash, "boom", None, None, &policy, now()));
        assert_eq!(rec.state, RecordState::Fail);
    }

    #[test]
    fn invalid_config_fails_immediately() {
        let policy = RetryPolicy::default();
        let mut rec = record(5);
        rec.set_running("w-01", now());
        assert!(rec.set_error(ErrorCode::InvalidConfig, "Invalid config", None, None, &policy, now()));
        assert_eq!(rec.state, RecordState::Fail);
        assert_eq!(rec.error_code, Some(ErrorCode::InvalidConfig));
    }

    #[test]
    fn outcomes_require_running_state() {
        let policy = RetryPolicy::default();
        let mut rec = record(5);
        assert!(!rec.set_success("w-01", "1".into(), None, now()));
        assert!(!rec.set_error(ErrorCode::Timeout, "Task timeout", None, None, &policy, now()));
    }

    #[test]
    fn success_from_a_previous_claimant_is_ignored() {
        let policy = RetryPolicy::fixed(Duration::from_secs(0));
        let mut rec = record(5);
        rec.set_running("w-01", now());
        assert!(rec.set_error(ErrorCode::Timeout, "Task timeout", None, None, &policy, now()));
        rec.set_running("w-02", now());

        assert!(!rec.is_held_by("w-01"));
        assert!(!rec.set_success("w-01", "1".into(), None, now()));
        assert_eq!(rec.state, RecordState::Running);

        assert!(rec.set_success("w-02", "2".into(), None, now()));
        assert_eq!(rec.result.as_deref(), Some("2"));
    }
}
