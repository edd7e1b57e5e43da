//! Task schemes: a task template re-submitted every `interval` seconds.
//!
//! # フロー
//! 1. `plan_time` が lookahead 窓に入った scheme は due
//! 2. due になると `plan_time += interval` し、新しい `plan_time` で task を 1 件作る
//! 3. 作った task が `current_task`。`retain` を過ぎた終了済みの過去 task は掃除される

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskSubmission;
use crate::domain::{Priority, SchemeSn, TaskSn};

/// Schemes are applied this long before their planned time.
pub const SCHEME_LOOKAHEAD_SECS: i64 = 30;

/// Finished scheme tasks are kept for a week by default.
pub const DEFAULT_SCHEME_RETAIN_SECS: u64 = 7 * 24 * 60 * 60;

/// A request to create a recurring scheme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemeSubmission {
    pub name: String,
    /// Every generated task copies this; its name, priority and plan time are overridden.
    pub template: TaskSubmission,
    /// Seconds between two generated tasks. Must be positive.
    pub interval: u64,
    pub plan_time: DateTime<Utc>,
    #[serde(default = "default_retain")]
    pub retain: u64,
}

fn default_retain() -> u64 {
    DEFAULT_SCHEME_RETAIN_SECS
}

impl SchemeSubmission {
    pub fn new(
        name: impl Into<String>,
        template: TaskSubmission,
        interval: u64,
        plan_time: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            template,
            interval,
            plan_time,
            retain: DEFAULT_SCHEME_RETAIN_SECS,
        }
    }

    pub fn with_retain(mut self, seconds: u64) -> Self {
        self.retain = seconds;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskScheme {
    pub scheme_sn: SchemeSn,
    pub name: String,
    pub template: TaskSubmission,
    pub interval: u64,
    pub plan_time: DateTime<Utc>,
    pub retain: u64,
    pub paused: bool,
    pub cancelled: bool,
    /// Most recently generated task.
    pub current_task: Option<TaskSn>,
}

impl TaskScheme {
    pub(crate) fn new(scheme_sn: SchemeSn, submission: SchemeSubmission) -> Self {
        Self {
            scheme_sn,
            name: submission.name,
            template: submission.template,
            interval: submission.interval,
            plan_time: submission.plan_time,
            retain: submission.retain,
            paused: false,
            cancelled: false,
            current_task: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.paused
            && !self.cancelled
            && self.plan_time < now + chrono::Duration::seconds(SCHEME_LOOKAHEAD_SECS)
    }

    /// Moves to the next plan time and returns the submission for it.
    pub(crate) fn advance(&mut self) -> TaskSubmission {
        self.plan_time = self
            .plan_time
            .checked_add_signed(seconds(self.interval))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut submission = self.template.clone();
        submission.name = format!("{}-{}", self.name, self.plan_time.format("%Y%m%d-%H%M%S"));
        submission.priority = Priority::SCHEME;
        submission.plan_time = Some(self.plan_time);
        submission.previous_task = None;
        submission
    }

    /// Finished at `ended` and past the retain window.
    pub fn retain_expired(&self, ended: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        ended
            .checked_add_signed(seconds(self.retain))
            .is_some_and(|until| until < now)
    }
}

fn seconds(value: u64) -> chrono::Duration {
    i64::try_from(value)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn scheme() -> TaskScheme {
        TaskScheme::new(
            SchemeSn::new(1),
            SchemeSubmission::new(
                "nightly",
                TaskSubmission::new("ignored", "demo.echo.v1").with_priority(Priority::MAX),
                3600,
                noon(),
            ),
        )
    }

    #[test]
    fn due_inside_the_lookahead_window() {
        let mut scheme = scheme();
        assert!(!scheme.is_due(noon() - chrono::Duration::seconds(30)));
        assert!(scheme.is_due(noon() - chrono::Duration::seconds(29)));

        scheme.paused = true;
        assert!(!scheme.is_due(noon()));
    }

    #[test]
    fn advance_names_the_task_after_its_plan_time() {
        let mut scheme = scheme();
        let task = scheme.advance();
        assert_eq!(scheme.plan_time, noon() + chrono::Duration::hours(1));
        assert_eq!(task.name, "nightly-20260301-130000");
        assert_eq!(task.priority, Priority::SCHEME);
        assert_eq!(task.plan_time, Some(scheme.plan_time));
        assert_eq!(task.func_path, "demo.echo.v1");
    }
}
