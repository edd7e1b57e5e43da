//! Task packages: a batch submitted together and tracked as one unit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{PackageSn, RecordState, TaskSn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TaskPackage {
    pub package_sn: PackageSn,
    pub name: String,
    pub created: DateTime<Utc>,
    pub tasks: Vec<TaskSn>,
}

/// Progress of a package, counted from its member records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageStatus {
    pub package_sn: PackageSn,
    pub name: String,
    pub created: DateTime<Utc>,
    pub task_count: usize,
    pub success_count: usize,
    pub fail_count: usize,
    pub running_count: usize,
    /// Every member reached success or fail.
    pub finished: bool,
}

impl PackageStatus {
    pub(crate) fn tally(
        package: &TaskPackage,
        states: impl IntoIterator<Item = RecordState>,
    ) -> Self {
        let mut status = Self {
            package_sn: package.package_sn,
            name: package.name.clone(),
            created: package.created,
            task_count: package.tasks.len(),
            success_count: 0,
            fail_count: 0,
            running_count: 0,
            finished: false,
        };
        for state in states {
            match state {
                RecordState::Success => status.success_count += 1,
                RecordState::Fail => status.fail_count += 1,
                RecordState::Running => status.running_count += 1,
                RecordState::Init | RecordState::Crash => {}
            }
        }
        status.finished = status.success_count + status.fail_count == status.task_count;
        status
    }
}
