//! In-memory task store.
//!
//! Implements the full persistent-record state machine behind `TaskStore`,
//! so a dispatcher can run without an external database. Packages and
//! interval schemes live here too; they only ever create records.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::package::{PackageStatus, TaskPackage};
use super::scheme::{SchemeSubmission, TaskScheme};
use super::{RetryPolicy, TaskRecord, TaskSubmission};
use crate::config::StoreConfig;
use crate::domain::{
    CrashReport, ErrorCode, InvalidConfigReport, PackageSn, RecordState, SchemeSn, StoreError,
    SuccessReport, TaskData, TaskSn,
};
use crate::observability::RecordCounts;
use crate::ports::{Clock, TaskStore};
use crate::typed::PayloadCodec;

/// Upper bound for a single execution window, in seconds (one week).
const MAX_EXEC_TIME_LIMIT: u64 = 7 * 24 * 60 * 60;

/// How records of one batch relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Linking {
    Independent,
    /// Each record waits for the one before it.
    Chained,
}

#[derive(Debug, Clone, Copy, Default)]
struct Origin {
    package: Option<PackageSn>,
    scheme: Option<SchemeSn>,
}

struct StoreState {
    records: BTreeMap<TaskSn, TaskRecord>,
    packages: BTreeMap<PackageSn, TaskPackage>,
    schemes: BTreeMap<SchemeSn, TaskScheme>,
    next_sn: u64,
    next_package: u64,
    next_scheme: u64,
}

impl StoreState {
    /// No predecessor, or the predecessor succeeded.
    fn previous_done(&self, record: &TaskRecord) -> bool {
        match record.previous_task {
            None => true,
            Some(prev) => self
                .records
                .get(&prev)
                .is_some_and(|p| p.state == RecordState::Success),
        }
    }

    fn counts(&self) -> RecordCounts {
        let mut counts = RecordCounts::default();
        for record in self.records.values() {
            match record.state {
                RecordState::Init => counts.init += 1,
                RecordState::Running => counts.running += 1,
                RecordState::Crash => counts.crash += 1,
                RecordState::Success => counts.success += 1,
                RecordState::Fail => counts.fail += 1,
            }
        }
        counts
    }

    fn package_status(&self, package: &TaskPackage) -> PackageStatus {
        let states = package
            .tasks
            .iter()
            .filter_map(|sn| self.records.get(sn))
            .map(|r| r.state);
        PackageStatus::tally(package, states)
    }

    fn is_referenced(&self, task_sn: TaskSn) -> bool {
        self.records.values().any(|r| r.previous_task == Some(task_sn))
    }
}

pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
    config: StoreConfig,
    codec: PayloadCodec,
}

impl InMemoryTaskStore {
    pub fn new(config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(StoreState {
                records: BTreeMap::new(),
                packages: BTreeMap::new(),
                schemes: BTreeMap::new(),
                next_sn: 1,
                next_package: 1,
                next_scheme: 1,
            }),
            clock,
            config,
            codec: PayloadCodec::new(),
        }
    }

    fn retry_policy(&self, record: &TaskRecord) -> RetryPolicy {
        RetryPolicy::exponential(
            std::time::Duration::from_secs(record.retry_delay),
            self.config.retry_multiplier,
        )
    }

    fn overtime_grace(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.overtime_grace).unwrap_or(chrono::Duration::zero())
    }

    fn build_record(
        &self,
        task_sn: TaskSn,
        submission: TaskSubmission,
        origin: Origin,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord, StoreError> {
        let args_blob = self
            .codec
            .encode_args(&submission.args)
            .map_err(|e| StoreError::Codec(e.to_string()))?;
        let kwargs_blob = self
            .codec
            .encode_kwargs(&submission.kwargs)
            .map_err(|e| StoreError::Codec(e.to_string()))?;

        Ok(TaskRecord {
            task_sn,
            name: submission.name,
            func_path: submission.func_path,
            args_blob,
            kwargs_blob,
            priority: submission.priority,
            block_key: submission.block_key,
            combine: submission.combine,
            exec_time_limit: submission
                .exec_time_limit
                .unwrap_or(self.config.exec_time_limit)
                .min(MAX_EXEC_TIME_LIMIT),
            exec_limit: submission.exec_limit.unwrap_or(self.config.exec_limit).max(1),
            retry_delay: submission.retry_delay.unwrap_or(self.config.retry_delay),
            previous_task: submission.previous_task,
            package: origin.package,
            scheme: origin.scheme,
            paused: false,
            cancelled: false,
            state: RecordState::Init,
            state_time: now,
            plan_time: submission.plan_time.unwrap_or(now),
            retry_at: now,
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
        })
    }

    /// Validates and builds the whole batch before touching the store: either
    /// every submission gets a record or none does.
    ///
    /// A `previous_task` may name an existing record or an earlier member of
    /// the same batch.
    fn insert_batch(
        &self,
        state: &mut StoreState,
        submissions: Vec<TaskSubmission>,
        linking: Linking,
        origin: Origin,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskSn>, StoreError> {
        let first = state.next_sn;
        let mut records = Vec::with_capacity(submissions.len());
        for (offset, mut submission) in submissions.into_iter().enumerate() {
            let task_sn = TaskSn::new(first + offset as u64);
            if linking == Linking::Chained && offset > 0 {
                submission.previous_task = Some(TaskSn::new(task_sn.get() - 1));
            }
            if let Some(previous) = submission.previous_task {
                let in_batch = previous.get() >= first && previous < task_sn;
                if !in_batch && !state.records.contains_key(&previous) {
                    return Err(StoreError::MissingPrevious { task_sn, previous });
                }
            }
            records.push(self.build_record(task_sn, submission, origin, now)?);
        }

        state.next_sn = first + records.len() as u64;
        let mut serials = Vec::with_capacity(records.len());
        for record in records {
            info!(task_sn = %record.task_sn, name = %record.name, func = %record.func_path, "task submitted");
            serials.push(record.task_sn);
            state.records.insert(record.task_sn, record);
        }
        Ok(serials)
    }

    async fn submit_batch(
        &self,
        submissions: Vec<TaskSubmission>,
        linking: Linking,
    ) -> Result<Vec<TaskSn>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        self.insert_batch(&mut state, submissions, linking, Origin::default(), now)
    }

    pub async fn submit(&self, submission: TaskSubmission) -> Result<TaskSn, StoreError> {
        let serials = self.submit_batch(vec![submission], Linking::Independent).await?;
        serials
            .first()
            .copied()
            .ok_or_else(|| StoreError::Unavailable("submit produced no record".into()))
    }

    /// Each submission runs only after the one before it succeeded.
    pub async fn submit_chain(
        &self,
        submissions: Vec<TaskSubmission>,
    ) -> Result<Vec<TaskSn>, StoreError> {
        self.submit_batch(submissions, Linking::Chained).await
    }

    pub async fn record(&self, task_sn: TaskSn) -> Option<TaskRecord> {
        let state = self.state.lock().await;
        state.records.get(&task_sn).cloned()
    }

    pub async fn counts_by_state(&self) -> RecordCounts {
        let state = self.state.lock().await;
        state.counts()
    }

    /// Holds a record out of the queue (`true`) or lets it back in (`false`).
    /// Returns `false` once the record finished.
    pub async fn set_paused(&self, task_sn: TaskSn, paused: bool) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .records
            .get_mut(&task_sn)
            .ok_or(StoreError::NotFound(task_sn))?;
        if record.state.is_terminal() {
            return Ok(false);
        }
        record.paused = paused;
        info!(%task_sn, paused, "task pause changed");
        Ok(true)
    }

    /// Withdraws a record for good. A run already in progress keeps its lease.
    pub async fn cancel(&self, task_sn: TaskSn) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .records
            .get_mut(&task_sn)
            .ok_or(StoreError::NotFound(task_sn))?;
        if record.state.is_terminal() || record.cancelled {
            return Ok(false);
        }
        record.cancelled = true;
        info!(%task_sn, state = ?record.state, "task cancelled");
        Ok(true)
    }

    /// Submits `submissions` as one package. Nothing is stored if any member
    /// is rejected.
    pub async fn submit_package(
        &self,
        name: impl Into<String>,
        submissions: Vec<TaskSubmission>,
    ) -> Result<PackageStatus, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let package_sn = PackageSn::new(state.next_package);
        let origin = Origin {
            package: Some(package_sn),
            scheme: None,
        };
        let tasks = self.insert_batch(&mut state, submissions, Linking::Independent, origin, now)?;
        state.next_package += 1;

        let package = TaskPackage {
            package_sn,
            name: name.into(),
            created: now,
            tasks,
        };
        info!(%package_sn, name = %package.name, tasks = package.tasks.len(), "package submitted");
        let status = state.package_status(&package);
        state.packages.insert(package_sn, package);
        Ok(status)
    }

    pub async fn package_status(&self, package_sn: PackageSn) -> Result<PackageStatus, StoreError> {
        let state = self.state.lock().await;
        let package = state
            .packages
            .get(&package_sn)
            .ok_or(StoreError::UnknownPackage(package_sn))?;
        Ok(state.package_status(package))
    }

    /// Cancels every unfinished member. Returns how many were cancelled.
    pub async fn cancel_package(&self, package_sn: PackageSn) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let members = state
            .packages
            .get(&package_sn)
            .ok_or(StoreError::UnknownPackage(package_sn))?
            .tasks
            .clone();
        let mut cancelled = 0;
        for task_sn in members {
            if let Some(record) = state.records.get_mut(&task_sn)
                && !record.state.is_terminal()
                && !record.cancelled
            {
                record.cancelled = true;
                cancelled += 1;
            }
        }
        info!(%package_sn, cancelled, "package cancelled");
        Ok(cancelled)
    }

    pub async fn add_scheme(&self, submission: SchemeSubmission) -> Result<SchemeSn, StoreError> {
        if submission.interval == 0 {
            return Err(StoreError::InvalidScheme("interval must be positive"));
        }
        let mut state = self.state.lock().await;
        let scheme_sn = SchemeSn::new(state.next_scheme);
        state.next_scheme += 1;
        let scheme = TaskScheme::new(scheme_sn, submission);
        info!(%scheme_sn, name = %scheme.name, interval = scheme.interval, plan_time = %scheme.plan_time, "scheme added");
        state.schemes.insert(scheme_sn, scheme);
        Ok(scheme_sn)
    }

    pub async fn scheme(&self, scheme_sn: SchemeSn) -> Option<TaskScheme> {
        let state = self.state.lock().await;
        state.schemes.get(&scheme_sn).cloned()
    }

    pub async fn set_scheme_paused(
        &self,
        scheme_sn: SchemeSn,
        paused: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let scheme = state
            .schemes
            .get_mut(&scheme_sn)
            .ok_or(StoreError::UnknownScheme(scheme_sn))?;
        scheme.paused = paused;
        info!(%scheme_sn, paused, "scheme pause changed");
        Ok(())
    }

    /// Stops generating tasks. Tasks already generated are left alone.
    pub async fn cancel_scheme(&self, scheme_sn: SchemeSn) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let scheme = state
            .schemes
            .get_mut(&scheme_sn)
            .ok_or(StoreError::UnknownScheme(scheme_sn))?;
        scheme.cancelled = true;
        info!(%scheme_sn, "scheme cancelled");
        Ok(())
    }

    /// Generates at most one task per due scheme, then drops finished scheme
    /// tasks older than their scheme's retain window. Returns the new serials.
    pub async fn apply_due_schemes(&self) -> Result<Vec<TaskSn>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let due: Vec<SchemeSn> = state
            .schemes
            .values()
            .filter(|scheme| scheme.is_due(now))
            .map(|scheme| scheme.scheme_sn)
            .collect();

        let mut created = Vec::with_capacity(due.len());
        for scheme_sn in due {
            let Some(mut advanced) = state.schemes.get(&scheme_sn).cloned() else {
                continue;
            };
            let submission = advanced.advance();
            let origin = Origin {
                package: None,
                scheme: Some(scheme_sn),
            };
            match self.insert_batch(&mut state, vec![submission], Linking::Independent, origin, now) {
                Ok(serials) => {
                    advanced.current_task = serials.first().copied();
                    debug!(%scheme_sn, task = ?advanced.current_task, next = %advanced.plan_time, "scheme applied");
                    created.extend(serials);
                    state.schemes.insert(scheme_sn, advanced);
                }
                Err(e) => warn!(%scheme_sn, error = %e, "scheme template rejected"),
            }
        }

        let expired: Vec<TaskSn> = state
            .records
            .values()
            .filter(|record| record.state.is_terminal())
            .filter_map(|record| {
                let scheme = state.schemes.get(&record.scheme?)?;
                let stale = scheme.retain_expired(record.end_time?, now);
                (stale && scheme.current_task != Some(record.task_sn)).then_some(record.task_sn)
            })
            .filter(|task_sn| !state.is_referenced(*task_sn))
            .collect();
        for task_sn in &expired {
            state.records.remove(task_sn);
        }
        if !expired.is_empty() {
            info!(purged = expired.len(), "expired scheme tasks removed");
        }
        Ok(created)
    }

    async fn apply_error(
        &self,
        task_sn: TaskSn,
        claimant: Option<&str>,
        code: ErrorCode,
        message: &str,
        detail: Option<&str>,
        exec_warn: Option<&str>,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let record = state
            .records
            .get_mut(&task_sn)
            .ok_or(StoreError::NotFound(task_sn))?;
        if let Some(worker) = claimant
            && !record.is_held_by(worker)
        {
            debug!(%task_sn, worker, holder = ?record.worker_name, "stale error report ignored");
            return Ok(false);
        }
        let policy = self.retry_policy(record);
        let applied = record.set_error(code, message, detail, exec_warn, &policy, now);
        if applied {
            info!(%task_sn, ?code, state = ?record.state, execute = record.execute, "task error recorded");
        }
        Ok(applied)
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn get_task_queue(&self, limit: usize) -> Result<Vec<TaskData>, StoreError> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        let mut queue: Vec<&TaskRecord> = state
            .records
            .values()
            .filter(|r| r.is_eligible(now) && state.previous_done(r))
            .collect();
        // BTreeMap yields serial order; a stable sort keeps it within a priority.
        queue.sort_by_key(|r| r.priority);
        Ok(queue.into_iter().take(limit).map(TaskRecord::to_task_data).collect())
    }

    async fn get_running_block_keys(&self) -> Result<HashSet<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .values()
            .filter(|r| r.state == RecordState::Running)
            .filter_map(|r| r.block_key.clone())
            .collect())
    }

    async fn set_task_running(
        &self,
        task_sn: TaskSn,
        worker_name: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(record) = state.records.get(&task_sn) else {
            return Ok(None);
        };
        if !state.previous_done(record) {
            debug!(%task_sn, "previous task not finished, claim refused");
            return Ok(None);
        }
        let Some(record) = state.records.get_mut(&task_sn) else {
            return Ok(None);
        };
        Ok(record.set_running(worker_name, now))
    }

    async fn set_task_success(&self, report: &SuccessReport) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let result = self
            .codec
            .encode_result(&report.result)
            .map_err(|e| StoreError::Codec(e.to_string()))?;
        let mut state = self.state.lock().await;
        let record = state
            .records
            .get_mut(&report.task_sn)
            .ok_or(StoreError::NotFound(report.task_sn))?;
        let applied = record.set_success(&report.worker_name, result, report.exec_warn.clone(), now);
        if !applied {
            debug!(task_sn = %report.task_sn, worker = %report.worker_name, holder = ?record.worker_name, "stale success ignored");
        }
        Ok(applied)
    }

    async fn set_task_crash(&self, report: &CrashReport) -> Result<bool, StoreError> {
        self.apply_error(
            report.task_sn,
            Some(&report.worker_name),
            ErrorCode::Crash,
            &report.message,
            Some(&report.detail),
            report.exec_warn.as_deref(),
        )
        .await
    }

    async fn set_task_invalid_config(
        &self,
        report: &InvalidConfigReport,
    ) -> Result<bool, StoreError> {
        let task_sn = match report.task_sn {
            Some(task_sn) => Some(task_sn),
            None => {
                let state = self.state.lock().await;
                state
                    .records
                    .values()
                    .find(|r| r.is_held_by(&report.worker_name))
                    .map(|r| r.task_sn)
            }
        };
        let Some(task_sn) = task_sn else {
            warn!(worker = %report.worker_name, "invalid config reported but worker holds no task");
            return Ok(false);
        };
        self.apply_error(
            task_sn,
            Some(&report.worker_name),
            ErrorCode::InvalidConfig,
            "Invalid config",
            Some(&report.detail),
            None,
        )
        .await
    }

    async fn set_task_timeout(&self, task_sn: TaskSn) -> Result<bool, StoreError> {
        self.apply_error(task_sn, None, ErrorCode::Timeout, "Task timeout", None, None)
            .await
    }

    async fn submit_tasks(&self, tasks: &[TaskSubmission]) -> Result<Vec<TaskSn>, StoreError> {
        self.submit_batch(tasks.to_vec(), Linking::Independent).await
    }

    async fn overtime_task_process(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let grace = self.overtime_grace();
        let mut state = self.state.lock().await;
        let mut timed_out = 0;
        for record in state.records.values_mut() {
            if !record.is_overtime(now, grace) {
                continue;
            }
            let policy = self.retry_policy(record);
            if record.set_error(ErrorCode::Timeout, "Task timeout", None, None, &policy, now) {
                warn!(task_sn = %record.task_sn, worker = ?record.worker_name, "running task overtime");
                timed_out += 1;
            }
        }
        Ok(timed_out)
    }

    async fn process_due_schemes(&self) -> Result<usize, StoreError> {
        Ok(self.apply_due_schemes().await?.len())
    }
}
