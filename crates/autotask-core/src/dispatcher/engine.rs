//! DispatcherCore - queue, block keys and leases behind one async mutex.
//!
//! # 並行性
//! - queue / BlockSet の変更はすべて `state` の lock 下で行う
//! - `get_task` は store の claim 確認の間も lock を保持する（claim は直列）
//! - refresh 中は `refreshing` が立ち、`get_task` は待たずに Busy を返す

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use super::RefreshReport;
use crate::app::status::{ClusterSnapshot, DispatcherState, DispatcherStatus, RunningTask};
use crate::config::DispatcherConfig;
use crate::domain::{
    ClusterState, CrashReport, DispatcherId, GetTaskReply, InvalidConfigReport, MALFORMED_PING,
    StatusCode, StoreError, SuccessReport, TaskSn,
};
use crate::ports::{
    Clock, DispatcherAdmin, DispatcherApi, IdGenerator, TaskStore, UlidGenerator,
};
use crate::queue::{BlockSet, TaskQueue};
use crate::rpc::RpcError;
use crate::store::TaskSubmission;

/// Claim attempts per `get_task` call before answering Busy.
pub const MAX_CLAIM_ATTEMPTS: usize = 8;

struct DispatchState {
    queue: TaskQueue,
    blocked: BlockSet,
    clusters: BTreeMap<String, ClusterSnapshot>,
}

/// What an outcome report found in the queue.
enum Lease {
    /// The reporter held the lease; the entry is done.
    Finished(TaskSn),
    /// Another worker holds the task now; the report is stale.
    HeldByOther(String),
    /// Not leased in this queue (e.g. after a restart). The store decides.
    Untracked,
}

/// Clears the refresh flag however the refresh ends.
struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct DispatcherCore {
    name: String,
    instance: DispatcherId,
    config: DispatcherConfig,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    state: Mutex<DispatchState>,
    refreshing: AtomicBool,
    shutdown: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl DispatcherCore {
    pub fn new(config: DispatcherConfig, store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Self {
        let instance = UlidGenerator::new(Arc::clone(&clock)).dispatcher_id();
        let (shutdown_tx, _) = watch::channel(false);
        info!(name = %config.name, %instance, queue_size = config.queue_size, "dispatcher created");
        Self {
            name: config.name.clone(),
            instance,
            state: Mutex::new(DispatchState {
                queue: TaskQueue::new(config.queue_size),
                blocked: BlockSet::new(),
                clusters: BTreeMap::new(),
            }),
            config,
            store,
            clock,
            refreshing: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance(&self) -> DispatcherId {
        self.instance
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }

    /// Flips to `true` once shutdown is requested.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn status_code(&self, state: &DispatchState) -> StatusCode {
        if self.is_shutting_down() {
            StatusCode::ShuttingDown
        } else if state.queue.has_available() {
            StatusCode::Ready
        } else {
            StatusCode::Idle
        }
    }

    pub async fn current_status_code(&self) -> StatusCode {
        let state = self.state.lock().await;
        self.status_code(&state)
    }

    /// Sweeps expired leases, then rebuilds the queue and block keys from the
    /// store. Only the sweep runs once shutdown is requested.
    pub async fn refresh_queue(&self) -> Result<RefreshReport, StoreError> {
        if self.refreshing.swap(true, Ordering::AcqRel) {
            debug!("refresh already in flight");
            return Ok(RefreshReport {
                skipped: true,
                ..Default::default()
            });
        }
        let _guard = RefreshGuard(&self.refreshing);

        let grace = chrono::Duration::from_std(self.config.lease_grace)
            .unwrap_or(chrono::Duration::zero());
        let expired = {
            let mut state = self.state.lock().await;
            let expired = state.queue.take_expired(self.clock.now(), grace);
            for entry in &expired {
                state.blocked.release(entry.block_key());
            }
            expired
        };

        let mut timed_out = Vec::with_capacity(expired.len());
        for entry in expired {
            let task_sn = entry.task_sn();
            warn!(%task_sn, worker = ?entry.worker_name(), lease_end = ?entry.lease_end(), "lease expired");
            match self.store.set_task_timeout(task_sn).await {
                Ok(_) => timed_out.push(task_sn),
                Err(e) => warn!(%task_sn, error = %e, "failed to record timeout"),
            }
        }

        if self.is_shutting_down() {
            let state = self.state.lock().await;
            let counts = state.queue.counts(&state.blocked);
            return Ok(RefreshReport {
                shutting_down: true,
                timed_out,
                queued: counts.queued,
                available: counts.available,
                blocked_keys: counts.blocked_keys,
                ..Default::default()
            });
        }

        let running_keys = self.store.get_running_block_keys().await?;
        let fresh = self.store.get_task_queue(self.config.queue_size).await?;

        let mut state = self.state.lock().await;
        let queue = state.queue.rebuild(fresh);
        let mut blocked = BlockSet::from_keys(running_keys);
        for entry in queue.claimed() {
            blocked.hold(entry.block_key());
        }
        state.queue = queue;
        state.blocked = blocked;

        let counts = state.queue.counts(&state.blocked);
        debug!(queued = counts.queued, available = counts.available, blocked = counts.blocked_keys, "queue refreshed");
        Ok(RefreshReport {
            skipped: false,
            shutting_down: false,
            timed_out,
            queued: counts.queued,
            available: counts.available,
            blocked_keys: counts.blocked_keys,
        })
    }

    /// Claims the next eligible task for `worker_name`.
    ///
    /// Store errors never surface to the worker: they turn into Busy so the
    /// worker simply asks again.
    pub async fn get_task(&self, worker_name: &str, combine: Option<i64>) -> GetTaskReply {
        let mut state = self.state.lock().await;
        if self.is_shutting_down() {
            return GetTaskReply::ShuttingDown;
        }
        if self.is_refreshing() {
            return GetTaskReply::Busy;
        }

        for _ in 0..MAX_CLAIM_ATTEMPTS {
            match self.status_code(&state) {
                StatusCode::ShuttingDown => return GetTaskReply::ShuttingDown,
                StatusCode::Idle => return GetTaskReply::Empty,
                StatusCode::Ready => {}
            }
            let Some(index) = state.queue.next_candidate(&state.blocked, combine) else {
                return GetTaskReply::Empty;
            };
            let Some(entry) = state.queue.get_mut(index) else {
                return GetTaskReply::Busy;
            };
            entry.claim(worker_name);
            let task_sn = entry.task_sn();

            match self.store.set_task_running(task_sn, worker_name).await {
                Ok(Some(lease_end)) => {
                    let DispatchState { queue, blocked, .. } = &mut *state;
                    let Some(entry) = queue.get_mut(index) else {
                        return GetTaskReply::Busy;
                    };
                    entry.confirm(lease_end);
                    blocked.hold(entry.block_key());
                    info!(%task_sn, worker = worker_name, %lease_end, "task claimed");
                    return GetTaskReply::Claimed(entry.data().to_payload());
                }
                Ok(None) => {
                    debug!(%task_sn, worker = worker_name, "claim rejected by store");
                    if let Some(entry) = state.queue.get_mut(index) {
                        entry.reject();
                    }
                }
                Err(e) => {
                    warn!(%task_sn, worker = worker_name, error = %e, "claim could not be confirmed");
                    if let Some(entry) = state.queue.get_mut(index) {
                        entry.unclaim();
                    }
                    return GetTaskReply::Busy;
                }
            }
        }
        GetTaskReply::Busy
    }

    /// Marks the leased entry done and frees its block key, but only for
    /// the worker that holds it.
    async fn finish_entry(&self, task_sn: Option<TaskSn>, worker_name: &str) -> Lease {
        let mut state = self.state.lock().await;
        let DispatchState { queue, blocked, .. } = &mut *state;
        let entry = match task_sn {
            Some(task_sn) => queue.claimed_mut(task_sn),
            None => queue.held_by_mut(worker_name),
        };
        let Some(entry) = entry else {
            return Lease::Untracked;
        };
        if let Some(holder) = entry.worker_name()
            && holder != worker_name
        {
            return Lease::HeldByOther(holder.to_string());
        }
        let task_sn = entry.task_sn();
        blocked.release(entry.block_key());
        entry.finish();
        Lease::Finished(task_sn)
    }

    pub async fn task_success(&self, report: &SuccessReport) -> Result<bool, StoreError> {
        let worker = report.worker_name.as_str();
        if let Lease::HeldByOther(holder) = self.finish_entry(Some(report.task_sn), worker).await {
            warn!(task_sn = %report.task_sn, worker, %holder, "stale success ignored");
            return Ok(false);
        }
        let applied = self.store.set_task_success(report).await?;
        info!(task_sn = %report.task_sn, worker, applied, "task succeeded");
        Ok(applied)
    }

    pub async fn task_crash(&self, report: &CrashReport) -> Result<bool, StoreError> {
        let worker = report.worker_name.as_str();
        if let Lease::HeldByOther(holder) = self.finish_entry(Some(report.task_sn), worker).await {
            warn!(task_sn = %report.task_sn, worker, %holder, "stale crash ignored");
            return Ok(false);
        }
        let applied = self.store.set_task_crash(report).await?;
        warn!(task_sn = %report.task_sn, worker, message = %report.message, applied, "task crashed");
        Ok(applied)
    }

    /// Resolves the task by explicit serial, else by the worker's claim.
    pub async fn invalid_config(&self, report: &InvalidConfigReport) -> Result<bool, StoreError> {
        let worker = report.worker_name.as_str();
        let resolved = match self.finish_entry(report.task_sn, worker).await {
            Lease::HeldByOther(holder) => {
                warn!(task_sn = ?report.task_sn, worker, %holder, "stale invalid config ignored");
                return Ok(false);
            }
            Lease::Finished(task_sn) => Some(task_sn),
            Lease::Untracked => None,
        };

        let mut forwarded = report.clone();
        if forwarded.task_sn.is_none() {
            forwarded.task_sn = resolved;
        }
        let applied = self.store.set_task_invalid_config(&forwarded).await?;
        warn!(task_sn = ?forwarded.task_sn, worker, detail = %report.detail, applied, "invalid task config");
        Ok(applied)
    }

    /// Records a cluster heartbeat and answers with the status code.
    pub async fn ping(&self, cluster: &ClusterState) -> i32 {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        debug!(cluster = %cluster.name, status = ?cluster.status, pids = cluster.pids.len(), "ping");
        state.clusters.insert(
            cluster.name.clone(),
            ClusterSnapshot {
                state: cluster.clone(),
                last_seen: now,
            },
        );
        self.status_code(&state).code()
    }

    /// Like [`ping`](Self::ping), for a body that still has to be parsed.
    pub async fn ping_raw(&self, body: &[u8]) -> i32 {
        match serde_json::from_slice::<ClusterState>(body) {
            Ok(cluster) => self.ping(&cluster).await,
            Err(e) => {
                warn!(error = %e, "malformed ping");
                MALFORMED_PING
            }
        }
    }

    pub fn shutdown(&self) -> String {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            info!(name = %self.name, "dispatcher shutdown requested");
        }
        self.shutdown_tx.send_replace(true);
        format!("dispatcher {} is set to shutdown", self.name)
    }

    /// Shutdown requested and no claimed task left.
    pub async fn is_drained(&self) -> bool {
        if !self.is_shutting_down() {
            return false;
        }
        let state = self.state.lock().await;
        state.queue.claimed().next().is_none()
    }

    pub async fn status(&self) -> DispatcherStatus {
        let state = self.state.lock().await;
        let running_tasks: Vec<RunningTask> = state
            .queue
            .claimed()
            .map(|entry| RunningTask {
                task_sn: entry.task_sn(),
                worker_name: entry.worker_name().unwrap_or_default().to_string(),
                lease_end: entry.lease_end(),
            })
            .collect();
        let lifecycle = match (self.is_shutting_down(), running_tasks.is_empty()) {
            (false, _) => DispatcherState::Running,
            (true, false) => DispatcherState::Draining,
            (true, true) => DispatcherState::Drained,
        };
        DispatcherStatus {
            name: self.name.clone(),
            instance: self.instance,
            state: lifecycle,
            code: self.status_code(&state),
            clusters: state.clusters.clone(),
            running_tasks,
            counts: state.queue.counts(&state.blocked),
        }
    }

    pub async fn submit(&self, tasks: &[TaskSubmission]) -> Result<Vec<TaskSn>, StoreError> {
        let serials = self.store.submit_tasks(tasks).await?;
        info!(count = serials.len(), "tasks submitted");
        Ok(serials)
    }
}

fn local_error(err: StoreError) -> RpcError {
    RpcError::Dispatcher(err.to_string())
}

#[async_trait]
impl DispatcherApi for DispatcherCore {
    async fn ping(&self, state: &ClusterState) -> Result<i32, RpcError> {
        Ok(DispatcherCore::ping(self, state).await)
    }

    async fn get_task(
        &self,
        worker_name: &str,
        combine: Option<i64>,
    ) -> Result<GetTaskReply, RpcError> {
        Ok(DispatcherCore::get_task(self, worker_name, combine).await)
    }

    async fn task_success(&self, report: &SuccessReport) -> Result<bool, RpcError> {
        DispatcherCore::task_success(self, report).await.map_err(local_error)
    }

    async fn task_crash(&self, report: &CrashReport) -> Result<bool, RpcError> {
        DispatcherCore::task_crash(self, report).await.map_err(local_error)
    }

    async fn invalid_config(&self, report: &InvalidConfigReport) -> Result<bool, RpcError> {
        DispatcherCore::invalid_config(self, report).await.map_err(local_error)
    }
}

#[async_trait]
impl DispatcherAdmin for DispatcherCore {
    async fn refresh(&self) -> Result<RefreshReport, RpcError> {
        self.refresh_queue().await.map_err(local_error)
    }

    async fn status(&self) -> Result<DispatcherStatus, RpcError> {
        Ok(DispatcherCore::status(self).await)
    }

    async fn shutdown(&self) -> Result<String, RpcError> {
        Ok(DispatcherCore::shutdown(self))
    }

    async fn submit(&self, tasks: &[TaskSubmission]) -> Result<Vec<TaskSn>, RpcError> {
        DispatcherCore::submit(self, tasks).await.map_err(local_error)
    }
}
