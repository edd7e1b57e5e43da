//! WorkerLoop - タスク実行ループ
//!
//! # フロー（1 iteration）
//! 1. shutdown 制御フラグを確認
//! 2. max_lifetime を超えていたら終了（プロセスの再生成は supervisor が行う）
//! 3. supervisor に `Alive` を送る
//! 4. `get_task` → Busy / Empty / ShuttingDown / TransportError / Claimed
//! 5. Claimed なら `TimeLimit` を送り、prepare → run → 結果を報告

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::runtime::{ExecOutcome, TaskExecutor};
use crate::cluster::protocol::WorkerMessage;
use crate::config::WorkerConfig;
use crate::domain::{CrashReport, GetTaskReply, InvalidConfigReport, SuccessReport, TaskPayload};
use crate::ports::{DispatcherApi, HeartbeatSink};
use crate::rpc::RpcError;

/// Worker-side view of a claim attempt.
#[derive(Debug)]
pub enum FetchOutcome {
    Claimed(TaskPayload),
    Busy,
    Empty,
    ShuttingDown,
    TransportError(RpcError),
}

impl From<Result<GetTaskReply, RpcError>> for FetchOutcome {
    fn from(result: Result<GetTaskReply, RpcError>) -> Self {
        match result {
            Ok(GetTaskReply::Claimed(payload)) => Self::Claimed(payload),
            Ok(GetTaskReply::Busy) => Self::Busy,
            Ok(GetTaskReply::Empty) => Self::Empty,
            Ok(GetTaskReply::ShuttingDown) => Self::ShuttingDown,
            Err(e) => Self::TransportError(e),
        }
    }
}

/// Why the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Shutdown control message, closed stdin, or a broken heartbeat pipe.
    Shutdown,
    LifetimeReached,
    DispatcherShutdown,
    DispatcherUnreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue(Duration),
    Exit(WorkerExit),
}

pub struct WorkerLoop {
    name: String,
    config: WorkerConfig,
    dispatcher: Arc<dyn DispatcherApi>,
    executor: TaskExecutor,
    heartbeat: Arc<dyn HeartbeatSink>,
    shutdown: watch::Receiver<bool>,
    started: Instant,
    last_contact: Instant,
}

impl WorkerLoop {
    pub fn new(
        name: impl Into<String>,
        config: WorkerConfig,
        dispatcher: Arc<dyn DispatcherApi>,
        executor: TaskExecutor,
        heartbeat: Arc<dyn HeartbeatSink>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let now = Instant::now();
        Self {
            name: name.into(),
            config,
            dispatcher,
            executor,
            heartbeat,
            shutdown,
            started: now,
            last_contact: now,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn run(mut self) -> WorkerExit {
        info!(worker = %self.name, "worker started");
        let exit = loop {
            match self.step().await {
                Step::Exit(exit) => break exit,
                Step::Continue(pause) => self.pause(pause).await,
            }
        };
        info!(worker = %self.name, ?exit, uptime = ?self.started.elapsed(), "worker exiting");
        exit
    }

    /// Sleeps, waking early when the shutdown flag changes.
    async fn pause(&mut self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown.changed() => {}
        }
    }

    fn shutdown_requested(&self) -> bool {
        // a dropped sender means nobody can tell us to stop any more
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    pub async fn step(&mut self) -> Step {
        if self.shutdown_requested() {
            return Step::Exit(WorkerExit::Shutdown);
        }
        if self.started.elapsed() >= self.config.max_lifetime {
            return Step::Exit(WorkerExit::LifetimeReached);
        }
        if let Err(e) = self.heartbeat.send(&WorkerMessage::Alive { at: Utc::now() }).await {
            warn!(worker = %self.name, error = %e, "heartbeat pipe closed");
            return Step::Exit(WorkerExit::Shutdown);
        }

        let fetched = self.dispatcher.get_task(&self.name, self.config.combine).await;
        match FetchOutcome::from(fetched) {
            FetchOutcome::Claimed(payload) => {
                self.last_contact = Instant::now();
                self.execute(payload).await;
                Step::Continue(self.config.report_pause)
            }
            FetchOutcome::Busy => {
                self.last_contact = Instant::now();
                Step::Continue(self.config.busy_sleep)
            }
            FetchOutcome::Empty => {
                self.last_contact = Instant::now();
                Step::Continue(self.config.empty_sleep + self.jitter())
            }
            FetchOutcome::ShuttingDown => Step::Exit(WorkerExit::DispatcherShutdown),
            FetchOutcome::TransportError(e) => {
                let silent = self.last_contact.elapsed();
                if silent >= self.config.dispatcher_timeout {
                    warn!(worker = %self.name, error = %e, ?silent, "dispatcher unreachable, giving up");
                    return Step::Exit(WorkerExit::DispatcherUnreachable);
                }
                warn!(worker = %self.name, error = %e, "get_task failed");
                Step::Continue(self.config.unreachable_sleep)
            }
        }
    }

    fn jitter(&self) -> Duration {
        let max = self.config.empty_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    async fn execute(&self, payload: TaskPayload) {
        let task_sn = payload.task_sn;
        let time_limit = WorkerMessage::TimeLimit {
            seconds: payload.exec_time_limit,
        };
        if let Err(e) = self.heartbeat.send(&time_limit).await {
            warn!(worker = %self.name, %task_sn, error = %e, "could not announce time limit");
        }

        let call = match self.executor.prepare(&payload) {
            Ok(call) => call,
            Err(e) => {
                warn!(worker = %self.name, %task_sn, func = %payload.func_path, error = %e, "invalid task config");
                let report = InvalidConfigReport {
                    worker_name: self.name.clone(),
                    task_sn: Some(task_sn),
                    detail: e.to_string(),
                };
                if let Err(e) = self.dispatcher.invalid_config(&report).await {
                    warn!(worker = %self.name, %task_sn, error = %e, "invalid config report lost");
                }
                return;
            }
        };

        info!(worker = %self.name, %task_sn, func = %payload.func_path, "running task");
        let reported = match self.executor.run(&payload, call).await {
            ExecOutcome::Success { result, exec_warn } => {
                debug!(worker = %self.name, %task_sn, "task finished");
                let report = SuccessReport {
                    task_sn,
                    worker_name: self.name.clone(),
                    result,
                    exec_warn,
                };
                self.dispatcher.task_success(&report).await
            }
            ExecOutcome::Crash {
                message,
                detail,
                exec_warn,
            } => {
                let report = CrashReport {
                    task_sn,
                    worker_name: self.name.clone(),
                    message,
                    detail,
                    exec_warn,
                };
                self.dispatcher.task_crash(&report).await
            }
        };
        if let Err(e) = reported {
            // the lease expires and the dispatcher times the task out
            warn!(worker = %self.name, %task_sn, error = %e, "outcome report lost");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClusterState, TaskSn};
    use crate::typed::testing::{Add, AddHandler, Misbehave, MisbehaveHandler};
    use crate::typed::{Task, TypedRegistry};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted dispatcher: replays replies, records reports.
    #[derive(Default)]
    struct ScriptedDispatcher {
        replies: Mutex<VecDeque<Result<GetTaskReply, RpcError>>>,
        successes: Mutex<Vec<SuccessReport>>,
        crashes: Mutex<Vec<CrashReport>>,
        invalid: Mutex<Vec<InvalidConfigReport>>,
    }

    impl ScriptedDispatcher {
        fn with(replies: Vec<Result<GetTaskReply, RpcError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl DispatcherApi for ScriptedDispatcher {
        async fn ping(&self, _state: &ClusterState) -> Result<i32, RpcError> {
            Ok(0)
        }

        async fn get_task(
            &self,
            _worker_name: &str,
            _combine: Option<i64>,
        ) -> Result<GetTaskReply, RpcError> {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(GetTaskReply::Empty))
        }

        async fn task_success(&self, report: &SuccessReport) -> Result<bool, RpcError> {
            self.successes.lock().unwrap().push(report.clone());
            Ok(true)
        }

        async fn task_crash(&self, report: &CrashReport) -> Result<bool, RpcError> {
            self.crashes.lock().unwrap().push(report.clone());
            Ok(true)
        }

        async fn invalid_config(&self, report: &InvalidConfigReport) -> Result<bool, RpcError> {
            self.invalid.lock().unwrap().push(report.clone());
            Ok(true)
        }
    }

    #[derive(Default)]
    struct RecordingHeartbeat {
        sent: Mutex<Vec<WorkerMessage>>,
    }

    #[async_trait]
    impl HeartbeatSink for RecordingHeartbeat {
        async fn send(&self, message: &WorkerMessage) -> std::io::Result<()> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    fn executor() -> TaskExecutor {
        let mut registry = TypedRegistry::new();
        registry.register::<Add, _>(AddHandler).unwrap();
        registry.register::<Misbehave, _>(MisbehaveHandler).unwrap();
        TaskExecutor::new(Arc::new(registry))
    }

    fn payload(sn: u64, func_path: &str, args: &str, kwargs: &str) -> TaskPayload {
        TaskPayload {
            task_sn: TaskSn::new(sn),
            name: format!("t{sn}"),
            func_path: func_path.into(),
            args_blob: args.into(),
            kwargs_blob: kwargs.into(),
            exec_time_limit: 30,
        }
    }

    fn unreachable() -> RpcError {
        RpcError::Unreachable {
            method: "get_task",
            attempts: 5,
            last_error: "connection refused".into(),
        }
    }

    struct Harness {
        worker: WorkerLoop,
        dispatcher: Arc<ScriptedDispatcher>,
        heartbeat: Arc<RecordingHeartbeat>,
        shutdown: watch::Sender<bool>,
    }

    fn harness(config: WorkerConfig, replies: Vec<Result<GetTaskReply, RpcError>>) -> Harness {
        let dispatcher = ScriptedDispatcher::with(replies);
        let heartbeat = Arc::new(RecordingHeartbeat::default());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = WorkerLoop::new(
            "c-01-1234",
            config,
            dispatcher.clone(),
            executor(),
            heartbeat.clone(),
            shutdown_rx,
        );
        Harness {
            worker,
            dispatcher,
            heartbeat,
            shutdown,
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig::default().with_empty_jitter(Duration::ZERO)
    }

    #[tokio::test(start_paused = true)]
    async fn replies_map_to_sleeps() {
        let mut h = harness(
            config(),
            vec![Ok(GetTaskReply::Busy), Ok(GetTaskReply::Empty), Err(unreachable())],
        );
        assert_eq!(h.worker.step().await, Step::Continue(Duration::from_millis(500)));
        assert_eq!(h.worker.step().await, Step::Continue(Duration::from_secs(10)));
        assert_eq!(h.worker.step().await, Step::Continue(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn dispatcher_shutdown_ends_the_loop() {
        let h = harness(config(), vec![Ok(GetTaskReply::Busy), Ok(GetTaskReply::ShuttingDown)]);
        assert_eq!(h.worker.run().await, WorkerExit::DispatcherShutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn success_is_reported_after_announcing_the_limit() {
        let mut h = harness(
            config(),
            vec![Ok(GetTaskReply::Claimed(payload(1, Add::TYPE, "[2, 3]", "{}")))],
        );
        assert_eq!(h.worker.step().await, Step::Continue(Duration::from_millis(100)));

        let sent = h.heartbeat.sent.lock().unwrap().clone();
        assert!(matches!(sent[0], WorkerMessage::Alive { .. }));
        assert_eq!(sent[1], WorkerMessage::TimeLimit { seconds: 30 });

        let successes = h.dispatcher.successes.lock().unwrap();
        assert_eq!(successes.len(), 1);
        assert_eq!(successes[0].result, json!(5));
        assert_eq!(successes[0].worker_name, "c-01-1234");
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_reported_as_crashes() {
        let mut h = harness(
            config(),
            vec![Ok(GetTaskReply::Claimed(payload(
                2,
                Misbehave::TYPE,
                "[]",
                r#"{"mode": "error"}"#,
            )))],
        );
        h.worker.step().await;

        let crashes = h.dispatcher.crashes.lock().unwrap();
        assert_eq!(crashes.len(), 1);
        assert_eq!(crashes[0].task_sn, TaskSn::new(2));
        assert_eq!(crashes[0].message, "writing report");
        assert_eq!(crashes[0].exec_warn.as_deref(), Some("about to fail"));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_function_is_reported_as_invalid_config() {
        let mut h = harness(
            config(),
            vec![Ok(GetTaskReply::Claimed(payload(3, "nope.v1", "[]", "{}")))],
        );
        h.worker.step().await;

        let invalid = h.dispatcher.invalid.lock().unwrap();
        assert_eq!(invalid.len(), 1);
        assert_eq!(invalid[0].task_sn, Some(TaskSn::new(3)));
        assert_eq!(invalid[0].worker_name, "c-01-1234");
        assert!(h.dispatcher.successes.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_dispatcher_timeout() {
        let replies = (0..100).map(|_| Err(unreachable())).collect();
        let h = harness(
            config().with_dispatcher_timeout(Duration::from_secs(12)),
            replies,
        );
        let started = Instant::now();
        assert_eq!(h.worker.run().await, WorkerExit::DispatcherUnreachable);
        // three 5s sleeps: errors at 0s, 5s, 10s, then 15s >= 12s
        assert_eq!(started.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn lifetime_recycles_the_worker() {
        let h = harness(config().with_max_lifetime(Duration::from_secs(25)), vec![]);
        let started = Instant::now();
        assert_eq!(h.worker.run().await, WorkerExit::LifetimeReached);
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flag_interrupts_the_sleep() {
        let h = harness(config(), vec![]);
        let worker = tokio::spawn(h.worker.run());

        tokio::time::sleep(Duration::from_secs(1)).await;
        h.shutdown.send_replace(true);

        let exit = worker.await.unwrap();
        assert_eq!(exit, WorkerExit::Shutdown);
        assert_eq!(h.heartbeat.sent.lock().unwrap().len(), 1);
    }
}
