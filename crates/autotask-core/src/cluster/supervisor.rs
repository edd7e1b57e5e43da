//! Cluster - host 上の worker pool を管理する supervisor
//!
//! # フロー（1 tick）
//! 1. 各 slot を check（reap、pipe message 反映、deadline 超過なら kill）
//! 2. ping_interval ごとに dispatcher へ ping（ping_timeout で打ち切り、slot check を止めない）
//! 3. Online なら空き slot を respawn、Draining で全 slot が空なら Offline
//!
//! Offline 中も ping は続け、contact が戻れば Online に戻る。

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use super::process::WorkerLauncher;
use super::protocol::ControlMessage;
use super::slot::{DeadlinePolicy, SlotCheck, WorkerSlot};
use crate::config::ClusterConfig;
use crate::domain::{ClusterRunId, ClusterState, ClusterStatus};
use crate::ports::{DispatcherApi, IdGenerator, SystemClock, UlidGenerator};

/// Codes below this are protocol errors rather than dispatcher states.
const PROTOCOL_ERROR_BELOW: i32 = -10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterPhase {
    Online,
    /// Shutdown sent to the workers; waiting for every slot to empty.
    Draining,
    Offline,
}

pub struct Cluster {
    config: ClusterConfig,
    run_id: ClusterRunId,
    dispatcher: Arc<dyn DispatcherApi>,
    launcher: Arc<dyn WorkerLauncher>,
    policy: DeadlinePolicy,
    slots: Vec<WorkerSlot>,
    phase: ClusterPhase,
    stopping: bool,
    last_contact: Instant,
    last_ping: Option<Instant>,
}

impl Cluster {
    pub fn new(
        config: ClusterConfig,
        dispatcher: Arc<dyn DispatcherApi>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        let policy = DeadlinePolicy {
            exec_time_limit: config.exec_time_limit,
            grace: config.deadline_grace,
        };
        Self {
            run_id: UlidGenerator::new(SystemClock).cluster_run_id(),
            slots: (0..config.pool_size).map(WorkerSlot::new).collect(),
            config,
            dispatcher,
            launcher,
            policy,
            phase: ClusterPhase::Online,
            stopping: false,
            last_contact: Instant::now(),
            last_ping: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn run_id(&self) -> ClusterRunId {
        self.run_id
    }

    pub fn phase(&self) -> ClusterPhase {
        self.phase
    }

    pub fn slots(&self) -> &[WorkerSlot] {
        &self.slots
    }

    pub fn pids(&self) -> Vec<u32> {
        self.slots.iter().filter_map(WorkerSlot::pid).collect()
    }

    pub fn all_slots_empty(&self) -> bool {
        self.slots.iter().all(|slot| !slot.is_occupied())
    }

    pub fn state(&self) -> ClusterState {
        ClusterState {
            name: self.config.name.clone(),
            pids: self.pids(),
            status: match self.phase {
                ClusterPhase::Online if !self.stopping => ClusterStatus::Online,
                _ => ClusterStatus::Offline,
            },
        }
    }

    pub async fn tick(&mut self) {
        self.check_slots().await;

        let ping_due = self
            .last_ping
            .is_none_or(|at| at.elapsed() >= self.config.ping_interval);
        if ping_due {
            self.ping().await;
        }

        if self.phase == ClusterPhase::Online
            && self.last_contact.elapsed() >= self.config.dispatcher_timeout
        {
            warn!(
                cluster = %self.config.name,
                silent = ?self.last_contact.elapsed(),
                "dispatcher unreachable"
            );
            self.begin_drain().await;
        }

        match self.phase {
            ClusterPhase::Online if !self.stopping => self.fill_slots().await,
            ClusterPhase::Draining if self.all_slots_empty() => {
                info!(cluster = %self.config.name, "all workers gone, cluster offline");
                self.phase = ClusterPhase::Offline;
            }
            _ => {}
        }
    }

    async fn check_slots(&mut self) {
        for slot in &mut self.slots {
            match slot.check(&self.policy).await {
                SlotCheck::Exited => {
                    info!(cluster = %self.config.name, slot = slot.index(), generation = %slot.generation(), "worker exited");
                }
                SlotCheck::Killed => {
                    warn!(cluster = %self.config.name, slot = slot.index(), generation = %slot.generation(), "worker killed");
                }
                SlotCheck::Empty | SlotCheck::Alive => {}
            }
        }
    }

    async fn fill_slots(&mut self) {
        for slot in &mut self.slots {
            if slot.is_occupied() {
                continue;
            }
            if let Err(e) = slot
                .spawn(self.launcher.as_ref(), &self.config.name, &self.policy)
                .await
            {
                error!(cluster = %self.config.name, slot = slot.index(), error = %e, "respawn failed");
            }
        }
    }

    async fn ping(&mut self) {
        self.last_ping = Some(Instant::now());
        let state = self.state();
        let reply = tokio::time::timeout(self.config.ping_timeout, self.dispatcher.ping(&state)).await;
        let Ok(reply) = reply else {
            warn!(cluster = %self.config.name, timeout = ?self.config.ping_timeout, "ping timed out");
            return;
        };
        match reply {
            Ok(-1) => {
                if self.phase == ClusterPhase::Online {
                    info!(cluster = %self.config.name, "dispatcher is shutting down");
                }
                self.begin_drain().await;
            }
            Ok(code) if code >= 0 => {
                self.last_contact = Instant::now();
                if self.phase == ClusterPhase::Offline && !self.stopping {
                    info!(cluster = %self.config.name, code, "dispatcher reachable, cluster online");
                    self.phase = ClusterPhase::Online;
                }
            }
            Ok(code) if code < PROTOCOL_ERROR_BELOW => {
                error!(cluster = %self.config.name, code, "ping rejected as a protocol error");
            }
            Ok(code) => {
                warn!(cluster = %self.config.name, code, "unexpected ping reply");
            }
            Err(e) => {
                warn!(cluster = %self.config.name, error = %e, "ping failed");
            }
        }
    }

    /// Online → Draining. Workers finish their task and exit.
    async fn begin_drain(&mut self) {
        if self.phase != ClusterPhase::Online {
            return;
        }
        self.phase = ClusterPhase::Draining;
        self.broadcast_shutdown().await;
    }

    async fn broadcast_shutdown(&mut self) {
        for slot in &mut self.slots {
            slot.send_control(ControlMessage::Shutdown).await;
        }
    }

    /// Ticks every `check_interval` until `stop` flips, then drains and
    /// returns once every slot is empty.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        info!(
            cluster = %self.config.name,
            run = %self.run_id,
            pool_size = self.config.pool_size,
            "cluster started"
        );
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                changed = stop.changed(), if !self.stopping => {
                    if changed.is_err() || *stop.borrow() {
                        self.request_stop().await;
                    }
                }
            }
            if self.stopping && self.all_slots_empty() {
                break;
            }
        }
        info!(cluster = %self.config.name, "cluster stopped");
    }

    async fn request_stop(&mut self) {
        info!(cluster = %self.config.name, "stop requested, shutting workers down");
        self.stopping = true;
        self.broadcast_shutdown().await;
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.config.name)
            .field("run_id", &self.run_id)
            .field("phase", &self.phase)
            .field("stopping", &self.stopping)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::FakeLauncher;
    use crate::cluster::protocol::WorkerMessage;
    use crate::domain::{
        CrashReport, Generation, GetTaskReply, InvalidConfigReport, SuccessReport,
    };
    use crate::rpc::RpcError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Answers every ping with `code`; `None` means unreachable.
    struct PingDispatcher {
        code: Mutex<Option<i32>>,
        pings: Mutex<Vec<ClusterState>>,
        hang: AtomicBool,
    }

    impl PingDispatcher {
        fn new(code: Option<i32>) -> Arc<Self> {
            Arc::new(Self {
                code: Mutex::new(code),
                pings: Mutex::new(Vec::new()),
                hang: AtomicBool::new(false),
            })
        }

        /// Pings never return.
        fn hanging() -> Arc<Self> {
            let dispatcher = Self::new(Some(0));
            dispatcher.hang.store(true, Ordering::SeqCst);
            dispatcher
        }

        fn answer(&self, code: Option<i32>) {
            *self.code.lock().unwrap() = code;
        }

        fn last_ping(&self) -> ClusterState {
            self.pings.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl DispatcherApi for PingDispatcher {
        async fn ping(&self, state: &ClusterState) -> Result<i32, RpcError> {
            self.pings.lock().unwrap().push(state.clone());
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            let code = *self.code.lock().unwrap();
            code.ok_or_else(|| RpcError::Unreachable {
                method: "ping",
                attempts: 1,
                last_error: "connection refused".into(),
            })
        }

        async fn get_task(&self, _: &str, _: Option<i64>) -> Result<GetTaskReply, RpcError> {
            Ok(GetTaskReply::Empty)
        }

        async fn task_success(&self, _: &SuccessReport) -> Result<bool, RpcError> {
            Ok(true)
        }

        async fn task_crash(&self, _: &CrashReport) -> Result<bool, RpcError> {
            Ok(true)
        }

        async fn invalid_config(&self, _: &InvalidConfigReport) -> Result<bool, RpcError> {
            Ok(true)
        }
    }

    fn config() -> ClusterConfig {
        ClusterConfig::new("edge", 2)
    }

    fn cluster(dispatcher: Arc<PingDispatcher>, launcher: Arc<FakeLauncher>) -> Cluster {
        Cluster::new(config(), dispatcher, launcher)
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_fills_the_pool_and_pings() {
        let dispatcher = PingDispatcher::new(Some(0));
        let launcher = Arc::new(FakeLauncher::default());
        let mut cluster = cluster(dispatcher.clone(), launcher.clone());

        cluster.tick().await;
        assert_eq!(launcher.launched(), 2);
        assert_eq!(cluster.pids(), vec![1000, 1001]);
        assert_eq!(dispatcher.last_ping().status, ClusterStatus::Online);
        assert_eq!(dispatcher.last_ping().name, "edge");
    }

    #[tokio::test(start_paused = true)]
    async fn dead_worker_is_replaced_within_one_check() {
        let dispatcher = PingDispatcher::new(Some(1));
        let launcher = Arc::new(FakeLauncher::default());
        let mut cluster = cluster(dispatcher, launcher.clone());
        cluster.tick().await;

        launcher.process(1).exit();
        tokio::time::advance(Duration::from_secs(1)).await;
        cluster.tick().await;

        assert_eq!(launcher.launched(), 3);
        let respawn = &launcher.specs()[2];
        assert_eq!(respawn.slot, 1);
        assert!(respawn.generation > Generation::new(1));
        assert_eq!(cluster.pids(), vec![1000, 1002]);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_worker_is_killed_and_replaced() {
        let dispatcher = PingDispatcher::new(Some(0));
        let launcher = Arc::new(FakeLauncher::default());
        let mut cluster = cluster(dispatcher, launcher.clone());
        cluster.tick().await;

        // slot 0 keeps reporting, slot 1 goes silent
        for _ in 0..22 {
            tokio::time::advance(Duration::from_secs(1)).await;
            launcher.process(0).push(WorkerMessage::Alive {
                at: chrono::Utc::now(),
            });
            cluster.tick().await;
        }

        assert!(!launcher.process(0).was_killed());
        assert!(launcher.process(1).was_killed());
        assert_eq!(launcher.launched(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatcher_shutdown_drains_then_contact_restores() {
        let dispatcher = PingDispatcher::new(Some(0));
        let launcher = Arc::new(FakeLauncher::default());
        let mut cluster = cluster(dispatcher.clone(), launcher.clone());
        cluster.tick().await;

        dispatcher.answer(Some(-1));
        tokio::time::advance(Duration::from_secs(10)).await;
        cluster.tick().await;
        assert_eq!(cluster.phase(), ClusterPhase::Draining);
        assert_eq!(launcher.process(0).controls(), vec![ControlMessage::Shutdown]);
        assert_eq!(launcher.process(1).controls(), vec![ControlMessage::Shutdown]);

        launcher.process(0).exit();
        launcher.process(1).exit();
        tokio::time::advance(Duration::from_secs(1)).await;
        cluster.tick().await;
        assert_eq!(cluster.phase(), ClusterPhase::Offline);
        assert_eq!(launcher.launched(), 2, "no respawn while offline");

        dispatcher.answer(Some(1));
        tokio::time::advance(Duration::from_secs(10)).await;
        cluster.tick().await;
        assert_eq!(cluster.phase(), ClusterPhase::Online);
        assert_eq!(launcher.launched(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_past_the_timeout_drains() {
        let dispatcher = PingDispatcher::new(None);
        let launcher = Arc::new(FakeLauncher::default());
        let mut cluster = cluster(dispatcher, launcher.clone());
        cluster.tick().await;

        tokio::time::advance(Duration::from_secs(119)).await;
        cluster.tick().await;
        assert_eq!(cluster.phase(), ClusterPhase::Online);

        tokio::time::advance(Duration::from_secs(1)).await;
        cluster.tick().await;
        assert_eq!(cluster.phase(), ClusterPhase::Draining);
    }

    #[tokio::test(start_paused = true)]
    async fn protocol_errors_are_not_contact() {
        let dispatcher = PingDispatcher::new(Some(-99));
        let launcher = Arc::new(FakeLauncher::default());
        let mut cluster = cluster(dispatcher.clone(), launcher.clone());
        cluster.tick().await;

        // workers stay healthy, so only the missing contact can drain
        for second in 1..=120 {
            tokio::time::advance(Duration::from_secs(1)).await;
            for slot in 0..2 {
                launcher.process(slot).push(WorkerMessage::Alive {
                    at: chrono::Utc::now(),
                });
            }
            cluster.tick().await;
            if second < 120 {
                assert_eq!(cluster.phase(), ClusterPhase::Online, "drained early at {second}s");
            }
        }

        assert_eq!(cluster.phase(), ClusterPhase::Draining);
        assert!(!launcher.process(0).was_killed());
        assert_eq!(launcher.process(0).controls(), vec![ControlMessage::Shutdown]);
        assert!(dispatcher.pings.lock().unwrap().len() >= 12);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_ping_does_not_stall_slot_checks() {
        let dispatcher = PingDispatcher::hanging();
        let launcher = Arc::new(FakeLauncher::default());
        let mut cluster = cluster(dispatcher, launcher.clone());

        let started = Instant::now();
        cluster.tick().await;
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(launcher.launched(), 2);

        launcher.process(0).exit();
        tokio::time::advance(Duration::from_secs(1)).await;
        let started = Instant::now();
        cluster.tick().await;
        // ping not due yet: the dead slot is replaced at once
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(launcher.launched(), 3);
        assert_eq!(cluster.phase(), ClusterPhase::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn run_exits_only_after_every_slot_is_dead() {
        let dispatcher = PingDispatcher::new(Some(0));
        let launcher = Arc::new(FakeLauncher::default());
        let cluster = cluster(dispatcher, launcher.clone());
        let (stop, stop_rx) = watch::channel(false);
        let running = tokio::spawn(cluster.run(stop_rx));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(launcher.launched(), 2);
        stop.send_replace(true);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!running.is_finished());
        assert_eq!(launcher.process(0).controls(), vec![ControlMessage::Shutdown]);

        launcher.process(0).exit();
        launcher.process(1).exit();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(running.is_finished());
        assert_eq!(launcher.launched(), 2);
    }
}
