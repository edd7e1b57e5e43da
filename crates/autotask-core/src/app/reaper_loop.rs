//! ReaperLoop - 定期 refresh と lease 期限切れの回収
//!
//! # フロー
//! 1. refresh_interval ごとに store の overtime sweep と due scheme の展開を実行
//! 2. `DispatcherCore::refresh_queue()` で期限切れ lease を報告し、queue を作り直す
//! 3. shutdown 要求後は claimed task が無くなるか drain_timeout が過ぎるまで待って終了

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::dispatcher::{DispatcherCore, RefreshReport};
use crate::ports::TaskStore;

/// How often draining re-checks for outstanding claims.
const DRAIN_POLL: Duration = Duration::from_millis(250);

pub struct ReaperLoop {
    core: Arc<DispatcherCore>,
    store: Arc<dyn TaskStore>,
    interval: Duration,
    drain_timeout: Duration,
}

impl ReaperLoop {
    pub fn new(core: Arc<DispatcherCore>) -> Self {
        Self {
            store: Arc::clone(core.store()),
            interval: core.config().refresh_interval,
            drain_timeout: core.config().drain_timeout,
            core,
        }
    }

    /// Returns once a requested shutdown has drained or timed out.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.core.subscribe_shutdown();

        while !self.core.is_shutting_down() {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(timeout = ?self.drain_timeout, "dispatcher draining");
        let deadline = Instant::now() + self.drain_timeout;
        loop {
            if self.core.is_drained().await {
                info!("dispatcher drained");
                return;
            }
            if Instant::now() >= deadline {
                let claimed = self.core.status().await.running_tasks.len();
                warn!(claimed, "drain timeout elapsed with tasks still claimed");
                return;
            }
            // leases keep expiring while draining; a dead worker must not hold us up
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = tokio::time::sleep(DRAIN_POLL) => {}
            }
        }
    }

    pub async fn tick(&self) -> Option<RefreshReport> {
        match self.store.overtime_task_process().await {
            Ok(0) => {}
            Ok(swept) => info!(swept, "store timed out overdue tasks"),
            Err(e) => warn!(error = %e, "overtime sweep failed"),
        }
        match self.store.process_due_schemes().await {
            Ok(0) => {}
            Ok(created) => info!(created, "scheme tasks created"),
            Err(e) => warn!(error = %e, "scheme processing failed"),
        }
        match self.core.refresh_queue().await {
            Ok(report) => {
                debug!(queued = report.queued, timed_out = report.timed_out.len(), "refresh tick");
                Some(report)
            }
            Err(e) => {
                warn!(error = %e, "queue refresh failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DispatcherConfig, StoreConfig};
    use crate::domain::{GetTaskReply, SuccessReport};
    use crate::ports::SystemClock;
    use crate::store::{InMemoryTaskStore, SchemeSubmission, TaskSubmission};
    use serde_json::json;

    fn core(drain_timeout: Duration) -> (Arc<DispatcherCore>, Arc<InMemoryTaskStore>) {
        let clock = Arc::new(SystemClock);
        let store = Arc::new(InMemoryTaskStore::new(StoreConfig::default(), clock.clone()));
        let config = DispatcherConfig::default()
            .with_refresh_interval(Duration::from_secs(5))
            .with_drain_timeout(drain_timeout);
        (Arc::new(DispatcherCore::new(config, store.clone(), clock)), store)
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_refresh_picks_up_new_tasks() {
        let (core, store) = core(Duration::from_secs(60));
        let reaper = tokio::spawn(ReaperLoop::new(Arc::clone(&core)).run());

        store.submit(TaskSubmission::new("t", "demo.echo.v1")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(matches!(core.get_task("w-01", None).await, GetTaskReply::Claimed(_)));

        reaper.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn tick_expands_due_schemes_before_refreshing() {
        let (core, store) = core(Duration::from_secs(60));
        store
            .add_scheme(SchemeSubmission::new(
                "soon",
                TaskSubmission::new("x", "demo.echo.v1"),
                10,
                chrono::Utc::now() - chrono::Duration::seconds(60),
            ))
            .await
            .unwrap();

        let report = ReaperLoop::new(Arc::clone(&core)).tick().await.unwrap();
        assert_eq!(report.queued, 1);
        assert!(matches!(core.get_task("w-01", None).await, GetTaskReply::Claimed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn exits_once_drained() {
        let (core, store) = core(Duration::from_secs(60));
        let sn = store.submit(TaskSubmission::new("t", "demo.echo.v1")).await.unwrap();
        core.refresh_queue().await.unwrap();
        assert!(matches!(core.get_task("w-01", None).await, GetTaskReply::Claimed(_)));

        let reaper = tokio::spawn(ReaperLoop::new(Arc::clone(&core)).run());
        core.shutdown();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!reaper.is_finished());

        core.task_success(&SuccessReport {
            task_sn: sn,
            worker_name: "w-01".into(),
            result: json!(1),
            exec_warn: None,
        })
        .await
        .unwrap();
        tokio::time::timeout(Duration::from_secs(1), reaper)
            .await
            .expect("reaper should stop after draining")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_gives_up_after_the_timeout() {
        let (core, store) = core(Duration::from_secs(3));
        store.submit(TaskSubmission::new("t", "demo.echo.v1")).await.unwrap();
        core.refresh_queue().await.unwrap();
        core.get_task("w-01", None).await;
        core.shutdown();

        let started = Instant::now();
        ReaperLoop::new(Arc::clone(&core)).run().await;
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(!core.is_drained().await);
    }
}
