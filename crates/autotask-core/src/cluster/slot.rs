//! WorkerSlot - pool 内の 1 枠
//!
//! absent → alive → (stale | crashed) → absent を繰り返す。
//! deadline を過ぎた process は強制終了する。

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::process::{LaunchSpec, SupervisorError, WorkerLauncher, WorkerProcess};
use super::protocol::{ControlMessage, WorkerMessage};
use crate::domain::Generation;

/// How far ahead a worker's deadline is pushed.
#[derive(Debug, Clone, Copy)]
pub struct DeadlinePolicy {
    pub exec_time_limit: Duration,
    pub grace: Duration,
}

impl DeadlinePolicy {
    fn after_alive(&self, now: Instant) -> Instant {
        now + self.exec_time_limit + self.grace
    }

    fn after_time_limit(&self, now: Instant, seconds: u64) -> Instant {
        now + Duration::from_secs(seconds) + self.grace
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotCheck {
    Empty,
    Alive,
    /// The process exited on its own.
    Exited,
    /// The deadline passed and the process was killed.
    Killed,
}

pub struct WorkerSlot {
    index: usize,
    generation: Generation,
    process: Option<Box<dyn WorkerProcess>>,
    deadline: Option<Instant>,
}

impl WorkerSlot {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            generation: Generation::new(0),
            process: None,
            deadline: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Generation of the most recent spawn; 0 before the first.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_occupied(&self) -> bool {
        self.process.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.pid())
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub async fn spawn(
        &mut self,
        launcher: &dyn WorkerLauncher,
        cluster_name: &str,
        policy: &DeadlinePolicy,
    ) -> Result<(), SupervisorError> {
        // consumed even when the launch fails, so generations never repeat
        self.generation = Generation::new(self.generation.get() + 1);
        let spec = LaunchSpec {
            cluster_name: cluster_name.to_string(),
            slot: self.index,
            generation: self.generation,
        };
        let process = launcher.launch(&spec).await?;
        self.process = Some(process);
        self.deadline = Some(policy.after_alive(Instant::now()));
        Ok(())
    }

    /// Reaps, applies pipe messages, and enforces the deadline.
    pub async fn check(&mut self, policy: &DeadlinePolicy) -> SlotCheck {
        let Some(process) = self.process.as_mut() else {
            return SlotCheck::Empty;
        };
        if !process.is_alive() {
            debug!(slot = self.index, generation = %self.generation, "worker exited");
            self.clear();
            return SlotCheck::Exited;
        }

        let now = Instant::now();
        for message in process.drain_messages() {
            self.deadline = Some(match message {
                WorkerMessage::Alive { .. } => policy.after_alive(now),
                WorkerMessage::TimeLimit { seconds } => policy.after_time_limit(now, seconds),
            });
        }

        if self.deadline.is_some_and(|deadline| now >= deadline) {
            warn!(
                slot = self.index,
                generation = %self.generation,
                pid = process.pid(),
                "worker missed its deadline, killing"
            );
            process.terminate().await;
            self.clear();
            return SlotCheck::Killed;
        }
        SlotCheck::Alive
    }

    pub async fn send_control(&mut self, message: ControlMessage) {
        if let Some(process) = self.process.as_mut()
            && let Err(e) = process.send_control(message).await
        {
            warn!(slot = self.index, error = %e, "control message not delivered");
        }
    }

    fn clear(&mut self) {
        self.process = None;
        self.deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::FakeLauncher;

    fn policy() -> DeadlinePolicy {
        DeadlinePolicy {
            exec_time_limit: Duration::from_secs(20),
            grace: Duration::from_secs(2),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn generations_increase_across_respawns() {
        let launcher = FakeLauncher::default();
        let mut slot = WorkerSlot::new(3);

        slot.spawn(&launcher, "c", &policy()).await.unwrap();
        assert_eq!(slot.generation(), Generation::new(1));
        assert_eq!(slot.check(&policy()).await, SlotCheck::Alive);

        launcher.process(0).exit();
        assert_eq!(slot.check(&policy()).await, SlotCheck::Exited);
        assert!(!slot.is_occupied());

        slot.spawn(&launcher, "c", &policy()).await.unwrap();
        assert_eq!(slot.generation(), Generation::new(2));
        assert_eq!(launcher.specs()[1].slot, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_worker_is_killed_after_limit_plus_grace() {
        let launcher = FakeLauncher::default();
        let mut slot = WorkerSlot::new(0);
        slot.spawn(&launcher, "c", &policy()).await.unwrap();

        tokio::time::advance(Duration::from_secs(21)).await;
        assert_eq!(slot.check(&policy()).await, SlotCheck::Alive);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(slot.check(&policy()).await, SlotCheck::Killed);
        assert!(launcher.process(0).was_killed());
    }

    #[tokio::test(start_paused = true)]
    async fn time_limit_moves_the_deadline() {
        let launcher = FakeLauncher::default();
        let mut slot = WorkerSlot::new(0);
        slot.spawn(&launcher, "c", &policy()).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        launcher
            .process(0)
            .push(WorkerMessage::TimeLimit { seconds: 60 });
        assert_eq!(slot.check(&policy()).await, SlotCheck::Alive);

        // deadline is now 10 + 60 + 2
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(slot.check(&policy()).await, SlotCheck::Alive);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(slot.check(&policy()).await, SlotCheck::Killed);
    }
}
