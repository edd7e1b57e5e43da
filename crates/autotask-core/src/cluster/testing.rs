//! In-process fakes for supervisor tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::process::{LaunchSpec, SupervisorError, WorkerLauncher, WorkerProcess};
use super::protocol::{ControlMessage, WorkerMessage};

#[derive(Default)]
struct FakeState {
    exited: bool,
    killed: bool,
    inbox: Vec<WorkerMessage>,
    controls: Vec<ControlMessage>,
}

/// Test-side handle onto one fake process.
#[derive(Clone)]
pub(crate) struct FakeHandle {
    pid: u32,
    state: Arc<Mutex<FakeState>>,
}

impl FakeHandle {
    pub(crate) fn exit(&self) {
        self.state.lock().unwrap().exited = true;
    }

    pub(crate) fn push(&self, message: WorkerMessage) {
        self.state.lock().unwrap().inbox.push(message);
    }

    pub(crate) fn was_killed(&self) -> bool {
        self.state.lock().unwrap().killed
    }

    pub(crate) fn controls(&self) -> Vec<ControlMessage> {
        self.state.lock().unwrap().controls.clone()
    }
}

struct FakeProcess(FakeHandle);

#[async_trait]
impl WorkerProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.0.pid)
    }

    fn is_alive(&mut self) -> bool {
        let state = self.0.state.lock().unwrap();
        !state.exited && !state.killed
    }

    fn drain_messages(&mut self) -> Vec<WorkerMessage> {
        std::mem::take(&mut self.0.state.lock().unwrap().inbox)
    }

    async fn send_control(&mut self, message: ControlMessage) -> Result<(), SupervisorError> {
        self.0.state.lock().unwrap().controls.push(message);
        Ok(())
    }

    async fn terminate(&mut self) {
        self.0.state.lock().unwrap().killed = true;
    }
}

/// Hands out fake processes with pids 1000, 1001, ...
#[derive(Default)]
pub(crate) struct FakeLauncher {
    launched: Mutex<Vec<(LaunchSpec, FakeHandle)>>,
}

impl FakeLauncher {
    pub(crate) fn process(&self, index: usize) -> FakeHandle {
        self.launched.lock().unwrap()[index].1.clone()
    }

    pub(crate) fn specs(&self) -> Vec<LaunchSpec> {
        self.launched
            .lock()
            .unwrap()
            .iter()
            .map(|(spec, _)| spec.clone())
            .collect()
    }

    pub(crate) fn launched(&self) -> usize {
        self.launched.lock().unwrap().len()
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn WorkerProcess>, SupervisorError> {
        let mut launched = self.launched.lock().unwrap();
        let handle = FakeHandle {
            pid: 1000 + launched.len() as u32,
            state: Arc::default(),
        };
        launched.push((spec.clone(), handle.clone()));
        Ok(Box::new(FakeProcess(handle)))
    }
}
