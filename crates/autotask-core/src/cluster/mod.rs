//! Cluster - worker process の pool と supervisor
//!
//! - `supervisor`: Cluster（ping、respawn、drain）
//! - `slot`: WorkerSlot（generation と deadline）
//! - `process`: WorkerLauncher / WorkerProcess と tokio::process 実装
//! - `protocol` / `pipe`: stdio 上の JSON line protocol

pub mod pipe;
pub mod process;
pub mod protocol;
pub mod slot;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use self::pipe::{PipeHeartbeat, StdioHeartbeat, watch_control};
pub use self::process::{
    CommandLauncher, LaunchSpec, SupervisorError, WorkerLauncher, WorkerProcess,
};
pub use self::protocol::{ControlMessage, WorkerMessage};
pub use self::slot::{DeadlinePolicy, SlotCheck, WorkerSlot};
pub use self::supervisor::{Cluster, ClusterPhase};
