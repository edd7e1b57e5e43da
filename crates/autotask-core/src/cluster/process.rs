//! Worker processes as seen by the supervisor.
//!
//! `WorkerLauncher` / `WorkerProcess` は seam。本番は `CommandLauncher` が
//! 自分自身のバイナリを `worker` サブコマンドで起動し、テストは fake を使う。

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{self, ControlMessage, WorkerMessage};
use crate::domain::Generation;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to launch worker for slot {slot}: {source}")]
    Launch {
        slot: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("worker {0} pipe was not captured")]
    MissingPipe(&'static str),

    #[error("worker control pipe failed: {0}")]
    Control(#[from] std::io::Error),

    #[error("control message encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What a launcher needs to start the process for one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub cluster_name: String,
    pub slot: usize,
    pub generation: Generation,
}

#[async_trait]
pub trait WorkerProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Reaps the process if it has exited.
    fn is_alive(&mut self) -> bool;

    /// Pipe messages received since the last call, oldest first.
    fn drain_messages(&mut self) -> Vec<WorkerMessage>;

    async fn send_control(&mut self, message: ControlMessage) -> Result<(), SupervisorError>;

    /// Force-kills and reaps the process.
    async fn terminate(&mut self);
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn WorkerProcess>, SupervisorError>;
}

/// Launches `program args... --slot N --generation G` with piped stdio.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            envs: Vec::new(),
        }
    }

    /// Extra environment for every child; keeps secrets off the command line.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn WorkerProcess>, SupervisorError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .arg("--slot")
            .arg(spec.slot.to_string())
            .arg("--generation")
            .arg(spec.generation.get().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| SupervisorError::Launch {
            slot: spec.slot,
            source,
        })?;
        let stdin = child.stdin.take().ok_or(SupervisorError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SupervisorError::MissingPipe("stdout"))?;

        info!(
            cluster = %spec.cluster_name,
            slot = spec.slot,
            generation = %spec.generation,
            pid = child.id(),
            "spawned worker"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_messages(stdout, spec.slot, tx));
        Ok(Box::new(ChildWorker {
            child,
            stdin: Some(stdin),
            messages: rx,
            reader,
        }))
    }
}

async fn read_messages(
    stdout: ChildStdout,
    slot: usize,
    tx: mpsc::UnboundedSender<WorkerMessage>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match protocol::decode_line::<WorkerMessage>(&line) {
                Ok(message) => {
                    if tx.send(message).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(slot, error = %e, "unparseable worker message"),
            },
            Ok(None) => {
                debug!(slot, "worker stdout closed");
                break;
            }
            Err(e) => {
                warn!(slot, error = %e, "worker stdout read failed");
                break;
            }
        }
    }
}

struct ChildWorker {
    child: Child,
    stdin: Option<ChildStdin>,
    messages: mpsc::UnboundedReceiver<WorkerMessage>,
    reader: JoinHandle<()>,
}

#[async_trait]
impl WorkerProcess for ChildWorker {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn drain_messages(&mut self) -> Vec<WorkerMessage> {
        let mut drained = Vec::new();
        while let Ok(message) = self.messages.try_recv() {
            drained.push(message);
        }
        drained
    }

    async fn send_control(&mut self, message: ControlMessage) -> Result<(), SupervisorError> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(());
        };
        let line = protocol::encode_line(&message)?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn terminate(&mut self) {
        self.stdin = None;
        if let Err(e) = self.child.start_kill() {
            warn!(pid = self.child.id(), error = %e, "kill failed");
        }
        if let Err(e) = self.child.wait().await {
            warn!(error = %e, "reaping killed worker failed");
        }
        self.reader.abort();
    }
}

impl Drop for ChildWorker {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            cluster_name: "c".into(),
            slot: 0,
            generation: Generation::new(1),
        }
    }

    #[tokio::test]
    async fn reads_messages_from_the_child() {
        // `sh -c script sh --slot 0 --generation 1`: trailing args land in $@
        let launcher = CommandLauncher::new(
            "sh",
            vec![
                "-c".into(),
                r#"echo '{"kind":"time_limit","seconds":7}'; echo garbage; sleep 5"#.into(),
                "sh".into(),
            ],
        );
        let mut worker = launcher.launch(&spec()).await.unwrap();
        assert!(worker.pid().is_some());

        let mut received = Vec::new();
        for _ in 0..100 {
            received.extend(worker.drain_messages());
            if !received.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(received, vec![WorkerMessage::TimeLimit { seconds: 7 }]);
        assert!(worker.is_alive());

        worker.terminate().await;
        assert!(!worker.is_alive());
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_error() {
        let launcher = CommandLauncher::new("/nonexistent/autotask-worker", vec![]);
        let err = launcher.launch(&spec()).await.err().unwrap();
        assert!(matches!(err, SupervisorError::Launch { slot: 0, .. }));
    }
}
