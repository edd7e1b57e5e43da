//! Worker-side ends of the supervisor pipe.
//!
//! stdout: `WorkerMessage` を書く（`PipeHeartbeat`）。
//! stdin: `ControlMessage` を読む（`watch_control`）。EOF は supervisor 消失とみなし shutdown。

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{self, ControlMessage, WorkerMessage};
use crate::ports::HeartbeatSink;

pub struct PipeHeartbeat<W> {
    writer: Mutex<W>,
}

pub type StdioHeartbeat = PipeHeartbeat<Stdout>;

impl<W> PipeHeartbeat<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl StdioHeartbeat {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> HeartbeatSink for PipeHeartbeat<W> {
    async fn send(&self, message: &WorkerMessage) -> std::io::Result<()> {
        let line = protocol::encode_line(message).map_err(std::io::Error::other)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    }
}

/// Reads control lines until EOF. The returned flag flips to `true` on
/// `Shutdown` or when the pipe closes.
pub fn watch_control<R>(reader: R) -> (watch::Receiver<bool>, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match protocol::decode_line::<ControlMessage>(&line) {
                    Ok(ControlMessage::Shutdown) => {
                        info!("shutdown requested by supervisor");
                        tx.send_replace(true);
                    }
                    Err(e) => warn!(error = %e, "unparseable control message"),
                },
                Ok(None) => {
                    debug!("control pipe closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "control pipe read failed");
                    break;
                }
            }
        }
        tx.send_replace(true);
    });
    (rx, handle)
}
