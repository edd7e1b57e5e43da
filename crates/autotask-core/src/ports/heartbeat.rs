//! HeartbeatSink port - worker から supervisor への片方向 pipe

use async_trait::async_trait;

use crate::cluster::protocol::WorkerMessage;

#[async_trait]
pub trait HeartbeatSink: Send + Sync {
    async fn send(&self, message: &WorkerMessage) -> std::io::Result<()>;
}
