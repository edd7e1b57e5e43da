//! Worker ↔ supervisor pipe protocol.
//!
//! One JSON object per line. Workers write `WorkerMessage`s to stdout and
//! read `ControlMessage`s from stdin.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// The worker is between tasks and healthy.
    Alive { at: DateTime<Utc> },
    /// The worker started a task allowed to run for `seconds`.
    TimeLimit { seconds: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Finish the current task, then exit.
    Shutdown,
}

/// Serializes `message` as one newline-terminated line.
pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> serde_json::Result<T> {
    serde_json::from_str(line.trim())
}
