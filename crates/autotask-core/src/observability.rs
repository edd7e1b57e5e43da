use serde::{Deserialize, Serialize};

/// Dispatcher queue snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub available: usize,
    pub claimed: usize,
    pub blocked_keys: usize,
}

/// In-memory store snapshot, one counter per record state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCounts {
    pub init: usize,
    pub running: usize,
    pub crash: usize,
    pub success: usize,
    pub fail: usize,
}
