//! Persistent record state machine (Task Store side).

use serde::{Deserialize, Serialize};

/// Record states, ordered numerically: `fail < crash <= init < running < success`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Fail,
    Crash,
    Init,
    Running,
    Success,
}

impl RecordState {
    pub const fn code(self) -> i16 {
        match self {
            Self::Fail => -100,
            Self::Crash => -10,
            Self::Init => 0,
            Self::Running => 10,
            Self::Success => 100,
        }
    }

    /// `fail < state < success`
    pub fn is_live(self) -> bool {
        Self::Fail < self && self < Self::Success
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Fail | Self::Success)
    }

    /// Waiting for a worker (never run, or crashed and awaiting retry).
    pub fn is_claimable(self) -> bool {
        matches!(self, Self::Init | Self::Crash)
    }
}

/// Why a running record left the running state abnormally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Crash,
    Timeout,
    InvalidConfig,
}

impl ErrorCode {
    pub const fn code(self) -> u32 {
        match self {
            Self::Crash => 100_001,
            Self::Timeout => 200_001,
            Self::InvalidConfig => 300_001,
        }
    }
}
