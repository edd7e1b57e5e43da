//! Retrying call wrapper and the error surface of every RPC.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// How often and how patiently a call is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallPolicy {
    /// Total attempts, including the first.
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            backoff: Duration::from_secs(1),
        }
    }
}

impl CallPolicy {
    pub fn new(retries: u32, backoff: Duration) -> Self {
        Self { retries, backoff }
    }

    /// One attempt, no sleeping.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("{method}: dispatcher unreachable after {attempts} attempt(s): {last_error}")]
    Unreachable {
        method: &'static str,
        attempts: u32,
        last_error: String,
    },

    #[error("{method}: rejected with status {status}: {body}")]
    Rejected {
        method: &'static str,
        status: u16,
        body: String,
    },

    #[error("invalid request: {0}")]
    Request(String),

    #[error("failed to decode reply: {0}")]
    Decode(String),

    /// An in-process dispatcher failed to serve the call.
    #[error("dispatcher error: {0}")]
    Dispatcher(String),
}

impl RpcError {
    /// The dispatcher refused the shared secret.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Rejected { status: 401, .. })
    }
}

/// Classification of one failed attempt.
#[derive(Debug)]
pub enum CallFailure {
    Retriable(String),
    Fatal(RpcError),
}

/// Runs `call` until it succeeds, fails fatally, or `policy.retries` attempts
/// are spent. Sleeps `policy.backoff` between attempts.
pub async fn call_with_retry<T, F, Fut>(
    method: &'static str,
    policy: &CallPolicy,
    mut call: F,
) -> Result<T, RpcError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CallFailure>>,
{
    let attempts = policy.retries.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match call().await {
            Ok(value) => return Ok(value),
            Err(CallFailure::Fatal(err)) => return Err(err),
            Err(CallFailure::Retriable(message)) => {
                debug!(method, attempt, error = %message, "rpc attempt failed");
                last_error = message;
                if attempt < attempts {
                    tokio::time::sleep(policy.backoff).await;
                }
            }
        }
    }

    warn!(method, attempts, error = %last_error, "rpc call gave up");
    Err(RpcError::Unreachable {
        method,
        attempts,
        last_error,
    })
}
