//! Runtime configuration for the dispatcher, cluster, worker and the in-memory store.
//!
//! Defaults mirror the long-standing AutoTask settings: port 8890, queue 500,
//! dispatcher timeout 120s, pool of 2, worker lifetime 600s, 20s exec limit,
//! 5 executions, 30s retry delay.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::rpc::CallPolicy;

pub const DEFAULT_NAME: &str = "AutoTask";
pub const DEFAULT_PORT: u16 = 8890;

/// Configuration for the dispatcher process.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub name: String,
    pub listen: SocketAddr,
    /// Shared secret expected in the `x-autotask-key` header. `None` disables the check.
    pub auth_key: Option<String>,
    /// Upper bound on in-memory queue entries.
    pub queue_size: usize,
    /// How often the queue is rebuilt from the store.
    pub refresh_interval: Duration,
    /// Slack added to a lease expiry before the dispatcher declares a timeout.
    pub lease_grace: Duration,
    /// How long a requested shutdown waits for claimed tasks to finish.
    pub drain_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            auth_key: None,
            queue_size: 500,
            refresh_interval: Duration::from_secs(5),
            lease_grace: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(60),
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }

    pub fn with_auth_key(mut self, key: Option<String>) -> Self {
        self.auth_key = key.filter(|k| !k.is_empty());
        self
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size.max(1);
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_lease_grace(mut self, grace: Duration) -> Self {
        self.lease_grace = grace;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

/// Configuration for one cluster supervisor.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub name: String,
    pub pool_size: usize,
    /// Supervisor loop period: drains pipes, enforces deadlines, respawns.
    pub check_interval: Duration,
    pub ping_interval: Duration,
    /// A ping taking longer counts as failed, so slot checks keep their pace.
    pub ping_timeout: Duration,
    /// Go offline after this long without a successful ping.
    pub dispatcher_timeout: Duration,
    /// Deadline used until a worker announces the limit of its current task.
    pub exec_time_limit: Duration,
    /// Added to every worker deadline.
    pub deadline_grace: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            pool_size: 2,
            check_interval: Duration::from_secs(1),
            ping_interval: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(3),
            dispatcher_timeout: Duration::from_secs(120),
            exec_time_limit: Duration::from_secs(20),
            deadline_grace: Duration::from_secs(2),
        }
    }
}

impl ClusterConfig {
    pub fn new(name: impl Into<String>, pool_size: usize) -> Self {
        Self {
            name: name.into(),
            pool_size,
            ..Default::default()
        }
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn with_dispatcher_timeout(mut self, timeout: Duration) -> Self {
        self.dispatcher_timeout = timeout;
        self
    }

    pub fn with_exec_time_limit(mut self, limit: Duration) -> Self {
        self.exec_time_limit = limit;
        self
    }

    pub fn with_deadline_grace(mut self, grace: Duration) -> Self {
        self.deadline_grace = grace;
        self
    }
}

/// Configuration for the loop inside a worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Recycle the process after this long.
    pub max_lifetime: Duration,
    pub busy_sleep: Duration,
    pub empty_sleep: Duration,
    /// Random extra sleep on top of `empty_sleep`, so idle workers spread out.
    pub empty_jitter: Duration,
    pub unreachable_sleep: Duration,
    /// Exit after this long without reaching the dispatcher.
    pub dispatcher_timeout: Duration,
    /// Pause after reporting an outcome.
    pub report_pause: Duration,
    /// Prefer tasks carrying this combine id.
    pub combine: Option<i64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_lifetime: Duration::from_secs(600),
            busy_sleep: Duration::from_millis(500),
            empty_sleep: Duration::from_secs(10),
            empty_jitter: Duration::from_secs(1),
            unreachable_sleep: Duration::from_secs(5),
            dispatcher_timeout: Duration::from_secs(120),
            report_pause: Duration::from_millis(100),
            combine: None,
        }
    }
}

impl WorkerConfig {
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    pub fn with_dispatcher_timeout(mut self, timeout: Duration) -> Self {
        self.dispatcher_timeout = timeout;
        self
    }

    pub fn with_sleeps(mut self, busy: Duration, empty: Duration, unreachable: Duration) -> Self {
        self.busy_sleep = busy;
        self.empty_sleep = empty;
        self.unreachable_sleep = unreachable;
        self
    }

    pub fn with_empty_jitter(mut self, jitter: Duration) -> Self {
        self.empty_jitter = jitter;
        self
    }

    pub fn with_combine(mut self, combine: Option<i64>) -> Self {
        self.combine = combine;
        self
    }
}

/// Defaults applied by the in-memory store to submissions that leave them unset.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub exec_time_limit: u64,
    /// Executions allowed before a crashing task is failed for good.
    pub exec_limit: u32,
    /// Base delay in seconds before a crashed task becomes claimable again.
    pub retry_delay: u64,
    /// Growth factor of the retry delay per execution. `1.0` keeps it fixed.
    pub retry_multiplier: f64,
    /// Slack after a lease expiry before the overtime sweep reclaims a record.
    pub overtime_grace: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            exec_time_limit: 20,
            exec_limit: 5,
            retry_delay: 30,
            retry_multiplier: 1.0,
            overtime_grace: Duration::from_secs(5),
        }
    }
}

/// Connection settings for anything that talks to the dispatcher over RPC.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub auth_key: Option<String>,
    /// Per-request timeout.
    pub request_timeout: Duration,
    pub call_policy: CallPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: format!("http://127.0.0.1:{DEFAULT_PORT}"),
            auth_key: None,
            request_timeout: Duration::from_secs(2),
            call_policy: CallPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn with_auth_key(mut self, key: Option<String>) -> Self {
        self.auth_key = key.filter(|k| !k.is_empty());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_call_policy(mut self, policy: CallPolicy) -> Self {
        self.call_policy = policy;
        self
    }
}
