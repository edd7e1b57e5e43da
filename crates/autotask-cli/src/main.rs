//! autotask - dispatcher / cluster / worker / 管理コマンド
//!
//! - `dispatcher`: in-memory store 付きの dispatcher を起動
//! - `cluster`: worker pool を起動し supervisor として常駐
//! - `worker`: cluster が spawn する内部コマンド（stdio が supervisor との pipe）
//! - `status` / `shutdown` / `refresh` / `submit`: 管理 RPC

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use autotask_core::app::WorkerLoop;
use autotask_core::cluster::{Cluster, CommandLauncher, StdioHeartbeat, watch_control};
use autotask_core::config::{
    ClientConfig, ClusterConfig, DEFAULT_NAME, DispatcherConfig, StoreConfig, WorkerConfig,
};
use autotask_core::dispatcher::{DispatcherCore, run_dispatcher};
use autotask_core::domain::{DispatchError, TaskSn};
use autotask_core::ports::{DispatcherAdmin, SystemClock};
use autotask_core::rpc::HttpDispatcherClient;
use autotask_core::store::{InMemoryTaskStore, TaskSubmission};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod tasks;

const AUTH_KEY_ENV: &str = "AUTOTASK_AUTH_KEY";

#[derive(Parser, Debug)]
#[command(name = "autotask", version, about = "Distributed task dispatcher")]
struct Cli {
    /// Log filter (env-filter syntax). Logs go to stderr.
    #[arg(long, global = true, env = "AUTOTASK_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Args, Debug, Clone)]
struct Connection {
    /// Dispatcher base URL.
    #[arg(long, env = "AUTOTASK_URL", default_value = "http://127.0.0.1:8890")]
    url: String,

    /// Shared secret sent in the x-autotask-key header.
    #[arg(long, env = AUTH_KEY_ENV, hide_env_values = true)]
    auth_key: Option<String>,
}

impl Connection {
    fn client(&self) -> anyhow::Result<HttpDispatcherClient> {
        let config = ClientConfig::new(&self.url).with_auth_key(self.auth_key.clone());
        HttpDispatcherClient::new(&config).context("building dispatcher client")
    }
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the dispatcher with an in-memory task store.
    Dispatcher(DispatcherArgs),
    /// Run a supervised pool of workers.
    Cluster(ClusterArgs),
    /// Run one worker; spawned by `cluster`.
    #[command(hide = true)]
    Worker(WorkerArgs),
    /// Print the dispatcher status as JSON.
    Status(Connection),
    /// Ask the dispatcher to stop handing out work and drain.
    Shutdown(Connection),
    /// Force a queue refresh.
    Refresh(Connection),
    /// Submit one task.
    Submit(SubmitArgs),
}

#[derive(Args, Debug)]
struct DispatcherArgs {
    #[arg(long, env = "AUTOTASK_LISTEN", default_value = "127.0.0.1:8890")]
    listen: SocketAddr,

    #[arg(long, env = "AUTOTASK_NAME", default_value = DEFAULT_NAME)]
    name: String,

    #[arg(long, env = AUTH_KEY_ENV, hide_env_values = true)]
    auth_key: Option<String>,

    #[arg(long, env = "AUTOTASK_QUEUE_SIZE", default_value_t = 500)]
    queue_size: usize,

    /// Seconds between queue refreshes.
    #[arg(long, default_value_t = 5)]
    refresh_interval: u64,

    /// Seconds a shutdown waits for claimed tasks.
    #[arg(long, default_value_t = 60)]
    drain_timeout: u64,

    /// Default execution time limit in seconds for submitted tasks.
    #[arg(long, env = "AUTOTASK_EXEC_TIME_LIMIT", default_value_t = 20)]
    exec_time_limit: u64,

    /// Default number of executions before a crashing task fails.
    #[arg(long, default_value_t = 5)]
    exec_limit: u32,

    /// Default seconds before a crashed task is retried.
    #[arg(long, default_value_t = 30)]
    retry_delay: u64,
}

#[derive(Args, Debug)]
struct ClusterArgs {
    #[command(flatten)]
    conn: Connection,

    #[arg(long, env = "AUTOTASK_NAME", default_value = DEFAULT_NAME)]
    name: String,

    #[arg(long, env = "AUTOTASK_POOL_SIZE", default_value_t = 2)]
    pool_size: usize,

    /// Seconds a worker may stay silent before it is killed (plus grace).
    #[arg(long, env = "AUTOTASK_EXEC_TIME_LIMIT", default_value_t = 20)]
    exec_time_limit: u64,

    /// Seconds without dispatcher contact before the cluster goes offline.
    #[arg(long, env = "AUTOTASK_DISPATCHER_TIMEOUT", default_value_t = 120)]
    dispatcher_timeout: u64,

    #[arg(long, default_value_t = 10)]
    ping_interval: u64,

    #[command(flatten)]
    worker: WorkerTuning,
}

/// Settings forwarded from `cluster` to every spawned worker.
#[derive(Args, Debug, Clone)]
struct WorkerTuning {
    /// Seconds before a worker process is recycled.
    #[arg(long, env = "AUTOTASK_WORKER_LIFETIME", default_value_t = 600)]
    max_lifetime: u64,

    /// Prefer tasks carrying this combine id.
    #[arg(long)]
    combine: Option<i64>,
}

#[derive(Args, Debug)]
struct WorkerArgs {
    #[command(flatten)]
    conn: Connection,

    #[arg(long)]
    cluster: String,

    #[arg(long)]
    slot: usize,

    #[arg(long)]
    generation: u64,

    #[arg(long, default_value_t = 120)]
    dispatcher_timeout: u64,

    #[command(flatten)]
    worker: WorkerTuning,
}

#[derive(Args, Debug)]
struct SubmitArgs {
    #[command(flatten)]
    conn: Connection,

    /// Registered task type, e.g. demo.echo.v1.
    func_path: String,

    /// Defaults to the task type.
    #[arg(long)]
    name: Option<String>,

    /// Positional arguments as a JSON array.
    #[arg(long)]
    args: Option<String>,

    /// Keyword arguments as a JSON object.
    #[arg(long)]
    kwargs: Option<String>,

    #[arg(long)]
    priority: Option<i32>,

    #[arg(long)]
    block_key: Option<String>,

    #[arg(long)]
    combine: Option<i64>,

    #[arg(long)]
    exec_time_limit: Option<u64>,

    #[arg(long)]
    exec_limit: Option<u32>,

    #[arg(long)]
    retry_delay: Option<u64>,

    /// Only run after this task succeeded.
    #[arg(long)]
    after: Option<u64>,
}

impl SubmitArgs {
    fn submission(&self) -> anyhow::Result<TaskSubmission> {
        let name = self.name.clone().unwrap_or_else(|| self.func_path.clone());
        let mut task = TaskSubmission::new(name, &self.func_path);
        if let Some(args) = &self.args {
            task = task.with_args(serde_json::from_str(args).context("--args is not valid JSON")?);
        }
        if let Some(kwargs) = &self.kwargs {
            task = task
                .with_kwargs(serde_json::from_str(kwargs).context("--kwargs is not valid JSON")?);
        }
        if let Some(priority) = self.priority {
            task = task.with_priority(priority);
        }
        if let Some(key) = &self.block_key {
            task = task.with_block_key(key);
        }
        if let Some(combine) = self.combine {
            task = task.with_combine(combine);
        }
        if let Some(limit) = self.exec_time_limit {
            task = task.with_exec_time_limit(limit);
        }
        if let Some(limit) = self.exec_limit {
            task = task.with_exec_limit(limit);
        }
        if let Some(delay) = self.retry_delay {
            task = task.with_retry_delay(delay);
        }
        if let Some(previous) = self.after {
            task = task.after(TaskSn::new(previous));
        }
        Ok(task)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout belongs to the heartbeat pipe in worker processes
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log))
        .with_writer(std::io::stderr)
        .init();

    match cli.cmd {
        Cmd::Dispatcher(args) => run_dispatcher_cmd(args).await,
        Cmd::Cluster(args) => run_cluster(args, &cli.log).await,
        Cmd::Worker(args) => run_worker(args).await,
        Cmd::Status(conn) => print_json(&conn.client()?.status().await?),
        Cmd::Shutdown(conn) => print_json(&conn.client()?.shutdown().await?),
        Cmd::Refresh(conn) => print_json(&conn.client()?.refresh().await?),
        Cmd::Submit(args) => {
            let submission = args.submission()?;
            let serials = args.conn.client()?.submit(&[submission]).await?;
            print_json(&serials)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_dispatcher_cmd(args: DispatcherArgs) -> anyhow::Result<()> {
    let config = DispatcherConfig::default()
        .with_name(args.name)
        .with_listen(args.listen)
        .with_auth_key(args.auth_key)
        .with_queue_size(args.queue_size)
        .with_refresh_interval(Duration::from_secs(args.refresh_interval))
        .with_drain_timeout(Duration::from_secs(args.drain_timeout));
    let store_config = StoreConfig {
        exec_time_limit: args.exec_time_limit,
        exec_limit: args.exec_limit,
        retry_delay: args.retry_delay,
        ..StoreConfig::default()
    };

    let clock = Arc::new(SystemClock);
    let store = Arc::new(InMemoryTaskStore::new(store_config, clock.clone()));
    let listener = TcpListener::bind(config.listen)
        .await
        .map_err(|source| DispatchError::Bind {
            addr: config.listen,
            source,
        })?;
    let core = Arc::new(DispatcherCore::new(config, store, clock));

    run_dispatcher(listener, core, async {
        if let Err(e) = wait_for_shutdown().await {
            warn!(error = %e, "signal handling unavailable");
            std::future::pending::<()>().await;
        }
    })
    .await?;
    Ok(())
}

async fn run_cluster(args: ClusterArgs, log: &str) -> anyhow::Result<()> {
    if args.pool_size == 0 {
        bail!("--pool-size must be at least 1");
    }
    let config = ClusterConfig::new(&args.name, args.pool_size)
        .with_exec_time_limit(Duration::from_secs(args.exec_time_limit))
        .with_dispatcher_timeout(Duration::from_secs(args.dispatcher_timeout))
        .with_ping_interval(Duration::from_secs(args.ping_interval));

    let program = std::env::current_exe().context("locating the autotask binary")?;
    let mut worker_args = vec![
        "--log".to_string(),
        log.to_string(),
        "worker".to_string(),
        "--url".to_string(),
        args.conn.url.clone(),
        "--cluster".to_string(),
        args.name.clone(),
        "--dispatcher-timeout".to_string(),
        args.dispatcher_timeout.to_string(),
        "--max-lifetime".to_string(),
        args.worker.max_lifetime.to_string(),
    ];
    if let Some(combine) = args.worker.combine {
        worker_args.extend(["--combine".to_string(), combine.to_string()]);
    }
    let mut launcher = CommandLauncher::new(program, worker_args);
    if let Some(key) = &args.conn.auth_key {
        launcher = launcher.with_env(AUTH_KEY_ENV, key);
    }

    let dispatcher = Arc::new(args.conn.client()?);
    let cluster = Cluster::new(config, dispatcher, Arc::new(launcher));

    let (stop, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown().await {
            warn!(error = %e, "signal handling unavailable");
            return;
        }
        stop.send_replace(true);
    });
    cluster.run(stop_rx).await;
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> anyhow::Result<()> {
    let app = tasks::manifest()?;
    let name = format!("{}-{:02}-{}", args.cluster, args.slot, std::process::id());
    let config = WorkerConfig::default()
        .with_max_lifetime(Duration::from_secs(args.worker.max_lifetime))
        .with_dispatcher_timeout(Duration::from_secs(args.dispatcher_timeout))
        .with_combine(args.worker.combine);

    // the supervisor owns shutdown; an interrupt on the terminal reaches us too
    tokio::spawn(async {
        while tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt ignored, waiting for the supervisor");
        }
    });

    let (shutdown, control) = watch_control(tokio::io::stdin());
    let worker = WorkerLoop::new(
        name,
        config,
        Arc::new(args.conn.client()?),
        app.executor(),
        Arc::new(StdioHeartbeat::stdout()),
        shutdown,
    );
    let exit = worker.run().await;
    control.abort();
    info!(?exit, generation = args.generation, "worker done");
    Ok(())
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal as unix_signal};

        let mut terminate = unix_signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Ctrl+C received");
            }
            _ = terminate.recv() => {
                info!("SIGTERM received");
            }
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Ctrl+C received");
        Ok(())
    }
}
