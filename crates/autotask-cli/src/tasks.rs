//! Task manifest - worker が起動時に登録する Task 一覧

use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use autotask_core::app::{App, AppBuilder};
use autotask_core::typed::{ExecContext, Handler, Task};
use serde::{Deserialize, Serialize};

/// Returns its message unchanged.
#[derive(Debug, Serialize, Deserialize)]
pub struct Echo {
    pub message: String,
}

impl Task for Echo {
    const TYPE: &'static str = "demo.echo.v1";
    type Output = String;
}

pub struct EchoHandler;

#[async_trait]
impl Handler<Echo> for EchoHandler {
    async fn handle(&self, task: Echo, _ctx: &ExecContext) -> anyhow::Result<String> {
        Ok(task.message)
    }
}

/// Sleeps for `seconds`. Useful for exercising leases and deadlines.
#[derive(Debug, Serialize, Deserialize)]
pub struct Sleep {
    pub seconds: u64,
}

impl Task for Sleep {
    const TYPE: &'static str = "demo.sleep.v1";
    type Output = u64;
}

pub struct SleepHandler;

#[async_trait]
impl Handler<Sleep> for SleepHandler {
    async fn handle(&self, task: Sleep, ctx: &ExecContext) -> anyhow::Result<u64> {
        if task.seconds == 0 {
            ctx.warn("asked to sleep for zero seconds");
        }
        tokio::time::sleep(Duration::from_secs(task.seconds)).await;
        Ok(task.seconds)
    }
}

/// Always fails with `reason`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Fail {
    #[serde(default = "default_reason")]
    pub reason: String,
}

fn default_reason() -> String {
    "requested failure".to_string()
}

impl Task for Fail {
    const TYPE: &'static str = "demo.fail.v1";
    type Output = ();
}

pub struct FailHandler;

#[async_trait]
impl Handler<Fail> for FailHandler {
    async fn handle(&self, task: Fail, ctx: &ExecContext) -> anyhow::Result<()> {
        ctx.warn(format!("{} is about to fail", ctx.name()));
        bail!(task.reason)
    }
}

pub fn manifest() -> anyhow::Result<App> {
    let app = AppBuilder::new()
        .register::<Echo, _>(EchoHandler)?
        .register::<Sleep, _>(SleepHandler)?
        .register::<Fail, _>(FailHandler)?
        .expect_tasks(&[Echo::TYPE, Sleep::TYPE, Fail::TYPE])
        .build()?;
    Ok(app)
}
