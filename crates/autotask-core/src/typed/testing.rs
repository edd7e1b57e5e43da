//! テスト用の Task 型と Handler

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::context::ExecContext;
use super::handler::Handler;
use super::task::Task;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Add {
    pub a: i64,
    pub b: i64,
}

impl Task for Add {
    const TYPE: &'static str = "test.add.v1";
    type Output = i64;
}

pub struct AddHandler;

#[async_trait]
impl Handler<Add> for AddHandler {
    async fn handle(&self, task: Add, _ctx: &ExecContext) -> anyhow::Result<i64> {
        Ok(task.a + task.b)
    }
}

/// Fails, panics or warns depending on `mode`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Misbehave {
    pub mode: String,
}

impl Task for Misbehave {
    const TYPE: &'static str = "test.misbehave.v1";
    type Output = ();
}

pub struct MisbehaveHandler;

#[async_trait]
impl Handler<Misbehave> for MisbehaveHandler {
    async fn handle(&self, task: Misbehave, ctx: &ExecContext) -> anyhow::Result<()> {
        match task.mode.as_str() {
            "error" => {
                ctx.warn("about to fail");
                Err(anyhow::anyhow!("disk unplugged").context("writing report"))
            }
            "panic" => panic!("handler exploded"),
            "warn" => {
                ctx.warn("first");
                ctx.warn("second");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
