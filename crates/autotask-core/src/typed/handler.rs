//! Handler trait - Task を実行する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<T>)
//! - Object-safe trait (DynHandler)
//! - Type erasure パターン (TypedHandler<T, H> → DynHandler)
//! - 引数の decode と実行の分離 (prepare → PreparedCall)

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::codec::{CodecError, PayloadCodec};
use super::context::ExecContext;
use super::task::Task;

/// Handler は Task を実行して `T::Output` を返す
///
/// # 使用例
/// ```ignore
/// struct EchoHandler;
///
/// #[async_trait]
/// impl Handler<Echo> for EchoHandler {
///     async fn handle(&self, task: Echo, ctx: &ExecContext) -> anyhow::Result<String> {
///         if task.message.is_empty() {
///             ctx.warn("empty message");
///         }
///         Ok(task.message)
///     }
/// }
/// ```
///
/// # エラー
/// - `Err` は crash として報告される（message は `Display`、detail は `Debug`）
/// - panic も crash として報告される
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T, ctx: &ExecContext) -> anyhow::Result<T::Output>;
}

pub type CallFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send + 'static>>;

/// 引数の decode が済み、実行を待つだけの呼び出し
///
/// `'static` な future を返すので `tokio::spawn` に渡せる（panic の捕捉に使う）。
pub trait PreparedCall: Send {
    fn call(self: Box<Self>, ctx: Arc<ExecContext>) -> CallFuture;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// TypedHandler<T, H> を DynHandler に変換することで、
/// HashMap<String, Arc<dyn DynHandler>> に格納可能にします。
pub trait DynHandler: Send + Sync {
    fn task_type(&self) -> &'static str;

    /// 引数を `T` に decode する。失敗は invalid config として扱われる。
    fn prepare(
        &self,
        codec: &PayloadCodec,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Box<dyn PreparedCall>, CodecError>;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: Arc<H>,
    _marker: PhantomData<T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
            _marker: PhantomData,
        }
    }
}

impl<T: Task, H: Handler<T> + 'static> DynHandler for TypedHandler<T, H> {
    fn task_type(&self) -> &'static str {
        T::TYPE
    }

    fn prepare(
        &self,
        codec: &PayloadCodec,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Box<dyn PreparedCall>, CodecError> {
        let task: T = codec.decode_task(args, kwargs)?;
        Ok(Box::new(TypedCall {
            handler: Arc::clone(&self.handler),
            task,
        }))
    }
}

struct TypedCall<T, H> {
    handler: Arc<H>,
    task: T,
}

impl<T: Task, H: Handler<T> + 'static> PreparedCall for TypedCall<T, H> {
    fn call(self: Box<Self>, ctx: Arc<ExecContext>) -> CallFuture {
        let TypedCall { handler, task } = *self;
        Box::pin(async move {
            let output = handler.handle(task, &ctx).await?;
            Ok(serde_json::to_value(output)?)
        })
    }
}
