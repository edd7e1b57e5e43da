//! TaskExecutor - payload を解決して Handler を実行する
//!
//! # フロー
//! 1. `prepare()`: func_path を registry で解決し、args / kwargs を decode
//!    （失敗は invalid config として報告される）
//! 2. `run()`: `tokio::spawn` 上で実行し、error / panic / warning を捕捉

use std::any::Any;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::TaskPayload;
use crate::typed::{CodecError, ExecContext, PayloadCodec, PreparedCall, RegistryError, TypedRegistry};

/// Why a payload could not be turned into a call.
#[derive(Debug, thiserror::Error)]
pub enum PrepareError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("cannot decode arguments for '{func_path}': {source}")]
    Codec {
        func_path: String,
        #[source]
        source: CodecError,
    },
}

/// Result of one execution, ready to be reported.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutcome {
    Success {
        result: Value,
        exec_warn: Option<String>,
    },
    Crash {
        message: String,
        detail: String,
        exec_warn: Option<String>,
    },
}

#[derive(Clone)]
pub struct TaskExecutor {
    registry: Arc<TypedRegistry>,
    codec: PayloadCodec,
}

impl TaskExecutor {
    pub fn new(registry: Arc<TypedRegistry>) -> Self {
        Self {
            registry,
            codec: PayloadCodec::new(),
        }
    }

    pub fn registry(&self) -> &TypedRegistry {
        &self.registry
    }

    pub fn prepare(&self, payload: &TaskPayload) -> Result<Box<dyn PreparedCall>, PrepareError> {
        let handler = self.registry.resolve(&payload.func_path)?;
        let codec_err = |source| PrepareError::Codec {
            func_path: payload.func_path.clone(),
            source,
        };
        let args = self.codec.decode_args(&payload.args_blob).map_err(codec_err)?;
        let kwargs = self.codec.decode_kwargs(&payload.kwargs_blob).map_err(codec_err)?;
        handler.prepare(&self.codec, args, kwargs).map_err(codec_err)
    }

    pub async fn run(&self, payload: &TaskPayload, call: Box<dyn PreparedCall>) -> ExecOutcome {
        let ctx = Arc::new(ExecContext::new(payload.task_sn, payload.name.clone()));
        debug!(task_sn = %payload.task_sn, func = %payload.func_path, "task started");

        let joined = tokio::spawn(call.call(Arc::clone(&ctx))).await;
        let exec_warn = ctx.take_warnings();

        match joined {
            Ok(Ok(result)) => ExecOutcome::Success { result, exec_warn },
            Ok(Err(err)) => {
                warn!(task_sn = %payload.task_sn, error = %err, "task failed");
                ExecOutcome::Crash {
                    message: err.to_string(),
                    detail: format!("{err:?}"),
                    exec_warn,
                }
            }
            Err(join) if join.is_panic() => {
                let message = panic_message(join.into_panic());
                warn!(task_sn = %payload.task_sn, %message, "task panicked");
                ExecOutcome::Crash {
                    detail: format!("panicked in {}: {message}", payload.func_path),
                    message,
                    exec_warn,
                }
            }
            Err(join) => ExecOutcome::Crash {
                message: "task was cancelled".to_string(),
                detail: join.to_string(),
                exec_warn,
            },
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskSn;
    use crate::typed::testing::{Add, AddHandler, Misbehave, MisbehaveHandler};
    use crate::typed::Task;
    use rstest::rstest;
    use serde_json::json;

    fn executor() -> TaskExecutor {
        let mut registry = TypedRegistry::new();
        registry.register::<Add, _>(AddHandler).unwrap();
        registry.register::<Misbehave, _>(MisbehaveHandler).unwrap();
        TaskExecutor::new(Arc::new(registry))
    }

    fn payload(func_path: &str, args: &str, kwargs: &str) -> TaskPayload {
        TaskPayload {
            task_sn: TaskSn::new(7),
            name: "t".into(),
            func_path: func_path.into(),
            args_blob: args.into(),
            kwargs_blob: kwargs.into(),
            exec_time_limit: 20,
        }
    }

    async fn execute(payload: TaskPayload) -> ExecOutcome {
        let executor = executor();
        let call = executor.prepare(&payload).unwrap_or_else(|e| panic!("prepare: {e}"));
        executor.run(&payload, call).await
    }

    #[rstest]
    #[case::positional("[1, 2]", "{}")]
    #[case::keyword("[]", r#"{"a": 1, "b": 2}"#)]
    #[tokio::test]
    async fn success_carries_the_result(#[case] args: &str, #[case] kwargs: &str) {
        let outcome = execute(payload(Add::TYPE, args, kwargs)).await;
        assert_eq!(
            outcome,
            ExecOutcome::Success {
                result: json!(3),
                exec_warn: None
            }
        );
    }

    #[rstest]
    #[case::unknown_function("nope.v1", "[]", "{}")]
    #[case::mixed_arguments(Add::TYPE, "[1]", r#"{"b": 2}"#)]
    #[case::bad_blob(Add::TYPE, "{", "{}")]
    #[case::wrong_types(Add::TYPE, r#"["x", "y"]"#, "{}")]
    fn invalid_payloads_fail_to_prepare(
        #[case] func_path: &str,
        #[case] args: &str,
        #[case] kwargs: &str,
    ) {
        assert!(executor().prepare(&payload(func_path, args, kwargs)).is_err());
    }

    #[tokio::test]
    async fn errors_become_crashes_with_the_chain_and_warnings() {
        let outcome = execute(payload(Misbehave::TYPE, "[]", r#"{"mode": "error"}"#)).await;
        let ExecOutcome::Crash {
            message,
            detail,
            exec_warn,
        } = outcome
        else {
            panic!("expected a crash");
        };
        assert_eq!(message, "writing report");
        assert!(detail.contains("disk unplugged"));
        assert_eq!(exec_warn.as_deref(), Some("about to fail"));
    }

    #[tokio::test]
    async fn panics_become_crashes() {
        let outcome = execute(payload(Misbehave::TYPE, "[]", r#"{"mode": "panic"}"#)).await;
        assert!(matches!(
            outcome,
            ExecOutcome::Crash { ref message, .. } if message == "handler exploded"
        ));
    }

    #[tokio::test]
    async fn warnings_ride_along_with_success() {
        let outcome = execute(payload(Misbehave::TYPE, "[]", r#"{"mode": "warn"}"#)).await;
        assert_eq!(
            outcome,
            ExecOutcome::Success {
                result: Value::Null,
                exec_warn: Some("first\nsecond".into())
            }
        );
    }
}
