//! AppBuilder - worker が実行できる Task の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 開発体験の改善（明確なエラーメッセージ）

use std::sync::Arc;

use super::runtime::TaskExecutor;
use crate::typed::{Handler, RegistryError, Task, TypedRegistry};

/// AppBuilder は worker の Task manifest を構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new()
///     .register::<Echo, _>(EchoHandler)?
///     .expect_tasks(&["demo.echo.v1"])
///     .build()?;
/// let executor = app.executor();
/// ```
///
/// # Fail-fast 設計
/// - expect_tasks() で期待される func_path を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 不足があれば BuildError を返す
pub struct AppBuilder {
    registry: TypedRegistry,
    expected_tasks: Option<Vec<String>>,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            registry: TypedRegistry::new(),
            expected_tasks: None,
        }
    }

    /// Handler を登録
    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    /// 期待される func_path のリストを設定
    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    /// # 検証
    /// - expect_tasks() で設定された func_path が全て登録されているかチェック
    /// - 不足があれば BuildError::MissingTaskTypes を返す
    pub fn build(self) -> Result<App, BuildError> {
        if let Some(expected_tasks) = &self.expected_tasks {
            let registered_types = self.registry.registered_types();
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|x| !registered_types.contains(x))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }
        Ok(App {
            registry: Arc::new(self.registry),
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 起動時に固定された Task manifest
pub struct App {
    registry: Arc<TypedRegistry>,
}

impl App {
    pub fn registry(&self) -> &TypedRegistry {
        &self.registry
    }

    pub fn executor(&self) -> TaskExecutor {
        TaskExecutor::new(Arc::clone(&self.registry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed::testing::{Add, AddHandler, Misbehave};

    #[test]
    fn test_build_success() {
        let app = AppBuilder::new()
            .register::<Add, _>(AddHandler)
            .unwrap()
            .expect_tasks(&[Add::TYPE])
            .build();
        assert!(app.is_ok());
    }

    #[test]
    fn test_build_missing_task_types() {
        let app = AppBuilder::new()
            .register::<Add, _>(AddHandler)
            .unwrap()
            .expect_tasks(&[Add::TYPE, Misbehave::TYPE])
            .build();
        assert!(matches!(
            app,
            Err(BuildError::MissingTaskTypes(missing)) if missing == vec![Misbehave::TYPE.to_string()]
        ));
    }

    #[test]
    fn test_build_no_expect_tasks() {
        let app = AppBuilder::new()
            .register::<Add, _>(AddHandler)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(app.registry().registered_types(), vec![Add::TYPE.to_string()]);
        assert!(app.executor().registry().get(Add::TYPE).is_some());
    }
}
