//! TypedRegistry - Handler の登録と管理
//!
//! # 学習ポイント
//! - HashMap での型消去された trait object の管理
//! - Generic methods での登録と型安全性
//! - Arc による共有所有権

use crate::typed::handler::TypedHandler;

use super::handler::{DynHandler, Handler};
use super::task::Task;
use std::collections::HashMap;
use std::sync::Arc;

/// TypedRegistry は型付き Handler を登録・管理
///
/// # 使用例
/// ```ignore
/// let mut registry = TypedRegistry::new();
/// registry.register::<Echo, _>(EchoHandler)?;
///
/// // func_path で DynHandler を取得
/// let handler = registry.resolve("demo.echo.v1")?;
/// ```
///
/// # 内部実装
/// - `register::<T: Task>(handler: impl Handler<T>)` で登録
/// - 内部的に TypedHandler でラップして DynHandler に変換
/// - HashMap<String, Arc<dyn DynHandler>> で管理
pub struct TypedRegistry {
    handlers: HashMap<String, Arc<dyn DynHandler>>,
}

/// RegistryError は TypedRegistry の操作エラー
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Handler for task type '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("No handler registered for task type '{0}'")]
    NotRegistered(String),
}

impl TypedRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        let task_type = T::TYPE.to_string();
        if self.handlers.contains_key(&task_type) {
            return Err(RegistryError::AlreadyRegistered(task_type));
        }
        let typed_handler = TypedHandler::<T, H>::new(handler);
        self.handlers.insert(task_type, Arc::new(typed_handler));
        Ok(())
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn resolve(&self, task_type: &str) -> Result<Arc<dyn DynHandler>, RegistryError> {
        self.get(task_type)
            .ok_or_else(|| RegistryError::NotRegistered(task_type.to_string()))
    }

    /// Sorted, so startup logs and errors are stable.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

impl Default for TypedRegistry {
    fn default() -> Self {
        Self::new()
    }
}
