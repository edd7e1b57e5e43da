//! ExecContext - 実行中の Task に渡される付帯情報
//!
//! Handler が `warn()` で残したメッセージは実行後に集められ、
//! success / crash report の `exec_warn` になる。

use std::sync::Mutex;

use tracing::warn;

use crate::domain::TaskSn;

#[derive(Debug)]
pub struct ExecContext {
    task_sn: TaskSn,
    name: String,
    warnings: Mutex<Vec<String>>,
}

impl ExecContext {
    pub fn new(task_sn: TaskSn, name: impl Into<String>) -> Self {
        Self {
            task_sn,
            name: name.into(),
            warnings: Mutex::new(Vec::new()),
        }
    }

    pub fn task_sn(&self) -> TaskSn {
        self.task_sn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Records a warning without failing the task.
    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(task_sn = %self.task_sn, name = %self.name, "{message}");
        self.warnings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }

    /// Joined warnings, or `None` when there were none.
    pub fn take_warnings(&self) -> Option<String> {
        let mut warnings = self.warnings.lock().unwrap_or_else(|e| e.into_inner());
        if warnings.is_empty() {
            return None;
        }
        let joined = warnings.join("\n");
        warnings.clear();
        Some(joined)
    }
}
