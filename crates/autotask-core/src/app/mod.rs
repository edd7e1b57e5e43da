//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: worker の Task manifest の構築と起動時検証
//! - **TaskExecutor**: 型付き Task の解決と実行（panic / warning の捕捉）
//! - **WorkerLoop**: タスク実行ループ（get_task→prepare→run→report）
//! - **ReaperLoop**: 定期 refresh と lease 期限切れの回収、shutdown 後の drain
//! - **status**: dispatcher の状態 view

pub mod builder;
pub mod reaper_loop;
pub mod runtime;
pub mod status;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{App, AppBuilder, BuildError};
pub use self::reaper_loop::ReaperLoop;
pub use self::runtime::{ExecOutcome, PrepareError, TaskExecutor};
pub use self::status::{ClusterSnapshot, DispatcherState, DispatcherStatus, RunningTask};
pub use self::worker_loop::{FetchOutcome, Step, WorkerExit, WorkerLoop};
