//! Ports - 抽象化レイヤー
//!
//! 各 trait は外部の collaborator（task store、RPC 越しの dispatcher、
//! supervisor への pipe、時計）を隠す。実装は `store`, `rpc`, `cluster`, `dispatcher` 側。

pub mod clock;
pub mod dispatcher;
pub mod heartbeat;
pub mod id_generator;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::dispatcher::{DispatcherAdmin, DispatcherApi};
pub use self::heartbeat::HeartbeatSink;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::TaskStore;
