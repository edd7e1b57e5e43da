//! Domain model (IDs, task data, record states, reports).

pub mod cluster;
pub mod errors;
pub mod ids;
pub mod record;
pub mod report;
pub mod task;

pub use cluster::{ClusterState, ClusterStatus};
pub use errors::{DispatchError, ErrorKind, StoreError};
pub use ids::{ClusterRunId, DispatcherId, Generation, Id, IdMarker, PackageSn, SchemeSn, TaskSn};
pub use record::{ErrorCode, RecordState};
pub use report::{
    CrashReport, GetTaskReply, InvalidConfigReport, MALFORMED_PING, StatusCode, SuccessReport,
};
pub use task::{Priority, TaskData, TaskPayload};
