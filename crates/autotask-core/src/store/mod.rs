//! Task store: persistent records behind the `TaskStore` port.
//!
//! Only an in-memory engine ships here. Any engine that keeps the record
//! state machine of [`TaskRecord`] can stand in for it.

mod memory;
mod package;
mod record;
mod retry;
mod scheme;

pub use memory::InMemoryTaskStore;
pub use package::PackageStatus;
pub use record::{TaskRecord, TaskSubmission};
pub use retry::RetryPolicy;
pub use scheme::{DEFAULT_SCHEME_RETAIN_SECS, SCHEME_LOOKAHEAD_SECS, SchemeSubmission, TaskScheme};
