//! IdGenerator port - incarnation ID 生成の抽象化
//!
//! Clock を注入するので、テストでは FixedClock で時刻部分を固定できる。

use ulid::Ulid;

use crate::domain::ids::{ClusterRunId, DispatcherId};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn dispatcher_id(&self) -> DispatcherId;

    fn cluster_run_id(&self) -> ClusterRunId;
}

/// ULID: timestamp from the clock, entropy from `rand`.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn dispatcher_id(&self) -> DispatcherId {
        DispatcherId::from(self.next())
    }

    fn cluster_run_id(&self) -> ClusterRunId {
        ClusterRunId::from(self.next())
    }
}
