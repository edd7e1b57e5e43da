//! Queue module: the dispatcher's bounded, priority-ordered working set.
//!
//! The queue is rebuilt wholesale on each refresh. Between refreshes the only
//! mutations are claim/unclaim, terminal marking and lease-timeout removal.

mod block;
mod state;

pub use block::BlockSet;
pub use state::TaskState;

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::domain::{TaskData, TaskSn};
use crate::observability::QueueCounts;

/// Entries ordered by `(priority asc, task_sn asc)`, never more than `capacity`.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    entries: Vec<TaskState>,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskState> {
        self.entries.iter()
    }

    /// Builds the next queue from a fresh store fetch.
    ///
    /// Claimed, unfinished entries are carried over so their leases stay
    /// tracked; every unclaimed entry is replaced by `fresh`. Carried entries
    /// go first so truncation to `capacity` only drops fetched work.
    pub fn rebuild(&self, fresh: Vec<TaskData>) -> TaskQueue {
        let carried: Vec<TaskState> = self.claimed().cloned().collect();
        let carried_sn: HashSet<TaskSn> = carried.iter().map(TaskState::task_sn).collect();

        let mut entries: Vec<TaskState> = carried
            .into_iter()
            .chain(
                fresh
                    .into_iter()
                    .filter(|data| !carried_sn.contains(&data.task_sn))
                    .map(TaskState::new),
            )
            .take(self.capacity)
            .collect();
        entries.sort_by_key(|entry| entry.data().order_key());

        TaskQueue {
            entries,
            capacity: self.capacity,
        }
    }

    pub fn claimed(&self) -> impl Iterator<Item = &TaskState> {
        self.entries.iter().filter(|entry| entry.is_claimed())
    }

    pub fn has_available(&self) -> bool {
        self.entries.iter().any(TaskState::is_available)
    }

    /// Index of the first claimable entry whose block key is free.
    /// With `combine`, matching entries win over priority order.
    pub fn next_candidate(&self, blocked: &BlockSet, combine: Option<i64>) -> Option<usize> {
        let eligible =
            |entry: &TaskState| entry.is_available() && !blocked.is_blocked(entry.block_key());

        if let Some(combine) = combine
            && let Some(index) = self
                .entries
                .iter()
                .position(|entry| eligible(entry) && entry.data().combine == Some(combine))
        {
            return Some(index);
        }

        self.entries.iter().position(eligible)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut TaskState> {
        self.entries.get_mut(index)
    }

    pub fn find_mut(&mut self, task_sn: TaskSn) -> Option<&mut TaskState> {
        self.entries.iter_mut().find(|entry| entry.task_sn() == task_sn)
    }

    /// The unfinished, leased entry for `task_sn`, whoever holds it.
    pub fn claimed_mut(&mut self, task_sn: TaskSn) -> Option<&mut TaskState> {
        self.entries
            .iter_mut()
            .find(|entry| entry.is_claimed() && entry.task_sn() == task_sn)
    }

    /// The unfinished task currently leased by `worker_name`.
    pub fn held_by_mut(&mut self, worker_name: &str) -> Option<&mut TaskState> {
        self.entries
            .iter_mut()
            .find(|entry| entry.is_claimed() && entry.worker_name() == Some(worker_name))
    }

    /// Removes and returns every entry whose lease ran out.
    pub fn take_expired(&mut self, now: DateTime<Utc>, grace: chrono::Duration) -> Vec<TaskState> {
        let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|entry| entry.lease_expired(now, grace));
        self.entries = kept;
        expired
    }

    pub fn counts(&self, blocked: &BlockSet) -> QueueCounts {
        QueueCounts {
            queued: self.entries.len(),
            available: self.entries.iter().filter(|e| e.is_available()).count(),
            claimed: self.claimed().count(),
            blocked_keys: blocked.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn data(sn: u64, priority: i32, block_key: Option<&str>) -> TaskData {
        TaskData {
            task_sn: TaskSn::new(sn),
            name: format!("t{sn}"),
            func_path: "demo.echo.v1".into(),
            args_blob: "[]".into(),
            kwargs_blob: "{}".into(),
            exec_time_limit: 20,
            priority,
            block_key: block_key.map(str::to_string),
            combine: None,
        }
    }

    fn serials(queue: &TaskQueue) -> Vec<u64> {
        queue.iter().map(|e| e.task_sn().get()).collect()
    }

    #[test]
    fn rebuild_sorts_by_priority_then_serial() {
        let queue = TaskQueue::new(10).rebuild(vec![
            data(2, 50, None),
            data(1, 10, None),
            data(3, 10, None),
            data(4, 200, None),
        ]);
        assert_eq!(serials(&queue), vec![1, 3, 2, 4]);
    }

    #[test]
    fn rebuild_never_exceeds_capacity() {
        let fresh = (1..=20).map(|sn| data(sn, 100, None)).collect();
        let queue = TaskQueue::new(5).rebuild(fresh);
        assert_eq!(queue.len(), 5);
    }

    #[test]
    fn rebuild_carries_claims_and_drops_stale_entries() {
        let mut queue = TaskQueue::new(3).rebuild(vec![
            data(1, 100, None),
            data(2, 100, None),
            data(3, 100, None),
        ]);
        queue.get_mut(1).unwrap().claim("w-01");
        queue.get_mut(2).unwrap().finish();

        // the store no longer returns 2 (running) nor 3 (terminal)
        let next = queue.rebuild(vec![data(1, 100, None), data(9, 10, None), data(10, 10, None)]);

        assert_eq!(serials(&next), vec![9, 1, 2]);
        assert_eq!(next.claimed().count(), 1);
        assert!(next.iter().all(|e| !e.is_done()));
    }

    #[test]
    fn candidate_skips_blocked_keys_and_claims() {
        let mut queue = TaskQueue::new(10).rebuild(vec![
            data(1, 10, Some("db")),
            data(2, 20, Some("db")),
            data(3, 30, None),
        ]);
        let blocked = BlockSet::from_keys(["db"]);
        assert_eq!(queue.next_candidate(&blocked, None), Some(2));

        queue.get_mut(2).unwrap().claim("w-01");
        assert_eq!(queue.next_candidate(&blocked, None), None);
        assert_eq!(queue.next_candidate(&BlockSet::new(), None), Some(0));
    }

    #[test]
    fn combine_prefers_matching_entries() {
        let mut fresh = vec![data(1, 10, None), data(2, 200, None)];
        fresh[1].combine = Some(7);
        let queue = TaskQueue::new(10).rebuild(fresh);

        assert_eq!(queue.next_candidate(&BlockSet::new(), Some(7)), Some(1));
        assert_eq!(queue.next_candidate(&BlockSet::new(), Some(8)), Some(0));
    }

    #[test]
    fn take_expired_removes_only_overdue_leases() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut queue =
            TaskQueue::new(10).rebuild(vec![data(1, 10, None), data(2, 10, None), data(3, 10, None)]);
        let first = queue.get_mut(0).unwrap();
        first.claim("w-01");
        first.confirm(now - chrono::Duration::seconds(60));
        let second = queue.get_mut(1).unwrap();
        second.claim("w-02");
        second.confirm(now + chrono::Duration::seconds(60));

        let expired = queue.take_expired(now, chrono::Duration::seconds(5));

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].task_sn(), TaskSn::new(1));
        assert_eq!(serials(&queue), vec![2, 3]);
    }
}
