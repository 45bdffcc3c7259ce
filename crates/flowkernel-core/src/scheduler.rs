//! The task scheduler: `Schedule`, `Query`, `QueryAndOwn` and `Delete` over
//! tasks held in a `Store` queue.
//!
//! Leasing is a compare-and-set on the task's serialized column: no separate
//! lock table, the task row itself is the lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::error::{GrrError, Result};
use crate::identity::QueueName;
use crate::store::Store;
use crate::task::{Priority, Task};

const TASK_COLUMN_PREFIX: &str = "task:";

/// Scheduler bound to a single `Store`. Holds no state of its own beyond a
/// process-wide retransmission counter; every store-backed call re-reads the
/// store, so multiple workers can share one queue safely modulo the store's
/// own CAS guarantees.
pub struct Scheduler<'s> {
    store: &'s dyn Store,
    retransmission_count: AtomicU64,
}

impl<'s> Scheduler<'s> {
    pub fn new(store: &'s dyn Store) -> Self {
        Self {
            store,
            retransmission_count: AtomicU64::new(0),
        }
    }

    /// Number of times a task has been re-leased (lease expired before the
    /// task was deleted) across this scheduler's lifetime. Mirrors
    /// `grr_task_retransmission_count` in the original implementation.
    pub fn retransmission_count(&self) -> u64 {
        self.retransmission_count.load(Ordering::Relaxed)
    }

    fn put(&self, task: &Task) -> Result<()> {
        let bytes = serde_json::to_vec(task)
            .map_err(|e| GrrError::BadMessage(format!("task serialization: {e}")))?;
        let mut values = BTreeMap::new();
        values.insert(task.column_name(), bytes);
        self.store.multi_set(task.queue.as_str(), values)
    }

    /// Schedules a new task, returning it with its freshly assigned id.
    pub fn schedule(
        &self,
        queue: QueueName,
        priority: Priority,
        payload: Vec<u8>,
    ) -> Result<Task> {
        let now = self.store.now_millis();
        let task = Task::new(queue, priority, payload, now);
        self.put(&task)?;
        debug!(queue = %task.queue, id = task.id, "scheduled task");
        Ok(task)
    }

    /// Re-schedules an existing task unchanged — used when a flow requeues
    /// work under a stable id.
    pub fn reschedule(&self, task: &Task) -> Result<()> {
        self.put(task)
    }

    fn all_tasks(&self, queue: &QueueName) -> Result<Vec<(String, Task)>> {
        let cells = self.store.resolve_regex(queue.as_str(), TASK_COLUMN_PREFIX)?;
        cells
            .into_iter()
            .map(|(col, (bytes, _ts))| {
                serde_json::from_slice::<Task>(&bytes)
                    .map(|t| (col, t))
                    .map_err(|e| GrrError::BadMessage(format!("task deserialization: {e}")))
            })
            .collect()
    }

    /// Returns up to `limit` eligible tasks, highest priority first and
    /// oldest id first within a priority, without leasing them.
    pub fn query(&self, queue: &QueueName, limit: usize) -> Result<Vec<Task>> {
        let now = self.store.now_millis();
        let mut tasks: Vec<Task> = self
            .all_tasks(queue)?
            .into_iter()
            .map(|(_, t)| t)
            .filter(|t| t.is_eligible(now))
            .collect();
        tasks.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        tasks.truncate(limit);
        Ok(tasks)
    }

    /// Leases up to `limit` eligible tasks for `lease_seconds`, returning the
    /// leased copies. Every successful lease decrements `ttl`; a task whose
    /// `ttl` has already reached 0 is dropped instead of re-leased. Re-leasing
    /// an already-seen task (one whose previous lease had expired) bumps
    /// `transmission_count` and the scheduler's own retransmission counter;
    /// the very first lease does not.
    pub fn query_and_own(
        &self,
        queue: &QueueName,
        limit: usize,
        lease_seconds: i64,
    ) -> Result<Vec<Task>> {
        let now = self.store.now_millis();
        let mut candidates: Vec<(String, Task)> = self
            .all_tasks(queue)?
            .into_iter()
            .filter(|(_, t)| t.is_eligible(now))
            .collect();
        candidates.sort_by(|a, b| b.1.priority.cmp(&a.1.priority).then(a.1.id.cmp(&b.1.id)));
        candidates.truncate(limit);

        let mut leased = Vec::with_capacity(candidates.len());
        for (column, mut task) in candidates {
            if self.drop_if_exhausted(queue, &task)? {
                continue;
            }
            let old_bytes = serde_json::to_vec(&task)
                .map_err(|e| GrrError::BadMessage(format!("task serialization: {e}")))?;
            let was_previously_leased = task.lease_expiry.is_some();
            task.lease_expiry = Some(now + lease_seconds * 1000);
            task.ttl -= 1;
            if was_previously_leased {
                task.transmission_count += 1;
            }
            let new_bytes = serde_json::to_vec(&task)
                .map_err(|e| GrrError::BadMessage(format!("task serialization: {e}")))?;
            let won = self
                .store
                .compare_and_set(queue.as_str(), &column, Some(&old_bytes), new_bytes)?;
            if won {
                if was_previously_leased {
                    self.retransmission_count.fetch_add(1, Ordering::Relaxed);
                }
                leased.push(task);
            }
        }
        Ok(leased)
    }

    /// Permanently removes a task. Consumes whatever lease it held.
    pub fn delete(&self, queue: &QueueName, task_id: u64) -> Result<()> {
        let column = format!("{TASK_COLUMN_PREFIX}{task_id:016x}");
        self.store
            .delete_attributes(queue.as_str(), &[column], None, None)
    }

    /// Expires the lease on a task whose `ttl` has been exhausted, dropping
    /// it from the queue instead of returning it to service.
    pub fn drop_if_exhausted(&self, queue: &QueueName, task: &Task) -> Result<bool> {
        if task.ttl == 0 {
            warn!(queue = %queue, id = task.id, "task exhausted retransmit budget, dropping");
            self.delete(queue, task.id)?;
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[test]
    fn schedule_then_query_and_own_single_task() {
        let store = InMemoryStore::new();
        store.set_now_millis(1000);
        let sched = Scheduler::new(&store);
        let queue = QueueName::from("CA");
        let task = sched.schedule(queue.clone(), Priority::Medium, b"hi".to_vec()).unwrap();

        let leased = sched.query_and_own(&queue, 10, 60).unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].id, task.id);
        assert_eq!(leased[0].transmission_count, 0);

        // Still leased: a second query_and_own before expiry sees nothing.
        let leased_again = sched.query_and_own(&queue, 10, 60).unwrap();
        assert!(leased_again.is_empty());
    }

    #[test]
    fn lease_expiry_then_retransmission_count_increments() {
        let store = InMemoryStore::new();
        store.set_now_millis(0);
        let sched = Scheduler::new(&store);
        let queue = QueueName::from("CA");
        sched.schedule(queue.clone(), Priority::Medium, b"hi".to_vec()).unwrap();

        let first = sched.query_and_own(&queue, 10, 5).unwrap();
        assert_eq!(first[0].transmission_count, 0);

        store.advance_millis(6_000);
        let second = sched.query_and_own(&queue, 10, 5).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].transmission_count, 1);
    }

    #[test]
    fn ttl_exhaustion_drops_task_after_five_releases() {
        let store = InMemoryStore::new();
        store.set_now_millis(0);
        let sched = Scheduler::new(&store);
        let queue = QueueName::from("CA");
        let task = sched.schedule(queue.clone(), Priority::Medium, b"hi".to_vec()).unwrap();
        assert_eq!(task.ttl, 5);

        let first = sched.query_and_own(&queue, 10, 100).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].ttl, 4);
        assert_eq!(first[0].transmission_count, 0);

        // Within the lease: nothing to hand out.
        store.advance_millis(10_000);
        assert!(sched.query_and_own(&queue, 10, 100).unwrap().is_empty());

        // Past the lease: re-lease #1.
        store.advance_millis(100_000);
        let second = sched.query_and_own(&queue, 10, 100).unwrap();
        assert_eq!(second[0].ttl, 3);
        assert_eq!(second[0].transmission_count, 1);

        store.advance_millis(110_000);
        let third = sched.query_and_own(&queue, 10, 100).unwrap();
        assert_eq!(third[0].ttl, 2);
        assert_eq!(third[0].transmission_count, 2);

        store.advance_millis(110_000);
        let fourth = sched.query_and_own(&queue, 10, 100).unwrap();
        assert_eq!(fourth[0].ttl, 1);
        assert_eq!(fourth[0].transmission_count, 3);

        store.advance_millis(110_000);
        let fifth = sched.query_and_own(&queue, 10, 100).unwrap();
        assert_eq!(fifth[0].ttl, 0);
        assert_eq!(fifth[0].transmission_count, 4);
        assert_eq!(sched.retransmission_count(), 4);

        // The task's ttl is now exhausted: the next attempt drops it instead
        // of handing out a sixth lease, and the retransmission count does not
        // move again.
        store.advance_millis(110_000);
        assert!(sched.query_and_own(&queue, 10, 100).unwrap().is_empty());
        assert_eq!(sched.retransmission_count(), 4);

        store.advance_millis(200_000);
        assert!(sched.query(&queue, 10).unwrap().is_empty(), "exhausted task row should be gone");
    }

    fn priority_for(i: u32) -> Priority {
        match i % 3 {
            0 => Priority::Low,
            1 => Priority::Medium,
            _ => Priority::High,
        }
    }

    #[test]
    fn scenario_priority_ordering_across_ten_tasks() {
        let store = InMemoryStore::new();
        store.set_now_millis(0);
        let sched = Scheduler::new(&store);
        let queue = QueueName::from("CA");
        for i in 0..10u32 {
            sched.schedule(queue.clone(), priority_for(i), vec![i as u8]).unwrap();
        }

        let all = sched.query(&queue, 100).unwrap();
        let priorities: Vec<u8> = all.iter().map(|t| t.priority as u8).collect();
        assert_eq!(priorities, vec![2, 2, 2, 1, 1, 1, 0, 0, 0, 0]);

        let high = sched.query_and_own(&queue, 3, 60).unwrap();
        assert_eq!(high.len(), 3);
        assert!(high.iter().all(|t| t.priority == Priority::High));

        let medium = sched.query_and_own(&queue, 3, 60).unwrap();
        assert_eq!(medium.len(), 3);
        assert!(medium.iter().all(|t| t.priority == Priority::Medium));

        let low = sched.query_and_own(&queue, 10, 60).unwrap();
        assert_eq!(low.len(), 4);
        assert!(low.iter().all(|t| t.priority == Priority::Low));
    }

    #[test]
    fn priority_ordering_high_before_low() {
        let store = InMemoryStore::new();
        store.set_now_millis(0);
        let sched = Scheduler::new(&store);
        let queue = QueueName::from("CA");
        sched.schedule(queue.clone(), Priority::Low, b"low".to_vec()).unwrap();
        sched.schedule(queue.clone(), Priority::High, b"high".to_vec()).unwrap();
        sched.schedule(queue.clone(), Priority::Medium, b"med".to_vec()).unwrap();

        let ordered = sched.query(&queue, 10).unwrap();
        assert_eq!(ordered.len(), 3);
        assert_eq!(ordered[0].priority, Priority::High);
        assert_eq!(ordered[1].priority, Priority::Medium);
        assert_eq!(ordered[2].priority, Priority::Low);
    }

    #[test]
    fn delete_consumes_lease_permanently() {
        let store = InMemoryStore::new();
        store.set_now_millis(0);
        let sched = Scheduler::new(&store);
        let queue = QueueName::from("CA");
        let task = sched.schedule(queue.clone(), Priority::Medium, b"hi".to_vec()).unwrap();
        sched.query_and_own(&queue, 10, 60).unwrap();
        sched.delete(&queue, task.id).unwrap();

        store.advance_millis(120_000);
        let leased = sched.query_and_own(&queue, 10, 60).unwrap();
        assert!(leased.is_empty());
    }

    #[test]
    fn reschedule_preserves_id() {
        let store = InMemoryStore::new();
        store.set_now_millis(0);
        let sched = Scheduler::new(&store);
        let queue = QueueName::from("CA");
        let mut task = sched.schedule(queue.clone(), Priority::Medium, b"hi".to_vec()).unwrap();
        let original_id = task.id;
        task.lease_expiry = None;
        sched.reschedule(&task).unwrap();

        let leased = sched.query_and_own(&queue, 10, 60).unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].id, original_id);
    }
}
