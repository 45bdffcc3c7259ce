//! The `Store` contract: an abstract ordered key/column store
//! with compare-and-set, column-prefix scans, TTL-free rows, and a coarse
//! "mutation pool" for batched writes.
//!
//! This crate treats the concrete backend as an injected collaborator:
//! everything above this module only ever goes through the `Store` trait.
//! [`InMemoryStore`] is the reference implementation used by this crate's own
//! tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use crate::error::{GrrError, Result};

/// One versioned cell: `(value, timestamp_millis)`.
pub type Cell = (Vec<u8>, i64);

/// A batch of mutations collected by one invocation and committed together.
///
/// A `MutationPool` is not atomic across subjects, only a convenience for
/// batching the writes a single caller accumulates before flushing.
pub trait MutationPool: Send {
    fn queue_set(&mut self, subject: &str, column: &str, value: Vec<u8>);
    fn queue_delete(&mut self, subject: &str, column: &str);
    fn flush(self: Box<Self>) -> Result<()>;
}

/// Abstract ordered key/column store, supplied by the host.
///
/// No isolation beyond per-subject compare-and-set is assumed.
pub trait Store: Send + Sync {
    /// Reads a single column of a subject.
    fn resolve(&self, subject: &str, column: &str) -> Result<Option<Cell>>;

    /// Scans all columns of `subject` whose name starts with `column_prefix`,
    /// returned in ascending column order.
    fn resolve_regex(&self, subject: &str, column_prefix: &str) -> Result<Vec<(String, Cell)>>;

    /// Writes several columns of one subject at once (not necessarily atomic
    /// with other subjects, but atomic for this call).
    fn multi_set(&self, subject: &str, values: BTreeMap<String, Vec<u8>>) -> Result<()>;

    /// Removes the named columns, optionally bounded to a timestamp range.
    fn delete_attributes(
        &self,
        subject: &str,
        columns: &[String],
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<()>;

    /// Atomically replaces `column` with `new` iff its current value equals
    /// `expected` (`None` means "column must not exist yet").
    fn compare_and_set(
        &self,
        subject: &str,
        column: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
    ) -> Result<bool>;

    /// A mutation pool the caller can queue writes into and flush as a unit.
    fn mutation_pool(&self) -> Box<dyn MutationPool + '_>;

    /// The store-supplied wall clock, in milliseconds. Lease and eta
    /// decisions are defined relative to this single clock so that clock
    /// skew across callers is not observable.
    fn now_millis(&self) -> i64;
}

/// A simple process-local `Store`, backed by a `Mutex<BTreeMap<...>>`.
///
/// Not meant for production use, only as the reference backend exercised by
/// this crate's own test suite and as a starting point for a host that has
/// not wired up a real backend yet.
pub struct InMemoryStore {
    rows: Mutex<BTreeMap<String, BTreeMap<String, Cell>>>,
    clock_millis: AtomicI64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            clock_millis: AtomicI64::new(0),
        }
    }

    /// Test/demo hook: pin the store's clock instead of using wall time.
    pub fn set_now_millis(&self, now: i64) {
        self.clock_millis.store(now, Ordering::SeqCst);
    }

    pub fn advance_millis(&self, delta: i64) {
        self.clock_millis.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

struct InMemoryMutationPool<'a> {
    store: &'a InMemoryStore,
    sets: Vec<(String, String, Vec<u8>)>,
    deletes: Vec<(String, String)>,
}

impl<'a> MutationPool for InMemoryMutationPool<'a> {
    fn queue_set(&mut self, subject: &str, column: &str, value: Vec<u8>) {
        self.sets.push((subject.to_string(), column.to_string(), value));
    }

    fn queue_delete(&mut self, subject: &str, column: &str) {
        self.deletes.push((subject.to_string(), column.to_string()));
    }

    fn flush(self: Box<Self>) -> Result<()> {
        let now = self.store.now_millis();
        let mut rows = self
            .store
            .rows
            .lock()
            .map_err(|_| GrrError::Store("mutation pool lock poisoned".into()))?;
        for (subject, column, value) in self.sets {
            rows.entry(subject).or_default().insert(column, (value, now));
        }
        for (subject, column) in self.deletes {
            if let Some(cols) = rows.get_mut(&subject) {
                cols.remove(&column);
            }
        }
        Ok(())
    }
}

impl Store for InMemoryStore {
    fn resolve(&self, subject: &str, column: &str) -> Result<Option<Cell>> {
        let rows = self
            .rows
            .lock()
            .map_err(|_| GrrError::Store("lock poisoned".into()))?;
        Ok(rows.get(subject).and_then(|cols| cols.get(column).cloned()))
    }

    fn resolve_regex(&self, subject: &str, column_prefix: &str) -> Result<Vec<(String, Cell)>> {
        let rows = self
            .rows
            .lock()
            .map_err(|_| GrrError::Store("lock poisoned".into()))?;
        let Some(cols) = rows.get(subject) else {
            return Ok(Vec::new());
        };
        Ok(cols
            .iter()
            .filter(|(col, _)| col.starts_with(column_prefix))
            .map(|(col, cell)| (col.clone(), cell.clone()))
            .collect())
    }

    fn multi_set(&self, subject: &str, values: BTreeMap<String, Vec<u8>>) -> Result<()> {
        let now = self.now_millis();
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| GrrError::Store("lock poisoned".into()))?;
        let entry = rows.entry(subject.to_string()).or_default();
        for (column, value) in values {
            entry.insert(column, (value, now));
        }
        Ok(())
    }

    fn delete_attributes(
        &self,
        subject: &str,
        columns: &[String],
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<()> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| GrrError::Store("lock poisoned".into()))?;
        let Some(cols) = rows.get_mut(subject) else {
            return Ok(());
        };
        for column in columns {
            let in_range = cols
                .get(column)
                .map(|(_, ts)| {
                    start.map(|s| *ts >= s).unwrap_or(true) && end.map(|e| *ts <= e).unwrap_or(true)
                })
                .unwrap_or(false);
            if in_range {
                cols.remove(column);
            }
        }
        Ok(())
    }

    fn compare_and_set(
        &self,
        subject: &str,
        column: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
    ) -> Result<bool> {
        let now = self.now_millis();
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| GrrError::Store("lock poisoned".into()))?;
        let entry = rows.entry(subject.to_string()).or_default();
        let current = entry.get(column).map(|(v, _)| v.as_slice());
        if current != expected {
            return Ok(false);
        }
        entry.insert(column.to_string(), (new, now));
        Ok(true)
    }

    fn mutation_pool(&self) -> Box<dyn MutationPool + '_> {
        Box::new(InMemoryMutationPool {
            store: self,
            sets: Vec::new(),
            deletes: Vec::new(),
        })
    }

    fn now_millis(&self) -> i64 {
        self.clock_millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_set_then_resolve_regex() {
        let store = InMemoryStore::new();
        store.set_now_millis(1000);
        let mut values = BTreeMap::new();
        values.insert("task:00000001".to_string(), b"a".to_vec());
        values.insert("task:00000002".to_string(), b"b".to_vec());
        values.insert("meta:owner".to_string(), b"x".to_vec());
        store.multi_set("queueA", values).unwrap();

        let mut tasks = store.resolve_regex("queueA", "task:").unwrap();
        tasks.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].0, "task:00000001");
    }

    #[test]
    fn compare_and_set_rejects_stale_expectation() {
        let store = InMemoryStore::new();
        store.multi_set("s", BTreeMap::from([("c".to_string(), b"v1".to_vec())])).unwrap();
        let ok = store.compare_and_set("s", "c", Some(b"wrong"), b"v2".to_vec()).unwrap();
        assert!(!ok);
        let ok = store.compare_and_set("s", "c", Some(b"v1"), b"v2".to_vec()).unwrap();
        assert!(ok);
        assert_eq!(store.resolve("s", "c").unwrap().unwrap().0, b"v2");
    }

    #[test]
    fn delete_attributes_respects_timestamp_range() {
        let store = InMemoryStore::new();
        store.set_now_millis(100);
        store.multi_set("s", BTreeMap::from([("c".to_string(), b"v".to_vec())])).unwrap();
        store
            .delete_attributes("s", &["c".to_string()], Some(200), None)
            .unwrap();
        assert!(store.resolve("s", "c").unwrap().is_some());
        store
            .delete_attributes("s", &["c".to_string()], Some(0), Some(100))
            .unwrap();
        assert!(store.resolve("s", "c").unwrap().is_none());
    }

    #[test]
    fn mutation_pool_batches_writes() {
        let store = InMemoryStore::new();
        let mut pool = store.mutation_pool();
        pool.queue_set("s", "c1", b"1".to_vec());
        pool.queue_set("s", "c2", b"2".to_vec());
        assert!(store.resolve("s", "c1").unwrap().is_none());
        pool.flush().unwrap();
        assert!(store.resolve("s", "c1").unwrap().is_some());
        assert!(store.resolve("s", "c2").unwrap().is_some());
    }
}
