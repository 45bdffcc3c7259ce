//! Append-only indexed sequences: flow results, results indexed by their
//! type, and the flow's log. All three are instances of the same generic
//! [`Collection`] rather than three bespoke structures.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{GrrError, Result};
use crate::store::Store;

const COUNTER_COLUMN: &str = "seq_counter";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Entry {
    type_tag: Option<String>,
    payload: Vec<u8>,
}

/// One append-only, sequence-numbered collection scoped to a single
/// subject and column prefix.
pub struct Collection<'s> {
    store: &'s dyn Store,
    subject: String,
    prefix: String,
}

impl<'s> Collection<'s> {
    pub fn new(store: &'s dyn Store, subject: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            subject: subject.into(),
            prefix: prefix.into(),
        }
    }

    fn counter_column(&self) -> String {
        format!("{}{COUNTER_COLUMN}", self.prefix)
    }

    fn entry_column(&self, seq: u64) -> String {
        format!("{}item:{seq:016x}", self.prefix)
    }

    fn reserve_seq(&self) -> Result<u64> {
        loop {
            let current = self
                .store
                .resolve(&self.subject, &self.counter_column())?
                .map(|(bytes, _)| u64::from_be_bytes(bytes.try_into().unwrap_or([0; 8])))
                .unwrap_or(0);
            let expected = if current == 0 {
                None
            } else {
                Some(current.to_be_bytes())
            };
            let expected_ref = expected.as_ref().map(|b| b.as_slice());
            let won = self.store.compare_and_set(
                &self.subject,
                &self.counter_column(),
                expected_ref,
                (current + 1).to_be_bytes().to_vec(),
            )?;
            if won {
                return Ok(current);
            }
        }
    }

    /// Appends one item, returning its sequence number.
    pub fn add(&self, payload: Vec<u8>, type_tag: Option<&str>) -> Result<u64> {
        let seq = self.reserve_seq()?;
        let entry = Entry {
            type_tag: type_tag.map(|s| s.to_string()),
            payload,
        };
        let bytes = serde_json::to_vec(&entry)
            .map_err(|e| GrrError::BadMessage(format!("collection entry serialization: {e}")))?;
        let mut values = BTreeMap::new();
        values.insert(self.entry_column(seq), bytes);
        self.store.multi_set(&self.subject, values)?;
        Ok(seq)
    }

    /// All items in sequence order, optionally filtered by type tag.
    pub fn scan(&self, type_filter: Option<&str>) -> Result<Vec<(u64, Vec<u8>)>> {
        let item_prefix = format!("{}item:", self.prefix);
        let mut cells = self.store.resolve_regex(&self.subject, &item_prefix)?;
        cells.sort_by(|a, b| a.0.cmp(&b.0));
        let mut out = Vec::with_capacity(cells.len());
        for (col, (bytes, _)) in cells {
            let entry: Entry = serde_json::from_slice(&bytes)
                .map_err(|e| GrrError::BadMessage(format!("collection entry deserialization: {e}")))?;
            if let Some(wanted) = type_filter {
                if entry.type_tag.as_deref() != Some(wanted) {
                    continue;
                }
            }
            let seq = col
                .rsplit(':')
                .next()
                .and_then(|s| u64::from_str_radix(s, 16).ok())
                .unwrap_or(0);
            out.push((seq, entry.payload));
        }
        Ok(out)
    }

    pub fn len(&self, type_filter: Option<&str>) -> Result<usize> {
        Ok(self.scan(type_filter)?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len(None)? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[test]
    fn appended_items_come_back_in_order() {
        let store = InMemoryStore::new();
        let col = Collection::new(&store, "aff4:/CA/flows/X", "result:");
        col.add(b"a".to_vec(), Some("TypeA")).unwrap();
        col.add(b"b".to_vec(), Some("TypeB")).unwrap();
        col.add(b"c".to_vec(), Some("TypeA")).unwrap();

        let all = col.scan(None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].1, b"a");
        assert_eq!(all[2].1, b"c");

        let only_a = col.scan(Some("TypeA")).unwrap();
        assert_eq!(only_a.len(), 2);
    }

    #[test]
    fn two_collections_on_one_subject_stay_isolated() {
        let store = InMemoryStore::new();
        let results = Collection::new(&store, "aff4:/CA/flows/X", "result:");
        let logs = Collection::new(&store, "aff4:/CA/flows/X", "log:");
        results.add(b"r".to_vec(), None).unwrap();
        logs.add(b"l1".to_vec(), None).unwrap();
        logs.add(b"l2".to_vec(), None).unwrap();

        assert_eq!(results.len(None).unwrap(), 1);
        assert_eq!(logs.len(None).unwrap(), 2);
    }
}
