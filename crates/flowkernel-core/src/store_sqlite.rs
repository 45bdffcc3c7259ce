//! A `rusqlite`-backed [`Store`], gated behind the `sqlite-persistence`
//! feature.
//!
//! Sits alongside the in-memory reference implementation as a real
//! persistence backend behind the same `Store` trait, selected at compile
//! time via the feature flag rather than a runtime switch. One table,
//! `cells(subject, column, value, ts)`, with a `(subject, column)` primary
//! key.

#![cfg(feature = "sqlite-persistence")]

use std::collections::BTreeMap;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{GrrError, Result};
use crate::store::{Cell, MutationPool, Store};

fn map_driver_err(e: rusqlite::Error) -> GrrError {
    GrrError::Store(e.to_string())
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(map_driver_err)?;
        Self::bootstrap(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).map_err(map_driver_err)?;
        Self::bootstrap(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn bootstrap(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cells (
                subject TEXT NOT NULL,
                column  TEXT NOT NULL,
                value   BLOB NOT NULL,
                ts      INTEGER NOT NULL,
                PRIMARY KEY (subject, column)
            );",
        )
        .map_err(map_driver_err)
    }
}

struct SqliteMutationPool<'a> {
    store: &'a SqliteStore,
    sets: Vec<(String, String, Vec<u8>)>,
    deletes: Vec<(String, String)>,
}

impl<'a> MutationPool for SqliteMutationPool<'a> {
    fn queue_set(&mut self, subject: &str, column: &str, value: Vec<u8>) {
        self.sets.push((subject.to_string(), column.to_string(), value));
    }

    fn queue_delete(&mut self, subject: &str, column: &str) {
        self.deletes.push((subject.to_string(), column.to_string()));
    }

    fn flush(self: Box<Self>) -> Result<()> {
        let now = self.store.now_millis();
        let mut conn = self.store.conn.lock().expect("sqlite connection lock poisoned");
        let tx = conn.transaction().map_err(map_driver_err)?;
        for (subject, column, value) in &self.sets {
            tx.execute(
                "INSERT INTO cells (subject, column, value, ts) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(subject, column) DO UPDATE SET value = excluded.value, ts = excluded.ts",
                params![subject, column, value, now],
            )
            .map_err(map_driver_err)?;
        }
        for (subject, column) in &self.deletes {
            tx.execute(
                "DELETE FROM cells WHERE subject = ?1 AND column = ?2",
                params![subject, column],
            )
            .map_err(map_driver_err)?;
        }
        tx.commit().map_err(map_driver_err)
    }
}

impl Store for SqliteStore {
    fn resolve(&self, subject: &str, column: &str) -> Result<Option<Cell>> {
        let conn = self.conn.lock().expect("sqlite connection lock poisoned");
        conn.query_row(
            "SELECT value, ts FROM cells WHERE subject = ?1 AND column = ?2",
            params![subject, column],
            |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()
        .map_err(map_driver_err)
    }

    fn resolve_regex(&self, subject: &str, column_prefix: &str) -> Result<Vec<(String, Cell)>> {
        let conn = self.conn.lock().expect("sqlite connection lock poisoned");
        let like = format!("{}%", column_prefix.replace('%', "\\%"));
        let mut stmt = conn
            .prepare("SELECT column, value, ts FROM cells WHERE subject = ?1 AND column LIKE ?2 ESCAPE '\\' ORDER BY column")
            .map_err(map_driver_err)?;
        let rows = stmt
            .query_map(params![subject, like], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    (row.get::<_, Vec<u8>>(1)?, row.get::<_, i64>(2)?),
                ))
            })
            .map_err(map_driver_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_driver_err)
    }

    fn multi_set(&self, subject: &str, values: BTreeMap<String, Vec<u8>>) -> Result<()> {
        let now = self.now_millis();
        let mut conn = self.conn.lock().expect("sqlite connection lock poisoned");
        let tx = conn.transaction().map_err(map_driver_err)?;
        for (column, value) in values {
            tx.execute(
                "INSERT INTO cells (subject, column, value, ts) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(subject, column) DO UPDATE SET value = excluded.value, ts = excluded.ts",
                params![subject, column, value, now],
            )
            .map_err(map_driver_err)?;
        }
        tx.commit().map_err(map_driver_err)
    }

    fn delete_attributes(
        &self,
        subject: &str,
        columns: &[String],
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("sqlite connection lock poisoned");
        for column in columns {
            conn.execute(
                "DELETE FROM cells WHERE subject = ?1 AND column = ?2
                 AND (?3 IS NULL OR ts >= ?3) AND (?4 IS NULL OR ts <= ?4)",
                params![subject, column, start, end],
            )
            .map_err(map_driver_err)?;
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
        let conn = self.conn.lock().expect("sqlite connection lock poisoned");
        let current: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM cells WHERE subject = ?1 AND column = ?2",
                params![subject, column],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_driver_err)?;
        if current.as_deref() != expected {
            return Ok(false);
        }
        conn.execute(
            "INSERT INTO cells (subject, column, value, ts) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(subject, column) DO UPDATE SET value = excluded.value, ts = excluded.ts",
            params![subject, column, new, now],
        )
        .map_err(map_driver_err)?;
        Ok(true)
    }

    fn mutation_pool(&self) -> Box<dyn MutationPool + '_> {
        Box::new(SqliteMutationPool {
            store: self,
            sets: Vec::new(),
            deletes: Vec::new(),
        })
    }

    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_sqlite() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut values = BTreeMap::new();
        values.insert("task:1".to_string(), b"payload".to_vec());
        store.multi_set("queueA", values).unwrap();

        let cell = store.resolve("queueA", "task:1").unwrap().unwrap();
        assert_eq!(cell.0, b"payload");

        let ok = store
            .compare_and_set("queueA", "task:1", Some(b"payload"), b"updated".to_vec())
            .unwrap();
        assert!(ok);
        assert_eq!(store.resolve("queueA", "task:1").unwrap().unwrap().0, b"updated");
    }
}
