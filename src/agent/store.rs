//! Durable append-only queue of sensor readings, backed by a single SQLite
//! file. The store is the only buffer between hardware modules and the API
//! client — modules never call the API directly, so a server outage just
//! grows this table until the client can flush it.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};

use super::errors::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SensorReading {
    pub sensor_id: u32,
    pub value: f64,
    pub created_at_ms: u64,
}

pub struct ReadingStore {
    conn: Mutex<Connection>,
}

impl ReadingStore {
    pub fn open(path: impl AsRef<Path>) -> Result<ReadingStore> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|_| Error::io_init("reading-store-dir"))?;
            }
        }

        let conn = Connection::open(path).map_err(|_| Error::io_init("reading-store"))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sensor_readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                value REAL NOT NULL,
                sensor_id INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|_| Error::io_init("reading-store"))?;

        Ok(ReadingStore { conn: Mutex::new(conn) })
    }

    /// Inserts every reading as one transaction. Crash-safe: either all rows
    /// land or none do.
    pub fn append(&self, readings: &[SensorReading]) -> Result<()> {
        if readings.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(|_| Error::io_init("reading-store"))?;
        for reading in readings {
            tx.execute(
                "INSERT INTO sensor_readings (value, sensor_id, created_at) VALUES (?1, ?2, ?3)",
                params![reading.value, reading.sensor_id, reading.created_at_ms as i64],
            )
            .map_err(|_| Error::io_init("reading-store"))?;
        }
        tx.commit().map_err(|_| Error::io_init("reading-store"))?;
        Ok(())
    }

    /// Returns every row, ascending by id (== insertion order).
    pub fn snapshot(&self) -> Result<Vec<SensorReading>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT value, sensor_id, created_at FROM sensor_readings ORDER BY id ASC")
            .map_err(|_| Error::io_init("reading-store"))?;

        let rows = stmt
            .query_map([], |row| {
                Ok(SensorReading {
                    value: row.get(0)?,
                    sensor_id: row.get::<_, i64>(1)? as u32,
                    created_at_ms: row.get::<_, i64>(2)? as u64,
                })
            })
            .map_err(|_| Error::io_init("reading-store"))?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(|_| Error::io_init("reading-store"))
    }

    /// Deletes every row. Called after a successful upload, or on an
    /// explicit purge.
    pub fn purge_all(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM sensor_readings", []).map_err(|_| Error::io_init("reading-store"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn temp_store() -> (ReadingStore, tempfile_path::TempPath) {
        let path = tempfile_path::new();
        let store = ReadingStore::open(&path.0).unwrap();
        (store, path)
    }

    /// Tiny inline stand-in for a temp-file helper: avoids pulling in the
    /// `tempfile` crate just for a handful of store tests.
    mod tempfile_path {
        use std::sync::atomic::{AtomicU64, Ordering};

        pub struct TempPath(pub std::path::PathBuf);

        impl Drop for TempPath {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.0);
            }
        }

        pub fn new() -> TempPath {
            static COUNTER: AtomicU64 = AtomicU64::new(0);
            let n = COUNTER.fetch_add(1, Ordering::Relaxed);
            let mut path = std::env::temp_dir();
            path.push(format!("agent-reading-store-test-{}-{}.db", std::process::id(), n));
            TempPath(path)
        }
    }

    #[test]
    #[serial]
    fn append_then_snapshot_round_trips_in_order() {
        let (store, _guard) = temp_store();
        store
            .append(&[
                SensorReading { sensor_id: 3, value: 21.5, created_at_ms: 1000 },
                SensorReading { sensor_id: 4, value: 55.0, created_at_ms: 1001 },
            ])
            .unwrap();

        let rows = store.snapshot().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].sensor_id, 3);
        assert_eq!(rows[1].sensor_id, 4);
    }

    #[test]
    #[serial]
    fn purge_all_empties_the_store() {
        let (store, _guard) = temp_store();
        store.append(&[SensorReading { sensor_id: 1, value: 1.0, created_at_ms: 1 }]).unwrap();
        store.purge_all().unwrap();
        assert!(store.snapshot().unwrap().is_empty());
    }

    #[test]
    #[serial]
    fn readings_survive_reopening_the_same_file() {
        let path = tempfile_path::new();
        {
            let store = ReadingStore::open(&path.0).unwrap();
            store.append(&[SensorReading { sensor_id: 9, value: 3.0, created_at_ms: 5 }]).unwrap();
        }
        let store = ReadingStore::open(&path.0).unwrap();
        assert_eq!(store.snapshot().unwrap().len(), 1);
    }
}
