//! Record store for persisted history and favorites
//!
//! A narrow key/record interface: the engine never depends on a storage
//! technology, only on `get`, `put` and `list`. Callers treat every error as
//! non-fatal to the in-memory session.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::{FilterError, Result};

/// Table holding the records
pub const RECORDS_TABLE: &str = "_geofilter_records";

pub trait RecordStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;

    fn put(&self, key: &str, record: &Value) -> Result<()>;

    /// Records whose key starts with `prefix`, sorted by key
    fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>>;
}

/// Session-only store
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<BTreeMap<String, Value>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self, key: &str) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Value>>> {
        self.records
            .lock()
            .map_err(|_| FilterError::persistence(key, "record store lock poisoned"))
    }
}

impl RecordStore for MemoryRecordStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.lock(key)?.get(key).cloned())
    }

    fn put(&self, key: &str, record: &Value) -> Result<()> {
        self.lock(key)?.insert(key.to_string(), record.clone());
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        Ok(self
            .lock(prefix)?
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Records kept in a table of a SQLite file
#[derive(Debug)]
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    /// Open (or create) the records table in the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| {
            FilterError::persistence(
                &path.display().to_string(),
                format!("failed to open record store: {}", e),
            )
        })?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(2))?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated TEXT NOT NULL
            );",
            RECORDS_TABLE
        ))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        key: &str,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| FilterError::persistence(key, "record store lock poisoned"))?;
        f(&conn).map_err(|e| FilterError::persistence(key, e))
    }
}

fn escape_like(prefix: &str) -> String {
    prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

impl RecordStore for SqliteRecordStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let text: Option<String> = self.with_conn(key, |conn| {
            conn.query_row(
                &format!("SELECT value FROM {} WHERE key = ?1", RECORDS_TABLE),
                params![key],
                |row| row.get(0),
            )
            .optional()
        })?;
        text.map(|t| serde_json::from_str(&t).map_err(|e| FilterError::persistence(key, e)))
            .transpose()
    }

    fn put(&self, key: &str, record: &Value) -> Result<()> {
        let text = serde_json::to_string(record)?;
        let now = chrono::Utc::now().to_rfc3339();
        self.with_conn(key, |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {} (key, value, updated) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated = excluded.updated",
                    RECORDS_TABLE
                ),
                params![key, text, now],
            )
        })?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let pattern = format!("{}%", escape_like(prefix));
        let rows: Vec<(String, String)> = self.with_conn(prefix, |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT key, value FROM {} WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key",
                RECORDS_TABLE
            ))?;
            let rows = stmt.query_map(params![pattern], |row| Ok((row.get(0)?, row.get(1)?)))?;
            let collected: rusqlite::Result<Vec<(String, String)>> = rows.collect();
            collected
        })?;
        rows.into_iter()
            // LIKE is case-insensitive for ASCII
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| {
                let value = serde_json::from_str(&v).map_err(|e| FilterError::persistence(&k, e))?;
                Ok((k, value))
            })
            .collect()
    }
}
