//! SQLite-backed record store.
//!
//! Each record is one row: the JSON body plus a `version` column used for
//! compare-and-set writes. Listing order is insertion order.

use async_trait::async_trait;
use chrono::Utc;
use reachloop_core::error::{ReachError, Result};
use reachloop_core::traits::RecordStore;
use reachloop_core::types::OutreachRecord;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Mutex;

use crate::{db_err, lock_err};

/// Durable record store.
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    /// Open or create the record database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| db_err("DB open", e))?;
        Self::from_connection(conn)
    }

    /// In-memory database (tests, dry runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| db_err("DB open", e))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        // WAL for concurrent readers; harmless on :memory:
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(lock_err)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS outreach_records (
                id TEXT PRIMARY KEY,
                body TEXT NOT NULL,              -- JSON OutreachRecord
                version INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| db_err("Migration", e))?;
        Ok(())
    }

    /// Write a raw JSON body, bypassing validation. Used by importers and to
    /// reproduce corrupt rows in tests.
    pub fn put_raw(&self, id: &str, body: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(lock_err)?;
        conn.execute(
            "INSERT INTO outreach_records (id, body, version, updated_at)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(id) DO UPDATE SET body = excluded.body, version = version + 1,
                 updated_at = excluded.updated_at",
            params![id, body, Utc::now().to_rfc3339()],
        )
        .map_err(|e| db_err("Put raw", e))?;
        Ok(())
    }

    fn current_version(conn: &Connection, id: &str) -> Result<Option<u64>> {
        conn.query_row(
            "SELECT version FROM outreach_records WHERE id = ?1",
            params![id],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map(|v| v.map(|v| v as u64))
        .map_err(|e| db_err("Read version", e))
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, id: &str) -> Result<Option<OutreachRecord>> {
        let row: Option<(String, i64)> = {
            let conn = self.conn.lock().map_err(lock_err)?;
            conn.query_row(
                "SELECT body, version FROM outreach_records WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| db_err("Get record", e))?
        };

        match row {
            Some((body, version)) => {
                let mut record: OutreachRecord = serde_json::from_str(&body)?;
                record.version = version as u64;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, record: &OutreachRecord) -> Result<u64> {
        let expected = record.version;
        let next = expected + 1;
        let now = Utc::now();

        let mut stored = record.clone();
        stored.version = next;
        stored.updated_at = Some(now);
        let body = serde_json::to_string(&stored)?;

        let conn = self.conn.lock().map_err(lock_err)?;
        let changed = if expected == 0 {
            conn.execute(
                "INSERT INTO outreach_records (id, body, version, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO NOTHING",
                params![record.id, body, next as i64, now.to_rfc3339()],
            )
            .map_err(|e| db_err("Insert record", e))?
        } else {
            conn.execute(
                "UPDATE outreach_records SET body = ?2, version = ?3, updated_at = ?4
                 WHERE id = ?1 AND version = ?5",
                params![
                    record.id,
                    body,
                    next as i64,
                    now.to_rfc3339(),
                    expected as i64
                ],
            )
            .map_err(|e| db_err("Update record", e))?
        };

        if changed == 0 {
            let found = Self::current_version(&conn, &record.id)?;
            return Err(ReachError::Conflict {
                id: record.id.clone(),
                expected: (expected != 0).then_some(expected),
                found,
            });
        }

        tracing::debug!("💾 Saved record '{}' v{}", record.id, next);
        Ok(next)
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let mut stmt = conn
            .prepare("SELECT id FROM outreach_records ORDER BY rowid")
            .map_err(|e| db_err("List keys", e))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| db_err("List keys", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| db_err("List keys", e))?;
        Ok(ids)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let changed = conn
            .execute("DELETE FROM outreach_records WHERE id = ?1", params![id])
            .map_err(|e| db_err("Delete record", e))?;
        Ok(changed > 0)
    }
}
