//! SQLite-backed work queue — at-least-once delivery with visibility leases.
//!
//! `receive` leases messages for `visibility_timeout`; `ack` deletes them.
//! A leased message that is never acked becomes visible again and is handed
//! out with a higher attempt count. Receipts encode the attempt, so a late ack
//! from an expired lease cannot delete a message someone else now holds.

use async_trait::async_trait;
use chrono::Utc;
use reachloop_core::error::{ReachError, Result};
use reachloop_core::traits::{Delivery, WorkQueue};
use reachloop_core::types::{QueueKind, WorkItem};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use crate::{db_err, lock_err};

/// Durable queue for one [`QueueKind`]; several queues may share a database file.
pub struct SqliteWorkQueue {
    conn: Mutex<Connection>,
    kind: QueueKind,
    visibility_timeout: Duration,
}

impl SqliteWorkQueue {
    pub fn open(path: &Path, kind: QueueKind, visibility_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| db_err("Queue open", e))?;
        Self::from_connection(conn, kind, visibility_timeout)
    }

    pub fn open_in_memory(kind: QueueKind, visibility_timeout: Duration) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| db_err("Queue open", e))?;
        Self::from_connection(conn, kind, visibility_timeout)
    }

    fn from_connection(
        conn: Connection,
        kind: QueueKind,
        visibility_timeout: Duration,
    ) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS queue_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,            -- 'connection' | 'message'
                payload TEXT NOT NULL,          -- JSON WorkItem
                attempts INTEGER NOT NULL DEFAULT 0,
                visible_at INTEGER NOT NULL,    -- unix millis
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_queue_visible ON queue_messages(queue, visible_at);
            ",
        )
        .map_err(|e| db_err("Queue migration", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
            kind,
            visibility_timeout,
        })
    }

    fn queue_name(&self) -> String {
        self.kind.to_string()
    }
}

fn parse_receipt(receipt: &str) -> Result<(i64, i64)> {
    let (id, attempt) = receipt
        .split_once(':')
        .ok_or_else(|| ReachError::Queue(format!("malformed receipt '{receipt}'")))?;
    let id = id
        .parse()
        .map_err(|_| ReachError::Queue(format!("malformed receipt '{receipt}'")))?;
    let attempt = attempt
        .parse()
        .map_err(|_| ReachError::Queue(format!("malformed receipt '{receipt}'")))?;
    Ok((id, attempt))
}

#[async_trait]
impl WorkQueue for SqliteWorkQueue {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    async fn send(&self, item: &WorkItem) -> Result<()> {
        let payload = serde_json::to_string(item)?;
        let now = Utc::now();
        let conn = self.conn.lock().map_err(lock_err)?;
        conn.execute(
            "INSERT INTO queue_messages (queue, payload, attempts, visible_at, created_at)
             VALUES (?1, ?2, 0, ?3, ?4)",
            params![
                self.queue_name(),
                payload,
                now.timestamp_millis(),
                now.to_rfc3339()
            ],
        )
        .map_err(|e| ReachError::Queue(format!("send to {}: {e}", self.kind)))?;
        Ok(())
    }

    async fn receive(&self, max: usize) -> Result<Vec<Delivery>> {
        let now = Utc::now().timestamp_millis();
        let lease_until = now + self.visibility_timeout.as_millis() as i64;
        let conn = self.conn.lock().map_err(lock_err)?;

        let rows: Vec<(i64, String, i64)> = {
            let mut stmt = conn
                .prepare(
                    "SELECT id, payload, attempts FROM queue_messages
                     WHERE queue = ?1 AND visible_at <= ?2
                     ORDER BY id LIMIT ?3",
                )
                .map_err(|e| db_err("Queue receive", e))?;
            stmt.query_map(params![self.queue_name(), now, max as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .map_err(|e| db_err("Queue receive", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| db_err("Queue receive", e))?
        };

        let mut deliveries = Vec::with_capacity(rows.len());
        for (id, payload, attempts) in rows {
            let item: WorkItem = match serde_json::from_str(&payload) {
                Ok(item) => item,
                Err(e) => {
                    tracing::warn!("⚠️ Dropping unreadable {} message #{id}: {e}", self.kind);
                    conn.execute("DELETE FROM queue_messages WHERE id = ?1", params![id])
                        .map_err(|e| db_err("Queue drop", e))?;
                    continue;
                }
            };
            let attempt = attempts + 1;
            conn.execute(
                "UPDATE queue_messages SET attempts = ?2, visible_at = ?3 WHERE id = ?1",
                params![id, attempt, lease_until],
            )
            .map_err(|e| db_err("Queue lease", e))?;
            deliveries.push(Delivery {
                receipt: format!("{id}:{attempt}"),
                item,
                attempts: attempt as u32,
            });
        }
        Ok(deliveries)
    }

    async fn ack(&self, receipt: &str) -> Result<()> {
        let (id, attempt) = parse_receipt(receipt)?;
        let conn = self.conn.lock().map_err(lock_err)?;
        let changed = conn
            .execute(
                "DELETE FROM queue_messages WHERE id = ?1 AND attempts = ?2",
                params![id, attempt],
            )
            .map_err(|e| db_err("Queue ack", e))?;
        if changed == 0 {
            tracing::debug!("Ack for stale or unknown receipt {receipt} on {}", self.kind);
        }
        Ok(())
    }

    async fn depth(&self) -> Result<usize> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM queue_messages WHERE queue = ?1",
                params![self.queue_name()],
                |row| row.get(0),
            )
            .map_err(|e| db_err("Queue depth", e))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(visibility: Duration) -> SqliteWorkQueue {
        SqliteWorkQueue::open_in_memory(QueueKind::Connection, visibility).unwrap()
    }

    #[tokio::test]
    async fn test_send_receive_ack() {
        let q = queue(Duration::from_secs(60));
        q.send(&WorkItem::new("a", "A")).await.unwrap();
        q.send(&WorkItem::new("b", "B")).await.unwrap();

        let batch = q.receive(10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].item.id, "a");
        assert_eq!(batch[0].attempts, 1);

        // Leased messages are invisible
        assert!(q.receive(10).await.unwrap().is_empty());

        for d in &batch {
            q.ack(&d.receipt).await.unwrap();
        }
        assert_eq!(q.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unacked_message_is_redelivered() {
        let q = queue(Duration::ZERO);
        q.send(&WorkItem::new("a", "A")).await.unwrap();

        let first = q.receive(1).await.unwrap();
        let second = q.receive(1).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].attempts, 2);

        // The expired lease can no longer ack
        q.ack(&first[0].receipt).await.unwrap();
        assert_eq!(q.depth().await.unwrap(), 1);

        q.ack(&second[0].receipt).await.unwrap();
        assert_eq!(q.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_queues_are_isolated_by_kind() {
        let q = queue(Duration::from_secs(60));
        {
            let conn = q.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO queue_messages (queue, payload, attempts, visible_at, created_at)
                 VALUES ('message', '{\"id\":\"m\",\"displayName\":\"M\"}', 0, 0, '')",
                [],
            )
            .unwrap();
        }
        assert!(q.receive(10).await.unwrap().is_empty());
        assert_eq!(q.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_payload_dropped() {
        let q = queue(Duration::from_secs(60));
        {
            let conn = q.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO queue_messages (queue, payload, attempts, visible_at, created_at)
                 VALUES ('connection', 'garbage', 0, 0, '')",
                [],
            )
            .unwrap();
        }
        q.send(&WorkItem::new("ok", "OK")).await.unwrap();
        let batch = q.receive(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].item.id, "ok");
        assert_eq!(q.depth().await.unwrap(), 1);
    }

    #[test]
    fn test_malformed_receipt() {
        assert!(parse_receipt("nope").is_err());
        assert_eq!(parse_receipt("7:2").unwrap(), (7, 2));
    }
}
