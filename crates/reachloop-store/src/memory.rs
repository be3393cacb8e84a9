//! In-memory record store.
//!
//! Keeps records as serialized JSON (like any key-value backend would), so
//! corrupt values and version conflicts behave exactly as in SQLite.

use async_trait::async_trait;
use chrono::Utc;
use reachloop_core::error::{ReachError, Result};
use reachloop_core::traits::RecordStore;
use reachloop_core::types::OutreachRecord;
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::lock_err;

struct StoredValue {
    body: String,
    version: u64,
}

/// Process-local record store. Listing order is key order.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<BTreeMap<String, StoredValue>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a raw JSON body, bypassing validation.
    pub fn put_raw(&self, id: &str, body: &str) -> Result<()> {
        let mut records = self.records.lock().map_err(lock_err)?;
        let version = records.get(id).map(|v| v.version + 1).unwrap_or(1);
        records.insert(
            id.to_string(),
            StoredValue {
                body: body.to_string(),
                version,
            },
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, id: &str) -> Result<Option<OutreachRecord>> {
        let records = self.records.lock().map_err(lock_err)?;
        match records.get(id) {
            Some(stored) => {
                let mut record: OutreachRecord = serde_json::from_str(&stored.body)?;
                record.version = stored.version;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, record: &OutreachRecord) -> Result<u64> {
        let mut records = self.records.lock().map_err(lock_err)?;
        let found = records.get(&record.id).map(|v| v.version);
        let expected = (record.version != 0).then_some(record.version);
        if found != expected {
            return Err(ReachError::Conflict {
                id: record.id.clone(),
                expected,
                found,
            });
        }

        let next = record.version + 1;
        let mut stored = record.clone();
        stored.version = next;
        stored.updated_at = Some(Utc::now());
        let body = serde_json::to_string(&stored)?;
        records.insert(
            record.id.clone(),
            StoredValue {
                body,
                version: next,
            },
        );
        Ok(next)
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        let records = self.records.lock().map_err(lock_err)?;
        Ok(records.keys().cloned().collect())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut records = self.records.lock().map_err(lock_err)?;
        Ok(records.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reachloop_core::types::RecordStatus;

    #[tokio::test]
    async fn test_versioned_writes() {
        let store = MemoryRecordStore::new();
        assert_eq!(store.put(&OutreachRecord::new("a", "A")).await.unwrap(), 1);

        let mut record = store.get("a").await.unwrap().unwrap();
        let stale = record.clone();
        record.status = RecordStatus::Invited;
        assert_eq!(store.put(&record).await.unwrap(), 2);

        assert!(matches!(
            store.put(&stale).await,
            Err(ReachError::Conflict { found: Some(2), .. })
        ));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_update_of_deleted_record_conflicts() {
        let store = MemoryRecordStore::new();
        store.put(&OutreachRecord::new("a", "A")).await.unwrap();
        let record = store.get("a").await.unwrap().unwrap();
        store.delete("a").await.unwrap();

        // Must never silently re-create
        assert!(matches!(
            store.put(&record).await,
            Err(ReachError::Conflict { found: None, .. })
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_value() {
        let store = MemoryRecordStore::new();
        store.put_raw("x", "[]").unwrap();
        assert!(matches!(
            store.get("x").await,
            Err(ReachError::Serialization(_))
        ));
    }
}
