//! Operator actions — manual record management outside the automatic pipeline.

use std::sync::Arc;

use chrono::Utc;
use reachloop_core::error::{ReachError, Result};
use reachloop_core::traits::RecordStore;
use reachloop_core::types::{OutreachRecord, RecordStatus};

use crate::transitions::{self, update_record};

pub struct Operator {
    store: Arc<dyn RecordStore>,
}

impl Operator {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Add a record in `new`, eligible on the next tick. Existing ids are a `Conflict`.
    pub async fn create(
        &self,
        id: &str,
        display_name: &str,
        custom_message: Option<String>,
    ) -> Result<OutreachRecord> {
        let id = id.trim();
        if id.is_empty() {
            return Err(ReachError::InvalidTransition("record id must not be empty".into()));
        }
        let mut record = OutreachRecord::new(id, display_name.trim());
        record.custom_message = custom_message.filter(|m| !m.trim().is_empty());
        record.version = self.store.put(&record).await?;
        tracing::info!("➕ Added '{}' ({})", record.display_name, record.id);
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Result<OutreachRecord> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ReachError::NotFound(id.to_string()))
    }

    /// All readable records in store order. Corrupt entries are logged and skipped.
    pub async fn list(&self) -> Result<Vec<OutreachRecord>> {
        let mut records = Vec::new();
        for id in self.store.list_keys().await? {
            match self.store.get(&id).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => tracing::warn!("⚠️ Skipping unreadable record '{id}': {e}"),
            }
        }
        Ok(records)
    }

    /// Any non-terminal state → `paused`.
    pub async fn pause(&self, id: &str) -> Result<OutreachRecord> {
        let record = update_record(self.store.as_ref(), id, transitions::pause).await?;
        tracing::info!("⏸️ Paused '{id}'");
        Ok(record)
    }

    /// `paused → new`, immediately eligible. `retryCount` is kept.
    pub async fn resume(&self, id: &str) -> Result<OutreachRecord> {
        let now = Utc::now();
        let record = update_record(self.store.as_ref(), id, |r| transitions::resume(r, now)).await?;
        tracing::info!("▶️ Resumed '{id}'");
        Ok(record)
    }

    /// Manual override: set any status and make the record due now. No edge validation.
    pub async fn reset(&self, id: &str, status: RecordStatus) -> Result<OutreachRecord> {
        let now = Utc::now();
        let record = update_record(self.store.as_ref(), id, |r| {
            r.status = status;
            r.next_action_at = Some(now);
            Ok(())
        })
        .await?;
        tracing::info!("🔧 Reset '{id}' to {status}");
        Ok(record)
    }

    /// Remove a record. Returns false when it did not exist.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let removed = self.store.delete(id).await?;
        if removed {
            tracing::info!("🗑️ Deleted '{id}'");
        }
        Ok(removed)
    }
}
