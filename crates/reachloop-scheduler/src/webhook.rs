//! Webhook ingest — the external "invitation accepted" signal.
//!
//! The record is persisted as `accepted` before the message item is sent.
//! If the send fails the record is still `accepted` with `nextActionAt = now`,
//! so the next scheduler tick picks it up. Repeated deliveries re-set the same
//! state and enqueue again; consumers ack everything, so that is harmless.

use std::sync::Arc;

use chrono::Utc;
use reachloop_core::error::{ReachError, Result};
use reachloop_core::traits::{RecordStore, WorkQueue};
use reachloop_core::types::{OutreachRecord, WorkItem};
use sha2::{Digest, Sha256};

use crate::transitions::{mark_accepted, update_record};

/// Header carrying the shared secret.
pub const SHARED_SECRET_HEADER: &str = "X-Shared-Secret";

pub struct WebhookIngester {
    store: Arc<dyn RecordStore>,
    message_queue: Arc<dyn WorkQueue>,
    secret_digest: [u8; 32],
}

impl WebhookIngester {
    pub fn new(
        store: Arc<dyn RecordStore>,
        message_queue: Arc<dyn WorkQueue>,
        shared_secret: &str,
    ) -> Self {
        Self {
            store,
            message_queue,
            secret_digest: digest(shared_secret),
        }
    }

    /// Exact match against the configured secret. Absent or different → `Unauthorized`.
    pub fn verify(&self, provided: Option<&str>) -> Result<()> {
        let Some(provided) = provided else {
            return Err(ReachError::Unauthorized(format!("missing {SHARED_SECRET_HEADER}")));
        };
        // Compare fixed-size digests so timing does not depend on where the strings differ
        let matches = digest(provided)
            .iter()
            .zip(self.secret_digest.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0;
        if matches {
            Ok(())
        } else {
            Err(ReachError::Unauthorized("shared secret mismatch".into()))
        }
    }

    /// Verify, then mark the record accepted and enqueue its follow-up message.
    pub async fn ingest(&self, provided_secret: Option<&str>, id: &str) -> Result<OutreachRecord> {
        self.verify(provided_secret)?;
        self.accept(id).await
    }

    /// Mark accepted (persisted first), then send the message work item.
    /// Unknown ids are `NotFound` and nothing is enqueued.
    pub async fn accept(&self, id: &str) -> Result<OutreachRecord> {
        let now = Utc::now();
        let record = update_record(self.store.as_ref(), id, |record| {
            mark_accepted(record, now);
            Ok(())
        })
        .await?;

        if let Err(e) = self.message_queue.send(&WorkItem::for_record(&record)).await {
            tracing::warn!(
                "⚠️ '{}' accepted but message enqueue failed, the scheduler will pick it up: {e}",
                record.id
            );
            return Err(e);
        }

        tracing::info!("🤝 '{}' ({}) accepted, follow-up enqueued", record.display_name, record.id);
        Ok(record)
    }
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}
