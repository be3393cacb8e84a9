//! Record store trait — durable key-value persistence of outreach records.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::OutreachRecord;

/// Durable record persistence keyed by `OutreachRecord::id`.
///
/// `put` is a compare-and-set on `record.version`: the write only lands if the
/// stored version still equals the version the caller read (0 = must not exist).
/// On success the new version is returned; on mismatch `ReachError::Conflict`.
/// No multi-key transactions are offered.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Backend name (for logs).
    fn name(&self) -> &str;

    /// Fetch a record. `Ok(None)` when absent, `Err(Serialization)` when corrupt.
    async fn get(&self, id: &str) -> Result<Option<OutreachRecord>>;

    /// Write a record guarded by its version. Returns the new version.
    async fn put(&self, record: &OutreachRecord) -> Result<u64>;

    /// All record ids in backend listing order.
    async fn list_keys(&self) -> Result<Vec<String>>;

    /// Remove a record. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool>;
}
