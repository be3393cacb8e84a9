//! Work queue trait — at-least-once delivery of work items.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{QueueKind, WorkItem};

/// A leased message. Must be acknowledged via `WorkQueue::ack`, otherwise it
/// becomes visible again once the backend's visibility timeout expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Opaque lease handle.
    pub receipt: String,
    pub item: WorkItem,
    /// How many times this message has been handed out (1 = first delivery).
    pub attempts: u32,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    fn kind(&self) -> QueueKind;

    async fn send(&self, item: &WorkItem) -> Result<()>;

    /// Lease up to `max` visible messages. Returns immediately, possibly empty.
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>>;

    /// Acknowledge (delete) a leased message. A stale receipt (lease expired and
    /// the message handed out again) is ignored so it cannot delete the new lease.
    async fn ack(&self, receipt: &str) -> Result<()>;

    /// Messages waiting or in flight.
    async fn depth(&self) -> Result<usize>;
}
