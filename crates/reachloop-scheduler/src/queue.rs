//! In-process work queue — at-least-once delivery without external infrastructure.
//!
//! Ready messages sit in a FIFO; `receive` moves them to an in-flight table
//! under a lease. Expired leases are returned to the front of the FIFO on the
//! next `receive`, with a bumped attempt count.

use async_trait::async_trait;
use reachloop_core::error::Result;
use reachloop_core::traits::{Delivery, WorkQueue};
use reachloop_core::types::{QueueKind, WorkItem};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct Message {
    seq: u64,
    item: WorkItem,
    attempts: u32,
}

struct Lease {
    message: Message,
    expires: Instant,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Message>,
    in_flight: HashMap<String, Lease>,
    next_seq: u64,
    total_sent: u64,
    total_acked: u64,
    total_redelivered: u64,
}

impl QueueState {
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, lease)| lease.expires <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        let mut reclaimed: Vec<Message> = expired
            .into_iter()
            .filter_map(|r| self.in_flight.remove(&r))
            .map(|lease| lease.message)
            .collect();
        // Oldest first back at the head of the line
        reclaimed.sort_by_key(|m| std::cmp::Reverse(m.seq));
        for message in reclaimed {
            self.total_redelivered += 1;
            self.ready.push_front(message);
        }
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub kind: QueueKind,
    pub ready: usize,
    pub in_flight: usize,
    pub total_sent: u64,
    pub total_acked: u64,
    pub total_redelivered: u64,
}

/// Memory-backed [`WorkQueue`].
pub struct MemoryWorkQueue {
    kind: QueueKind,
    visibility_timeout: Duration,
    state: Mutex<QueueState>,
}

impl MemoryWorkQueue {
    pub fn new(kind: QueueKind, visibility_timeout: Duration) -> Self {
        Self {
            kind,
            visibility_timeout,
            state: Mutex::new(QueueState::default()),
        }
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            kind: self.kind,
            ready: state.ready.len(),
            in_flight: state.in_flight.len(),
            total_sent: state.total_sent,
            total_acked: state.total_acked,
            total_redelivered: state.total_redelivered,
        }
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    async fn send(&self, item: &WorkItem) -> Result<()> {
        let mut state = self.state.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.total_sent += 1;
        tracing::debug!(
            "📥 Queue[{}] enqueue: {} (ready: {}, in flight: {})",
            self.kind,
            item.id,
            state.ready.len(),
            state.in_flight.len()
        );
        state.ready.push_back(Message {
            seq,
            item: item.clone(),
            attempts: 0,
        });
        Ok(())
    }

    async fn receive(&self, max: usize) -> Result<Vec<Delivery>> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.reclaim_expired(now);

        let mut out = Vec::new();
        while out.len() < max {
            let Some(mut message) = state.ready.pop_front() else {
                break;
            };
            message.attempts += 1;
            let receipt = format!("{}:{}", message.seq, message.attempts);
            out.push(Delivery {
                receipt: receipt.clone(),
                item: message.item.clone(),
                attempts: message.attempts,
            });
            state.in_flight.insert(
                receipt,
                Lease {
                    message,
                    expires: now + self.visibility_timeout,
                },
            );
        }
        Ok(out)
    }

    async fn ack(&self, receipt: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.in_flight.remove(receipt).is_some() {
            state.total_acked += 1;
        } else {
            tracing::debug!("Ack for stale or unknown receipt {receipt} on {}", self.kind);
        }
        Ok(())
    }

    async fn depth(&self) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state.ready.len() + state.in_flight.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_and_batch_limit() {
        let q = MemoryWorkQueue::new(QueueKind::Message, Duration::from_secs(60));
        for id in ["a", "b", "c"] {
            q.send(&WorkItem::new(id, id)).await.unwrap();
        }
        let batch = q.receive(2).await.unwrap();
        let ids: Vec<_> = batch.iter().map(|d| d.item.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let stats = q.stats().await;
        assert_eq!(stats.ready, 1);
        assert_eq!(stats.in_flight, 2);
    }

    #[tokio::test]
    async fn test_ack_removes_and_second_ack_is_noop() {
        let q = MemoryWorkQueue::new(QueueKind::Connection, Duration::from_secs(60));
        q.send(&WorkItem::new("a", "A")).await.unwrap();
        let d = q.receive(1).await.unwrap().remove(0);
        q.ack(&d.receipt).await.unwrap();
        assert_eq!(q.depth().await.unwrap(), 0);
        q.ack(&d.receipt).await.unwrap();
        assert_eq!(q.stats().await.total_acked, 1);
        assert!(q.receive(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_late_ack_after_redelivery_keeps_message() {
        let q = MemoryWorkQueue::new(QueueKind::Connection, Duration::ZERO);
        q.send(&WorkItem::new("a", "A")).await.unwrap();
        let first = q.receive(1).await.unwrap().remove(0);
        let second = q.receive(1).await.unwrap().remove(0);
        q.ack(&first.receipt).await.unwrap();
        assert_eq!(q.depth().await.unwrap(), 1);
        q.ack(&second.receipt).await.unwrap();
        assert_eq!(q.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expired_lease_redelivered_in_order() {
        let q = MemoryWorkQueue::new(QueueKind::Connection, Duration::ZERO);
        q.send(&WorkItem::new("a", "A")).await.unwrap();
        q.send(&WorkItem::new("b", "B")).await.unwrap();

        let first = q.receive(2).await.unwrap();
        assert_eq!(first.len(), 2);

        let again = q.receive(2).await.unwrap();
        let ids: Vec<_> = again.iter().map(|d| d.item.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(again.iter().all(|d| d.attempts == 2));
        assert_eq!(q.stats().await.total_redelivered, 2);
    }
}
