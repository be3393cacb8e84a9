//! Scheduler engine — the periodic scan that dispatches due records.
//!
//! Each tick lists every record id and, in listing order:
//! skip if not due; skip unless `new` (→ connection queue) or `accepted`
//! (→ message queue); otherwise claim the record by persisting a jittered
//! `nextActionAt` under its version, then send the work item.
//!
//! Claiming before sending means an overlapping tick (or a consumer that just
//! wrote the record) makes our claim fail with a version conflict instead of
//! producing a second dispatch. If the send itself fails the previous
//! `nextActionAt` is restored so the record stays eligible.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use reachloop_core::error::{ReachError, Result};
use reachloop_core::traits::{RecordStore, WorkQueue};
use reachloop_core::types::{OutreachRecord, QueueKind, WorkItem};
use serde::Serialize;
use tokio::sync::watch;

use crate::policy::RetryPolicy;

/// What happened to a single record during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordTick {
    Dispatched(QueueKind),
    NotDue,
    Ineligible,
    Vanished,
    Contended,
}

/// Per-tick counters.
#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct TickReport {
    pub scanned: usize,
    pub dispatched_connection: usize,
    pub dispatched_message: usize,
    pub not_due: usize,
    pub ineligible: usize,
    pub contended: usize,
    pub errors: usize,
}

impl TickReport {
    pub fn dispatched(&self) -> usize {
        self.dispatched_connection + self.dispatched_message
    }
}

/// The scheduler — stateless between ticks apart from each record's `nextActionAt`.
pub struct Scheduler {
    store: Arc<dyn RecordStore>,
    connection_queue: Arc<dyn WorkQueue>,
    message_queue: Arc<dyn WorkQueue>,
    policy: RetryPolicy,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        connection_queue: Arc<dyn WorkQueue>,
        message_queue: Arc<dyn WorkQueue>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            connection_queue,
            message_queue,
            policy,
        }
    }

    fn queue_for(&self, kind: QueueKind) -> &dyn WorkQueue {
        match kind {
            QueueKind::Connection => self.connection_queue.as_ref(),
            QueueKind::Message => self.message_queue.as_ref(),
        }
    }

    /// One pass over the store. Only a failure to list keys fails the tick;
    /// per-record errors are logged and counted.
    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now()).await
    }

    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let ids = self.store.list_keys().await?;
        let mut report = TickReport {
            scanned: ids.len(),
            ..TickReport::default()
        };

        for id in &ids {
            match self.process(id, now).await {
                Ok(RecordTick::Dispatched(QueueKind::Connection)) => {
                    report.dispatched_connection += 1
                }
                Ok(RecordTick::Dispatched(QueueKind::Message)) => report.dispatched_message += 1,
                Ok(RecordTick::NotDue) => report.not_due += 1,
                Ok(RecordTick::Ineligible) | Ok(RecordTick::Vanished) => report.ineligible += 1,
                Ok(RecordTick::Contended) => report.contended += 1,
                Err(e) if e.is_per_record() => {
                    tracing::warn!("⚠️ Scheduler skipped '{id}': {e}");
                    report.errors += 1;
                }
                Err(e) => {
                    tracing::error!("❌ Scheduler failed on '{id}': {e}");
                    report.errors += 1;
                }
            }
        }

        if report.dispatched() > 0 || report.errors > 0 {
            tracing::info!(
                "⏰ Tick: scanned {}, dispatched {} connection / {} message, {} errors",
                report.scanned,
                report.dispatched_connection,
                report.dispatched_message,
                report.errors
            );
        } else {
            tracing::debug!("⏰ Tick: scanned {}, nothing due", report.scanned);
        }
        Ok(report)
    }

    async fn process(&self, id: &str, now: DateTime<Utc>) -> Result<RecordTick> {
        let Some(record) = self.store.get(id).await? else {
            tracing::debug!("Record '{id}' vanished between list and get");
            return Ok(RecordTick::Vanished);
        };

        if !record.is_due(now) {
            return Ok(RecordTick::NotDue);
        }
        let Some(kind) = record.dispatch_target() else {
            return Ok(RecordTick::Ineligible);
        };

        let previous = record.next_action_at;
        let mut claimed = record.clone();
        claimed.next_action_at = Some(self.policy.jittered_next(now));
        match self.store.put(&claimed).await {
            Ok(version) => claimed.version = version,
            Err(ReachError::Conflict { .. }) => {
                tracing::debug!("Record '{id}' changed under us, leaving it to the next tick");
                return Ok(RecordTick::Contended);
            }
            Err(e) => return Err(e),
        }

        let item = WorkItem::for_record(&claimed);
        if let Err(e) = self.queue_for(kind).send(&item).await {
            self.release_claim(claimed, previous).await;
            return Err(e);
        }

        tracing::info!(
            "🔔 Dispatched '{}' ({}) to {kind} queue, next check {}",
            claimed.display_name,
            claimed.id,
            claimed
                .next_action_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_default()
        );
        Ok(RecordTick::Dispatched(kind))
    }

    /// Undo a claim whose send failed so the record is eligible again.
    async fn release_claim(&self, mut claimed: OutreachRecord, previous: Option<DateTime<Utc>>) {
        claimed.next_action_at = previous;
        if let Err(e) = self.store.put(&claimed).await {
            tracing::warn!(
                "⚠️ Could not release claim on '{}', it will wait for its window: {e}",
                claimed.id
            );
        }
    }
}

/// Run the scheduler on a fixed interval until `shutdown` flips to true.
/// A failed tick is logged; the next tick runs regardless.
pub async fn spawn_scheduler(
    scheduler: Arc<Scheduler>,
    every: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("⏰ Scheduler started (tick every {}s)", every.as_secs());
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = scheduler.tick().await {
                    tracing::error!("❌ Scheduler tick failed: {e}");
                }
            }
            _ = shutdown.changed() => {
                tracing::info!("⏰ Scheduler stopping");
                break;
            }
        }
    }
}
