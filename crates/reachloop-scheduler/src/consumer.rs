//! Queue consumers — connection and message workers.
//!
//! For each delivered work item, independently:
//! 1. open an observability session
//! 2. check the record still exists and is in the state this queue acts on
//! 3. run the action inside an execution context (always closed, even on timeout)
//! 4. apply the outcome to the record through the state machine
//! 5. finalize the session
//! 6. ack the delivery, whatever happened
//!
//! Retry lives on the record (`nextActionAt`/`retryCount`), never in queue
//! redelivery, so every delivery is acknowledged. A redelivered item (ack lost,
//! or a crash between the record write and the ack) is dropped once the record
//! shows its outcome was already applied.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reachloop_core::error::{ReachError, Result};
use reachloop_core::traits::{
    ActionContext, ActionExecutor, ActionRequest, Delivery, RecordStore, WorkQueue,
};
use reachloop_core::types::{ActionOutcome, QueueKind, WorkItem};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::policy::RetryPolicy;
use crate::sessions::SessionTracker;
use crate::transitions::{apply_connection_outcome, apply_message_outcome, update_record};

/// Bound on screenshot capture and context release.
const HOUSEKEEPING_TIMEOUT: Duration = Duration::from_secs(15);

/// What became of one work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Action succeeded and the record advanced.
    Succeeded,
    /// Action failed and the failure was recorded.
    Failed,
    /// Nothing to do: unknown version, record gone, or record not in a matching state.
    Skipped,
    /// Store trouble; the record's own timer brings it back.
    Errored,
}

/// Counters for one `run_once` call.
#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errored: usize,
    pub ack_errors: usize,
}

impl BatchReport {
    fn count(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Succeeded => self.succeeded += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Skipped => self.skipped += 1,
            ItemOutcome::Errored => self.errored += 1,
        }
    }
}

/// A worker bound to one queue kind.
pub struct Consumer {
    kind: QueueKind,
    store: Arc<dyn RecordStore>,
    queue: Arc<dyn WorkQueue>,
    executor: Arc<dyn ActionExecutor>,
    sessions: SessionTracker,
    policy: RetryPolicy,
    executor_timeout: Duration,
    default_message: Option<String>,
}

impl Consumer {
    pub fn new(
        store: Arc<dyn RecordStore>,
        queue: Arc<dyn WorkQueue>,
        executor: Arc<dyn ActionExecutor>,
        sessions: SessionTracker,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            kind: queue.kind(),
            store,
            queue,
            executor,
            sessions,
            policy,
            executor_timeout: Duration::from_secs(180),
            default_message: None,
        }
    }

    /// Upper bound on acquiring the context plus running the action.
    pub fn with_executor_timeout(mut self, timeout: Duration) -> Self {
        self.executor_timeout = timeout;
        self
    }

    /// Message text used when a record carries no `customMessage`.
    pub fn with_default_message(mut self, message: Option<String>) -> Self {
        self.default_message = message;
        self
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Receive one batch and process it sequentially.
    /// Only a failing `receive` is an error; everything per-item is counted.
    pub async fn run_once(&self, max: usize) -> Result<BatchReport> {
        let deliveries = self.queue.receive(max).await?;
        let mut report = BatchReport {
            received: deliveries.len(),
            ..BatchReport::default()
        };

        for delivery in deliveries {
            if delivery.attempts > 1 {
                tracing::debug!(
                    "{} queue redelivered '{}' (attempt {})",
                    self.kind,
                    delivery.item.id,
                    delivery.attempts
                );
            }
            let outcome = self.handle_delivery(&delivery).await;
            report.count(outcome);

            if let Err(e) = self.queue.ack(&delivery.receipt).await {
                tracing::warn!("⚠️ Ack failed on {} queue for '{}': {e}", self.kind, delivery.item.id);
                report.ack_errors += 1;
            }
        }

        if report.received > 0 {
            tracing::info!(
                "📨 {} batch: {} received, {} ok, {} failed, {} skipped, {} errored",
                self.kind,
                report.received,
                report.succeeded,
                report.failed,
                report.skipped,
                report.errored
            );
        }
        Ok(report)
    }

    /// Process one item as a first delivery. Never fails; problems become outcomes.
    pub async fn handle(&self, item: &WorkItem) -> ItemOutcome {
        self.process(item, 1).await
    }

    /// Process a leased delivery, dropping redeliveries whose outcome is already on the record.
    pub async fn handle_delivery(&self, delivery: &Delivery) -> ItemOutcome {
        self.process(&delivery.item, delivery.attempts).await
    }

    async fn process(&self, item: &WorkItem, attempts: u32) -> ItemOutcome {
        if !item.is_supported_version() {
            tracing::warn!(
                "⚠️ Dropping {} item '{}' with unsupported schema v{}",
                self.kind,
                item.id,
                item.v
            );
            return ItemOutcome::Skipped;
        }

        let session_id = self.sessions.create();
        self.sessions.append_log(
            &session_id,
            format!("{} action for '{}' ({})", self.kind, item.display_name, item.id),
        );

        let record = match self.store.get(&item.id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::info!("Record '{}' no longer exists, dropping {} item", item.id, self.kind);
                self.sessions.complete(&session_id, Some("record not found"));
                return ItemOutcome::Skipped;
            }
            Err(e) => {
                tracing::warn!("⚠️ Could not load '{}': {e}", item.id);
                self.sessions.complete(&session_id, Some(&e.to_string()));
                return ItemOutcome::Errored;
            }
        };

        if record.dispatch_target() != Some(self.kind) {
            let note = format!("record is {}, nothing to do", record.status);
            tracing::debug!("Skipping {} item '{}': {note}", self.kind, item.id);
            self.sessions.append_log(&session_id, note);
            self.sessions.complete(&session_id, None);
            return ItemOutcome::Skipped;
        }

        if attempts > 1 && self.already_applied(record.next_action_at, Utc::now()) {
            let note = format!(
                "redelivery {attempts}: outcome already recorded, next action at {}",
                record
                    .next_action_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default()
            );
            tracing::info!("🔁 Dropping {} redelivery of '{}': {note}", self.kind, item.id);
            self.sessions.append_log(&session_id, note);
            self.sessions.complete(&session_id, None);
            return ItemOutcome::Skipped;
        }

        let request = ActionRequest {
            record_id: record.id.clone(),
            display_name: record.display_name.clone(),
            custom_message: record
                .custom_message
                .clone()
                .or_else(|| self.default_message.clone()),
        };
        let outcome = self.execute(&session_id, &request).await;
        self.sessions.append_log(
            &session_id,
            format!(
                "executor: {} {}",
                if outcome.success { "success" } else { "failure" },
                outcome.message
            ),
        );

        self.record_outcome(item, &session_id, &outcome).await
    }

    /// Dispatch only ever re-arms a record within the jitter window, so a
    /// `nextActionAt` past it was written by a consumer outcome (follow-up,
    /// message backoff, dormancy) after this item was sent.
    fn already_applied(&self, next_action_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        next_action_at.is_some_and(|next| next > now + self.policy.jitter_max)
    }

    /// Open a context, run the action, capture a screenshot, close.
    /// Timeouts and transport errors become failed outcomes.
    async fn execute(&self, session_id: &str, request: &ActionRequest) -> ActionOutcome {
        let deadline = Instant::now() + self.executor_timeout;
        let timeout_secs = self.executor_timeout.as_secs();

        let mut context = match tokio::time::timeout_at(deadline, self.executor.open(session_id)).await
        {
            Ok(Ok(context)) => context,
            Ok(Err(e)) => return ActionOutcome::failed(format!("could not open context: {e}")),
            Err(_) => return ActionOutcome::failed(ReachError::Timeout(timeout_secs).to_string()),
        };

        let outcome =
            match tokio::time::timeout_at(deadline, context.perform(self.kind, request)).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => ActionOutcome::failed(e.to_string()),
                Err(_) => {
                    tracing::warn!(
                        "⏱️ {} action for '{}' timed out after {timeout_secs}s",
                        self.kind,
                        request.record_id
                    );
                    ActionOutcome::failed(ReachError::Timeout(timeout_secs).to_string())
                }
            };

        self.capture(session_id, context.as_mut(), &outcome).await;

        match tokio::time::timeout(HOUSEKEEPING_TIMEOUT, context.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("⚠️ Closing context for '{}' failed: {e}", request.record_id),
            Err(_) => tracing::warn!("⚠️ Closing context for '{}' timed out", request.record_id),
        }
        outcome
    }

    async fn capture(&self, session_id: &str, context: &mut dyn ActionContext, outcome: &ActionOutcome) {
        let label = format!(
            "{}-{}",
            self.kind,
            if outcome.success { "done" } else { "failed" }
        );
        match tokio::time::timeout(HOUSEKEEPING_TIMEOUT, context.screenshot()).await {
            Ok(Ok(Some(image))) => self.sessions.append_screenshot(session_id, &label, image),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => self
                .sessions
                .append_log(session_id, format!("screenshot unavailable: {e}")),
            Err(_) => self
                .sessions
                .append_log(session_id, "screenshot timed out"),
        }
    }

    async fn record_outcome(
        &self,
        item: &WorkItem,
        session_id: &str,
        outcome: &ActionOutcome,
    ) -> ItemOutcome {
        let now = Utc::now();
        let kind = self.kind;
        let policy = &self.policy;
        let result = update_record(self.store.as_ref(), &item.id, |record| {
            match kind {
                QueueKind::Connection => apply_connection_outcome(record, outcome, policy, now)?,
                QueueKind::Message => apply_message_outcome(record, outcome, policy, now)?,
            }
            record.debug_session_id = Some(session_id.to_string());
            Ok(())
        })
        .await;

        match result {
            Ok(record) => {
                tracing::info!(
                    "{} '{}' ({}) → {}",
                    if outcome.success { "✅" } else { "❌" },
                    record.display_name,
                    record.id,
                    record.status
                );
                if outcome.success {
                    self.sessions.complete(session_id, None);
                    ItemOutcome::Succeeded
                } else {
                    self.sessions.complete(session_id, Some(&outcome.message));
                    ItemOutcome::Failed
                }
            }
            Err(ReachError::NotFound(_)) => {
                tracing::info!("Record '{}' deleted during action, dropping update", item.id);
                self.sessions.complete(session_id, Some("record deleted during action"));
                ItemOutcome::Skipped
            }
            Err(e @ ReachError::InvalidTransition(_)) => {
                tracing::warn!("⚠️ Record '{}' moved on during action: {e}", item.id);
                self.sessions.complete(session_id, Some(&e.to_string()));
                ItemOutcome::Skipped
            }
            Err(e) => {
                tracing::warn!("⚠️ Could not record {} outcome for '{}': {e}", kind, item.id);
                self.sessions.complete(session_id, Some(&e.to_string()));
                ItemOutcome::Errored
            }
        }
    }
}

/// Poll the consumer's queue until `shutdown` flips. Sleeps only when a batch comes back empty.
pub async fn spawn_consumer(
    consumer: Arc<Consumer>,
    batch_size: usize,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("📨 {} consumer started (batch {batch_size})", consumer.kind());
    loop {
        if *shutdown.borrow() {
            break;
        }
        let idle = match consumer.run_once(batch_size).await {
            Ok(report) => report.received == 0,
            Err(e) => {
                tracing::error!("❌ {} queue receive failed: {e}", consumer.kind());
                true
            }
        };
        if idle {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.changed() => break,
            }
        }
    }
    tracing::info!("📨 {} consumer stopping", consumer.kind());
}
