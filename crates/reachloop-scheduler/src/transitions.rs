//! Outreach state machine.
//!
//! ```text
//! new ──connect ok──▶ invited ──webhook──▶ accepted ──message ok──▶ done
//!  │                                         │  ▲
//!  └─connect fail─▶ failed ◀──budget spent───┘  └─ message fail (retry)
//!
//! any non-terminal ──pause──▶ paused ──resume──▶ new
//! ```
//!
//! Every function mutates a record in place and returns
//! `ReachError::InvalidTransition` when the record is not in a source state
//! the edge accepts. Persistence goes through [`update_record`].

use chrono::{DateTime, Utc};
use reachloop_core::error::{ReachError, Result};
use reachloop_core::traits::RecordStore;
use reachloop_core::types::{ActionOutcome, OutreachRecord, RecordStatus};

use crate::policy::{MessageRetry, RetryPolicy};

/// Compare-and-set attempts before giving up on a contended record.
pub const MAX_UPDATE_ATTEMPTS: u32 = 3;

fn invalid(record: &OutreachRecord, edge: &str) -> ReachError {
    ReachError::InvalidTransition(format!(
        "'{}' is {}, cannot apply {edge}",
        record.id, record.status
    ))
}

/// Connection consumer result: `new → invited` or `new → failed`.
pub fn apply_connection_outcome(
    record: &mut OutreachRecord,
    outcome: &ActionOutcome,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<()> {
    match record.status {
        RecordStatus::New => {}
        RecordStatus::Invited
        | RecordStatus::Accepted
        | RecordStatus::Done
        | RecordStatus::Failed
        | RecordStatus::Paused => return Err(invalid(record, "connection outcome")),
    }

    if outcome.success {
        record.status = RecordStatus::Invited;
        record.next_action_at = Some(policy.after_connection_success(now));
    } else {
        record.status = RecordStatus::Failed;
        record.last_error = Some(outcome.message.clone());
    }
    Ok(())
}

/// Message consumer result: `accepted → done`, retry in `accepted`, or `failed`.
pub fn apply_message_outcome(
    record: &mut OutreachRecord,
    outcome: &ActionOutcome,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<()> {
    match record.status {
        RecordStatus::Accepted => {}
        RecordStatus::New
        | RecordStatus::Invited
        | RecordStatus::Done
        | RecordStatus::Failed
        | RecordStatus::Paused => return Err(invalid(record, "message outcome")),
    }

    if outcome.success {
        record.status = RecordStatus::Done;
        record.next_action_at = Some(policy.after_message_success(now));
        return Ok(());
    }

    record.retry_count += 1;
    record.last_error = Some(outcome.message.clone());
    match policy.after_message_failure(record.retry_count, now) {
        MessageRetry::RetryAt(at) => {
            record.status = RecordStatus::Accepted;
            record.next_action_at = Some(at);
        }
        MessageRetry::GiveUp => {
            record.status = RecordStatus::Failed;
        }
    }
    Ok(())
}

/// External acceptance signal. Unconditional: duplicate deliveries re-set the same state.
pub fn mark_accepted(record: &mut OutreachRecord, now: DateTime<Utc>) {
    match record.status {
        RecordStatus::Invited | RecordStatus::Accepted => {}
        RecordStatus::New | RecordStatus::Done | RecordStatus::Failed | RecordStatus::Paused => {
            tracing::warn!(
                "⚠️ Acceptance signal for '{}' while {}; marking accepted anyway",
                record.id,
                record.status
            );
        }
    }
    record.status = RecordStatus::Accepted;
    record.next_action_at = Some(now);
}

/// Operator pause: any non-terminal state → `paused`. `nextActionAt` untouched.
pub fn pause(record: &mut OutreachRecord) -> Result<()> {
    match record.status {
        RecordStatus::New | RecordStatus::Invited | RecordStatus::Accepted => {
            record.status = RecordStatus::Paused;
            Ok(())
        }
        RecordStatus::Paused => Ok(()),
        RecordStatus::Done | RecordStatus::Failed => Err(invalid(record, "pause")),
    }
}

/// Operator resume: `paused → new`, immediately eligible.
pub fn resume(record: &mut OutreachRecord, now: DateTime<Utc>) -> Result<()> {
    match record.status {
        RecordStatus::Paused => {
            record.status = RecordStatus::New;
            record.next_action_at = Some(now);
            Ok(())
        }
        RecordStatus::New
        | RecordStatus::Invited
        | RecordStatus::Accepted
        | RecordStatus::Done
        | RecordStatus::Failed => Err(invalid(record, "resume")),
    }
}

/// Read-modify-write a record with optimistic concurrency.
///
/// Re-reads and re-applies `apply` on version conflicts, up to
/// [`MAX_UPDATE_ATTEMPTS`]. A missing record is `NotFound` and is never
/// re-created. Returns the record as persisted.
pub async fn update_record<F>(
    store: &dyn RecordStore,
    id: &str,
    mut apply: F,
) -> Result<OutreachRecord>
where
    F: FnMut(&mut OutreachRecord) -> Result<()> + Send,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut record = store
            .get(id)
            .await?
            .ok_or_else(|| ReachError::NotFound(id.to_string()))?;
        apply(&mut record)?;
        match store.put(&record).await {
            Ok(version) => {
                record.version = version;
                return Ok(record);
            }
            Err(ReachError::Conflict { .. }) if attempt < MAX_UPDATE_ATTEMPTS => {
                tracing::debug!("Version conflict on '{id}', retrying ({attempt})");
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use reachloop_store::MemoryRecordStore;

    fn record(status: RecordStatus) -> OutreachRecord {
        let mut r = OutreachRecord::new("p1", "Pat");
        r.status = status;
        r
    }

    #[test]
    fn test_connection_success() {
        let now = Utc::now();
        let mut r = record(RecordStatus::New);
        apply_connection_outcome(&mut r, &ActionOutcome::ok("sent"), &RetryPolicy::default(), now)
            .unwrap();
        assert_eq!(r.status, RecordStatus::Invited);
        assert_eq!(r.next_action_at, Some(now + Duration::days(1)));
    }

    #[test]
    fn test_connection_failure_is_terminal() {
        let now = Utc::now();
        let mut r = record(RecordStatus::New);
        r.next_action_at = Some(now);
        apply_connection_outcome(
            &mut r,
            &ActionOutcome::failed("button missing"),
            &RetryPolicy::default(),
            now,
        )
        .unwrap();
        assert_eq!(r.status, RecordStatus::Failed);
        assert_eq!(r.last_error.as_deref(), Some("button missing"));
        assert_eq!(r.next_action_at, Some(now));
        assert_eq!(r.retry_count, 0);
    }

    #[test]
    fn test_connection_outcome_on_paused_record_rejected() {
        let mut r = record(RecordStatus::Paused);
        let err = apply_connection_outcome(
            &mut r,
            &ActionOutcome::ok(""),
            &RetryPolicy::default(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, ReachError::InvalidTransition(_)));
        assert_eq!(r.status, RecordStatus::Paused);
    }

    #[test]
    fn test_message_failures_until_budget_spent() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        let mut r = record(RecordStatus::Accepted);
        let fail = ActionOutcome::failed("composer closed");

        for expected in 1..=2 {
            apply_message_outcome(&mut r, &fail, &policy, now).unwrap();
            assert_eq!(r.retry_count, expected);
            assert_eq!(r.status, RecordStatus::Accepted);
            assert_eq!(r.next_action_at, Some(now + Duration::days(3)));
        }

        let before = r.next_action_at;
        apply_message_outcome(&mut r, &fail, &policy, now).unwrap();
        assert_eq!(r.retry_count, 3);
        assert_eq!(r.status, RecordStatus::Failed);
        assert_eq!(r.next_action_at, before);
        assert_eq!(r.last_error.as_deref(), Some("composer closed"));
    }

    #[test]
    fn test_message_success() {
        let now = Utc::now();
        let mut r = record(RecordStatus::Accepted);
        apply_message_outcome(&mut r, &ActionOutcome::ok("sent"), &RetryPolicy::default(), now)
            .unwrap();
        assert_eq!(r.status, RecordStatus::Done);
        assert_eq!(r.next_action_at, Some(now + Duration::days(30)));
    }

    #[test]
    fn test_pause_and_resume() {
        let now = Utc::now();
        let mut r = record(RecordStatus::Invited);
        let later = now + Duration::hours(5);
        r.next_action_at = Some(later);

        pause(&mut r).unwrap();
        assert_eq!(r.status, RecordStatus::Paused);
        assert_eq!(r.next_action_at, Some(later));

        resume(&mut r, now).unwrap();
        assert_eq!(r.status, RecordStatus::New);
        assert_eq!(r.next_action_at, Some(now));

        assert!(resume(&mut r, now).is_err());
        assert!(pause(&mut record(RecordStatus::Done)).is_err());
        assert!(pause(&mut record(RecordStatus::Failed)).is_err());
    }

    #[test]
    fn test_mark_accepted_is_idempotent() {
        let now = Utc::now();
        let mut r = record(RecordStatus::Invited);
        mark_accepted(&mut r, now);
        mark_accepted(&mut r, now);
        assert_eq!(r.status, RecordStatus::Accepted);
        assert_eq!(r.next_action_at, Some(now));
    }

    #[tokio::test]
    async fn test_update_record_persists() {
        let store = MemoryRecordStore::new();
        store.put(&OutreachRecord::new("p1", "Pat")).await.unwrap();

        let updated = update_record(&store, "p1", |r| pause(r)).await.unwrap();
        assert_eq!(updated.status, RecordStatus::Paused);
        assert_eq!(updated.version, 2);
        assert_eq!(
            store.get("p1").await.unwrap().unwrap().status,
            RecordStatus::Paused
        );
    }

    #[tokio::test]
    async fn test_update_record_missing_is_not_recreated() {
        let store = MemoryRecordStore::new();
        let err = update_record(&store, "ghost", |r| pause(r)).await.unwrap_err();
        assert!(matches!(err, ReachError::NotFound(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_update_record_retries_after_conflict() {
        let store = MemoryRecordStore::new();
        store.put(&OutreachRecord::new("p1", "Pat")).await.unwrap();

        let mut calls = 0;
        let updated = update_record(&store, "p1", |r| {
            calls += 1;
            if calls == 1 {
                // A concurrent writer lands between our read and our write.
                let mut other = r.clone();
                other.display_name = "Patricia".into();
                concurrent_write(&store, &other);
            }
            r.retry_count += 1;
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(calls, 2);
        assert_eq!(updated.display_name, "Patricia");
        assert_eq!(updated.retry_count, 1);
    }

    /// Out-of-band write, as another component would do.
    fn concurrent_write(store: &MemoryRecordStore, record: &OutreachRecord) {
        let body = serde_json::to_string(record).unwrap();
        store.put_raw(&record.id, &body).unwrap();
    }
}
