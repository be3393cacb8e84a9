//! Timing and retry policy shared by the scheduler and consumers.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use reachloop_core::config::{PolicyConfig, SchedulerConfig};

/// Decision after a failed follow-up message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRetry {
    /// Stay `accepted`, try again at the given time.
    RetryAt(DateTime<Utc>),
    /// Budget exhausted, record becomes `failed`.
    GiveUp,
}

/// Per-transition delays plus the scheduler's re-arm jitter window.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub invite_followup: Duration,
    pub message_retry_backoff: Duration,
    pub max_message_retries: u32,
    pub done_dormancy: Duration,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default(), &PolicyConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(scheduler: &SchedulerConfig, policy: &PolicyConfig) -> Self {
        Self {
            invite_followup: Duration::days(policy.invite_followup_days),
            message_retry_backoff: Duration::days(policy.message_retry_days),
            max_message_retries: policy.max_message_retries,
            done_dormancy: Duration::days(policy.done_dormancy_days),
            jitter_min: Duration::minutes(scheduler.jitter_min_minutes),
            jitter_max: Duration::minutes(scheduler.jitter_max_minutes),
        }
    }

    /// Re-arm time after a dispatch: uniform in `[now + jitter_min, now + jitter_max]`.
    pub fn jittered_next(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let min = self.jitter_min.num_seconds();
        let max = self.jitter_max.num_seconds().max(min);
        let offset = rand::thread_rng().gen_range(min..=max);
        now + Duration::seconds(offset)
    }

    pub fn after_connection_success(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.invite_followup
    }

    pub fn after_message_success(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.done_dormancy
    }

    /// `retry_count` is the value *after* incrementing for this failure.
    pub fn after_message_failure(&self, retry_count: u32, now: DateTime<Utc>) -> MessageRetry {
        if retry_count <= self.max_message_retries {
            MessageRetry::RetryAt(now + self.message_retry_backoff)
        } else {
            MessageRetry::GiveUp
        }
    }
}
