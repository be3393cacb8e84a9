//! Pipeline data model — records, statuses, and queue work items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ReachError;

/// Current schema version stamped on every work item.
pub const WORK_ITEM_VERSION: u32 = 1;

/// One external profile being pursued through the pipeline.
///
/// Persisted as JSON under key = `id`. `version` is owned by the store:
/// it is bumped on every successful write and used to reject stale writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutreachRecord {
    /// Stable external identifier (primary key).
    pub id: String,
    /// Human-readable label.
    pub display_name: String,
    #[serde(default)]
    pub status: RecordStatus,
    /// Earliest time the scheduler may act. `None` or past = eligible now.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_action_at: Option<DateTime<Utc>>,
    /// Failed attempts; never reset automatically.
    #[serde(default)]
    pub retry_count: u32,
    /// Most recent observability session (weak reference, may have expired).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Optional text forwarded to the executor for the follow-up message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_message: Option<String>,
    #[serde(default)]
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl OutreachRecord {
    /// A fresh record, immediately eligible for a connection attempt.
    pub fn new(id: &str, display_name: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            status: RecordStatus::New,
            next_action_at: None,
            retry_count: 0,
            debug_session_id: None,
            last_error: None,
            custom_message: None,
            version: 0,
            created_at: Some(Utc::now()),
            updated_at: None,
        }
    }

    /// Builder-style custom message.
    pub fn with_custom_message(mut self, message: impl Into<String>) -> Self {
        self.custom_message = Some(message.into());
        self
    }

    /// Check whether the timer gate has opened.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.next_action_at {
            Some(at) => at <= now,
            None => true,
        }
    }

    /// Which queue (if any) the scheduler should dispatch this record to.
    pub fn dispatch_target(&self) -> Option<QueueKind> {
        self.status.dispatch_target()
    }
}

/// Closed set of pipeline states.
///
/// `new → invited → accepted → done`, with `failed` and `paused` as side
/// branches and `paused → new` as the only manual reverse edge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    #[default]
    New,
    Invited,
    Accepted,
    Done,
    Failed,
    Paused,
}

impl RecordStatus {
    /// Terminal with respect to the automatic pipeline.
    pub fn is_terminal(&self) -> bool {
        match self {
            RecordStatus::Done | RecordStatus::Failed => true,
            RecordStatus::New
            | RecordStatus::Invited
            | RecordStatus::Accepted
            | RecordStatus::Paused => false,
        }
    }

    pub fn dispatch_target(&self) -> Option<QueueKind> {
        match self {
            RecordStatus::New => Some(QueueKind::Connection),
            RecordStatus::Accepted => Some(QueueKind::Message),
            RecordStatus::Invited
            | RecordStatus::Done
            | RecordStatus::Failed
            | RecordStatus::Paused => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::New => "new",
            RecordStatus::Invited => "invited",
            RecordStatus::Accepted => "accepted",
            RecordStatus::Done => "done",
            RecordStatus::Failed => "failed",
            RecordStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = ReachError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "new" => Ok(RecordStatus::New),
            "invited" => Ok(RecordStatus::Invited),
            "accepted" => Ok(RecordStatus::Accepted),
            "done" => Ok(RecordStatus::Done),
            "failed" => Ok(RecordStatus::Failed),
            "paused" => Ok(RecordStatus::Paused),
            other => Err(ReachError::InvalidTransition(format!(
                "unknown status '{other}'"
            ))),
        }
    }
}

/// The two downstream work queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    /// "initiate connection" work.
    Connection,
    /// "send follow-up message" work.
    Message,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::Connection => write!(f, "connection"),
            QueueKind::Message => write!(f, "message"),
        }
    }
}

fn default_work_item_version() -> u32 {
    WORK_ITEM_VERSION
}

/// Minimal payload carried between producers (scheduler, webhook) and consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    /// Schema version. Absent on legacy payloads, which decode as v1.
    #[serde(default = "default_work_item_version")]
    pub v: u32,
    pub id: String,
    pub display_name: String,
}

impl WorkItem {
    pub fn new(id: &str, display_name: &str) -> Self {
        Self {
            v: WORK_ITEM_VERSION,
            id: id.to_string(),
            display_name: display_name.to_string(),
        }
    }

    pub fn for_record(record: &OutreachRecord) -> Self {
        Self::new(&record.id, &record.display_name)
    }

    pub fn is_supported_version(&self) -> bool {
        self.v == WORK_ITEM_VERSION
    }
}

/// Outcome reported by the external action executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

impl ActionOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}
